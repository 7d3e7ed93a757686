//! Python bindings: a JSON-in / JSON-out wrapper around [`StudySession`].

use std::path::PathBuf;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::StudyParameters;
use crate::errors::ScenarioError;
use crate::models::{ExternalRecord, Facility, SearchType, SourceId, StudyType};
use crate::resolve::rules::RuleTable;
use crate::scenario::assembler::AddRequest;
use crate::scenario::session::{StudySession, StudyState};
use crate::store::database::SqliteStudyStore;

fn parse_enum<T: DeserializeOwned>(what: &str, value: &str) -> PyResult<T> {
    serde_json::from_value(Value::String(value.to_string()))
        .map_err(|_| PyValueError::new_err(format!("unknown {what} '{value}'")))
}

fn source_id(raw: u16) -> PyResult<SourceId> {
    SourceId::new(raw).ok_or_else(|| PyValueError::new_err("source id 0 is reserved"))
}

fn reference_tables(
    rules_json: Option<&str>,
    parameters_json: Option<&str>,
) -> PyResult<(Option<RuleTable>, Option<StudyParameters>)> {
    let rules = rules_json.map(RuleTable::from_json_str).transpose()?;
    let parameters = parameters_json
        .map(|text| StudyParameters::from_json_str(text).map(StudyParameters::with_env_overrides))
        .transpose()?;
    Ok((rules, parameters))
}

fn open_store(db_path: PathBuf) -> PyResult<SqliteStudyStore> {
    let store = SqliteStudyStore::new(db_path)?;
    store.init_schema()?;
    Ok(store)
}

#[pyclass(name = "StudySession")]
pub struct PyStudySession {
    inner: StudySession,
}

#[pymethods]
impl PyStudySession {
    #[new]
    #[pyo3(signature = (study_type, rules_json=None, parameters_json=None))]
    fn new(
        study_type: &str,
        rules_json: Option<&str>,
        parameters_json: Option<&str>,
    ) -> PyResult<Self> {
        let study_type: StudyType = parse_enum("study type", study_type)?;
        let (rules, parameters) = reference_tables(rules_json, parameters_json)?;
        let mut state = StudyState::new(study_type);
        if let Some(rules) = rules {
            state = state.with_rules(rules);
        }
        if let Some(parameters) = parameters {
            state = state.with_parameters(parameters);
        }
        Ok(Self {
            inner: StudySession::new(state),
        })
    }

    #[staticmethod]
    #[pyo3(signature = (db_path, rules_json=None, parameters_json=None))]
    fn load(
        db_path: PathBuf,
        rules_json: Option<&str>,
        parameters_json: Option<&str>,
    ) -> PyResult<Self> {
        let store = open_store(db_path)?;
        let (rules, parameters) = reference_tables(rules_json, parameters_json)?;
        Ok(Self {
            inner: StudySession::load(&store, rules, parameters)?,
        })
    }

    fn add_scenario(&self, key: i32, name: &str) -> bool {
        self.inner.add_scenario(key, name)
    }

    /// Add a JSON array of external records. Flags default to those of the
    /// search type.
    #[pyo3(signature = (key, records_json, search="undesireds", desired=None, undesired=None))]
    fn add_records(
        &self,
        py: Python<'_>,
        key: i32,
        records_json: &str,
        search: &str,
        desired: Option<bool>,
        undesired: Option<bool>,
    ) -> PyResult<usize> {
        let records: Vec<ExternalRecord> = serde_json::from_str(records_json)
            .map_err(|e| PyValueError::new_err(format!("invalid records: {e}")))?;
        let mut request = match parse_enum::<SearchType>("search type", search)? {
            SearchType::Desireds => AddRequest::desireds(),
            SearchType::Undesireds => AddRequest::undesireds(),
            SearchType::Protecteds => AddRequest::protecteds(),
        };
        request.desired = desired.unwrap_or(request.desired);
        request.undesired = undesired.unwrap_or(request.undesired);
        let added = py.allow_threads(|| self.inner.add_records(key, records, request))?;
        Ok(added)
    }

    #[pyo3(signature = (key, user_record_id, facility_json, desired=false, undesired=true))]
    fn add_user_record(
        &self,
        key: i32,
        user_record_id: i64,
        facility_json: &str,
        desired: bool,
        undesired: bool,
    ) -> PyResult<Option<u16>> {
        let facility: Facility = serde_json::from_str(facility_json)
            .map_err(|e| PyValueError::new_err(format!("invalid facility: {e}")))?;
        let id = self
            .inner
            .add_user_record(key, user_record_id, facility, desired, undesired)?;
        Ok(id.map(SourceId::get))
    }

    fn replicate(&self, key: i32, source: u16, channel: i32) -> PyResult<u16> {
        let id = self.inner.replicate(key, source_id(source)?, channel)?;
        Ok(id.get())
    }

    fn unlock_source(&self, key: i32, source: u16) -> PyResult<u16> {
        let id = self.inner.unlock_source(key, source_id(source)?)?;
        Ok(id.get())
    }

    fn set_item_flags(&self, key: i32, source: u16, desired: bool, undesired: bool) -> PyResult<()> {
        self.inner
            .set_item_flags(key, source_id(source)?, desired, undesired)?;
        Ok(())
    }

    fn mark_permanent(&self, key: i32, source: u16) -> PyResult<()> {
        self.inner.mark_permanent(key, source_id(source)?)?;
        Ok(())
    }

    /// Scenario items as a JSON array.
    fn scenario_items(&self, key: i32) -> PyResult<String> {
        let items = self.inner.scenario_items(key)?;
        let json = serde_json::to_string(&items).map_err(ScenarioError::from)?;
        Ok(json)
    }

    /// Scenario items with their sources as a JSON array of
    /// `{"item": …, "source": …}` objects.
    fn scenario_sources(&self, key: i32) -> PyResult<String> {
        let rows: Vec<Value> = self
            .inner
            .scenario_sources(key)?
            .into_iter()
            .map(|(item, source)| serde_json::json!({ "item": item, "source": source }))
            .collect();
        Ok(Value::Array(rows).to_string())
    }

    fn purge_unreferenced(&self) -> usize {
        self.inner.purge_unreferenced()
    }

    fn save(&self, db_path: PathBuf) -> PyResult<usize> {
        let store = open_store(db_path)?;
        Ok(self.inner.save(&store)?)
    }
}
