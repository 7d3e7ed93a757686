//! Study editing session.
//!
//! A session owns the registry, record store and scenarios of one study
//! behind a single mutex; each operation holds the lock for its whole
//! duration.

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::StudyParameters;
use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{ExternalRecord, Facility, Source, SourceId, SourceListItem, StudyType};
use crate::resolve::rules::RuleTable;
use crate::scenario::assembler::{self, AddRequest};
use crate::scenario::membership::Scenario;
use crate::store::database::{StudyPersistence, StudySnapshot};
use crate::store::records::SourceStore;
use crate::store::registry::IdRegistry;

/// Mutable state of one study.
#[derive(Debug)]
pub struct StudyState {
    pub(crate) study_type: StudyType,
    pub(crate) registry: IdRegistry,
    pub(crate) store: SourceStore,
    pub(crate) scenarios: IndexMap<i32, Scenario>,
    pub(crate) rules: Option<RuleTable>,
    pub(crate) parameters: Option<StudyParameters>,
}

impl StudyState {
    pub fn new(study_type: StudyType) -> Self {
        Self {
            study_type,
            registry: IdRegistry::new(),
            store: SourceStore::new(),
            scenarios: IndexMap::new(),
            rules: None,
            parameters: None,
        }
    }

    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_parameters(mut self, parameters: StudyParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn study_type(&self) -> StudyType {
        self.study_type
    }

    pub fn store(&self) -> &SourceStore {
        &self.store
    }

    pub fn registry(&self) -> &IdRegistry {
        &self.registry
    }

    pub fn scenario(&self, key: i32) -> Option<&Scenario> {
        self.scenarios.get(&key)
    }

    fn scenario_mut(&mut self, key: i32) -> ScenarioResult<&mut Scenario> {
        self.scenarios
            .get_mut(&key)
            .ok_or(ScenarioError::UnknownScenario(key))
    }

    fn snapshot(&self) -> StudySnapshot {
        StudySnapshot {
            study_type: self.study_type,
            sources: self.store.iter().cloned().collect(),
            scenarios: self.scenarios.values().map(Scenario::to_record).collect(),
        }
    }

    fn from_snapshot(snapshot: StudySnapshot) -> Self {
        let mut state = Self::new(snapshot.study_type);
        for source in snapshot.sources {
            state.store.put(source);
        }
        state.store.rebuild_index();
        state.registry.rebuild(state.store.ids());

        for record in snapshot.scenarios {
            let mut scenario = Scenario::from_record(record);
            let dropped = scenario.retain_sources(|id| state.store.contains(id));
            if dropped > 0 {
                warn!("Dropped {} scenario {} items for missing sources", dropped, scenario.key);
            }
            state.scenarios.insert(scenario.key, scenario);
        }
        state
    }
}

/// Editing session for one study.
#[derive(Debug)]
pub struct StudySession {
    state: Mutex<StudyState>,
}

impl StudySession {
    pub fn new(state: StudyState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Restore a session from persisted state. Reference tables are not
    /// persisted with the study and are supplied by the caller.
    pub fn load(
        persistence: &impl StudyPersistence,
        rules: Option<RuleTable>,
        parameters: Option<StudyParameters>,
    ) -> ScenarioResult<Self> {
        let mut state = StudyState::from_snapshot(persistence.read_study()?);
        state.rules = rules;
        state.parameters = parameters;
        info!(
            "Loaded study: {} sources, {} scenarios",
            state.store.len(),
            state.scenarios.len()
        );
        Ok(Self::new(state))
    }

    /// Write the study through `persistence`, then rebuild the registry from
    /// the ids that are now durable. Returns the number of live sources.
    pub fn save(&self, persistence: &impl StudyPersistence) -> ScenarioResult<usize> {
        let mut state = self.state.lock();
        let live = persistence.write_study(&state.snapshot())?;
        let count = live.len();
        state.registry.rebuild(live);
        info!("Saved study: {count} sources, {} ids in use", state.registry.in_use_count());
        Ok(count)
    }

    /// Run `f` with shared access to the study state.
    pub fn with_state<R>(&self, f: impl FnOnce(&StudyState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn set_rules(&self, rules: RuleTable) {
        self.state.lock().rules = Some(rules);
    }

    pub fn set_parameters(&self, parameters: StudyParameters) {
        self.state.lock().parameters = Some(parameters);
    }

    /// Create an empty scenario. Returns `false` if the key is taken.
    pub fn add_scenario(&self, key: i32, name: &str) -> bool {
        let mut state = self.state.lock();
        if state.scenarios.contains_key(&key) {
            return false;
        }
        state.scenarios.insert(key, Scenario::new(key, name));
        true
    }

    pub fn scenario_items(&self, key: i32) -> ScenarioResult<Vec<SourceListItem>> {
        let state = self.state.lock();
        let scenario = state
            .scenarios
            .get(&key)
            .ok_or(ScenarioError::UnknownScenario(key))?;
        Ok(scenario.items().copied().collect())
    }

    /// Scenario members with their resolved sources, in scenario order.
    pub fn scenario_sources(&self, key: i32) -> ScenarioResult<Vec<(SourceListItem, Source)>> {
        let state = self.state.lock();
        let scenario = state
            .scenarios
            .get(&key)
            .ok_or(ScenarioError::UnknownScenario(key))?;
        scenario
            .items()
            .map(|item| {
                state
                    .store
                    .get(item.source_id)
                    .map(|source| (*item, source.clone()))
                    .ok_or(ScenarioError::UnknownSource(item.source_id))
            })
            .collect()
    }

    pub fn source(&self, id: SourceId) -> Option<Source> {
        self.state.lock().store.get(id).cloned()
    }

    // -- assembly ----------------------------------------------------------

    pub fn add_records(
        &self,
        key: i32,
        records: Vec<ExternalRecord>,
        request: AddRequest,
    ) -> ScenarioResult<usize> {
        assembler::add_to_scenario(&mut self.state.lock(), key, records, request)
    }

    pub fn add_user_record(
        &self,
        key: i32,
        user_record_id: i64,
        facility: Facility,
        desired: bool,
        undesired: bool,
    ) -> ScenarioResult<Option<SourceId>> {
        assembler::add_user_record(
            &mut self.state.lock(),
            key,
            user_record_id,
            facility,
            desired,
            undesired,
        )
    }

    pub fn create_source(
        &self,
        key: i32,
        facility: Facility,
        desired: bool,
        undesired: bool,
    ) -> ScenarioResult<Option<SourceId>> {
        assembler::create_source(&mut self.state.lock(), key, facility, desired, undesired)
    }

    pub fn edit_source<F>(&self, id: SourceId, edit: F) -> ScenarioResult<()>
    where
        F: FnOnce(&mut Facility),
    {
        assembler::edit_source(&mut self.state.lock(), id, edit)
    }

    pub fn unlock_source(&self, key: i32, id: SourceId) -> ScenarioResult<SourceId> {
        assembler::unlock_source(&mut self.state.lock(), key, id)
    }

    pub fn replicate(&self, key: i32, id: SourceId, channel: i32) -> ScenarioResult<SourceId> {
        assembler::replicate(&mut self.state.lock(), key, id, channel)
    }

    pub fn purge_unreferenced(&self) -> usize {
        assembler::purge_unreferenced(&mut self.state.lock())
    }

    // -- item editing ------------------------------------------------------

    pub fn set_item_flags(
        &self,
        key: i32,
        id: SourceId,
        is_desired: bool,
        is_undesired: bool,
    ) -> ScenarioResult<()> {
        self.state
            .lock()
            .scenario_mut(key)?
            .set_flags(id, is_desired, is_undesired)
    }

    pub fn remove_item(&self, key: i32, id: SourceId) -> ScenarioResult<SourceListItem> {
        self.state.lock().scenario_mut(key)?.remove(id)
    }

    pub fn mark_permanent(&self, key: i32, id: SourceId) -> ScenarioResult<()> {
        self.state.lock().scenario_mut(key)?.mark_permanent(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{fm_facility, record, tv_facility};
    use crate::models::GeoPoint;
    use crate::resolve::rules::InterferenceRule;
    use crate::store::database::SqliteStudyStore;

    fn rules() -> RuleTable {
        RuleTable::new(vec![InterferenceRule {
            desired_service_type: 1,
            undesired_service_type: 20,
            channel_delta: 202,
            distance_km: 80.0,
            is_active: true,
        }])
        .unwrap()
    }

    fn session() -> StudySession {
        let session = StudySession::new(StudyState::new(StudyType::Tv6Fm).with_rules(rules()));
        assert!(session.add_scenario(1, "Base"));
        assert!(!session.add_scenario(1, "Again"));
        let here = GeoPoint::new(40.0, -90.0);
        let desired = record(1, "TV6", tv_facility(6, here));
        session
            .add_records(1, vec![desired], AddRequest::desireds())
            .unwrap();
        let near = record(2, "F1", fm_facility(9, 208, GeoPoint::new(40.2, -90.0)));
        session
            .add_records(1, vec![near], AddRequest::undesireds())
            .unwrap();
        session
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteStudyStore::new(dir.path().join("study.db")).unwrap();
        db.init_schema().unwrap();

        let session = session();
        assert_eq!(session.save(&db).unwrap(), 2);

        let loaded = StudySession::load(&db, Some(rules()), None).unwrap();
        assert_eq!(loaded.scenario_items(1).unwrap(), session.scenario_items(1).unwrap());
        let sources = loaded.scenario_sources(1).unwrap();
        assert_eq!(sources.len(), 2);
        for (item, source) in &sources {
            assert_eq!(session.source(item.source_id).as_ref(), Some(source));
        }
        loaded.with_state(|state| {
            assert_eq!(state.registry().in_use_count(), 2);
            assert_eq!(state.store().index().entries().len(), 2);
        });
    }

    #[test]
    fn save_releases_ids_of_purged_sources() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteStudyStore::new(dir.path().join("study.db")).unwrap();
        db.init_schema().unwrap();

        let session = session();
        let items = session.scenario_items(1).unwrap();
        let fm_id = items.iter().find(|i| !i.is_desired).unwrap().source_id;
        session.remove_item(1, fm_id).unwrap();
        assert_eq!(session.purge_unreferenced(), 1);
        session.with_state(|state| assert!(state.registry().is_in_use(fm_id)));

        assert_eq!(session.save(&db).unwrap(), 1);
        session.with_state(|state| {
            assert!(!state.registry().is_in_use(fm_id));
            assert_eq!(state.registry().in_use_count(), 1);
        });
    }

    #[test]
    fn item_editing_respects_permanence() {
        let session = session();
        let desired = session.scenario_items(1).unwrap()[0].source_id;
        session.set_item_flags(1, desired, true, false).unwrap();
        session.mark_permanent(1, desired).unwrap();
        assert!(matches!(
            session.set_item_flags(1, desired, false, true),
            Err(ScenarioError::PermanentEntry(_))
        ));
        assert!(matches!(
            session.remove_item(1, desired),
            Err(ScenarioError::PermanentEntry(_))
        ));
        assert!(matches!(
            session.scenario_items(9),
            Err(ScenarioError::UnknownScenario(9))
        ));
        let item = session.scenario_items(1).unwrap()[0];
        assert!(item.is_desired && !item.is_undesired && item.is_permanent);
    }
}
