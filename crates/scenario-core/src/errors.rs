//! Error types for the scenario core library.

#[cfg(feature = "python")]
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
#[cfg(feature = "python")]
use pyo3::PyErr;

use crate::models::SourceId;

/// Top-level error enum for the scenario core library.
///
/// "Nothing to add" outcomes are never errors; they are reported as `Ok(0)`
/// by the assembler.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Source identifier range exhausted, no free id in 1..=65535")]
    Exhausted,

    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("Cannot derive source from record {dataset_id}/{record_id}: {reason}")]
    DerivationFailed {
        dataset_id: i32,
        record_id: String,
        reason: String,
    },

    #[error("Scenario entry for source {0} is permanent")]
    PermanentEntry(SourceId),

    #[error("Source {0} is locked")]
    LockedSource(SourceId),

    #[error("Invalid source {0}: {1}")]
    InvalidSource(SourceId, String),

    #[error("Unknown source {0}")]
    UnknownSource(SourceId),

    #[error("Unknown scenario {0}")]
    UnknownScenario(i32),

    #[error("Record type mismatch: {0}")]
    RecordTypeMismatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScenarioError {
    pub(crate) fn derivation(dataset_id: i32, record_id: &str, reason: impl Into<String>) -> Self {
        ScenarioError::DerivationFailed {
            dataset_id,
            record_id: record_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "python")]
impl From<ScenarioError> for PyErr {
    fn from(err: ScenarioError) -> PyErr {
        match &err {
            ScenarioError::Database(_) | ScenarioError::Sqlite(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            ScenarioError::Exhausted | ScenarioError::MissingPrerequisite(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            ScenarioError::Io(_) => PyIOError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

pub type ScenarioResult<T> = Result<T, ScenarioError>;
