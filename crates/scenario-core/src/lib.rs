//! Scenario core library: source resolution for broadcast interference studies.
//!
//! This crate turns candidate station records found by an external search
//! into scenario memberships. It owns the compact source identity registry,
//! the canonical record store with its sharing index, distance and rule
//! culling, mutual-exclusivity resolution and the scenario assembler that
//! drives them. With the `python` feature it is also built as a Python
//! extension module (`_scenario_core`) via PyO3.

pub mod config;
pub mod errors;
pub mod models;
pub mod resolve;
pub mod scenario;
pub mod store;

#[cfg(feature = "python")]
mod python;

#[cfg(feature = "python")]
use pyo3::prelude::*;

// ---------------------------------------------------------------------------
// Top-level Python module: _scenario_core
// ---------------------------------------------------------------------------

#[cfg(feature = "python")]
#[pymodule]
fn _scenario_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyStudySession>()?;

    m.add("MAX_SOURCE_ID", models::MAX_SOURCE_ID)?;
    m.add("SCHEMA_VERSION", store::schema::SCHEMA_VERSION)?;
    m.add("DEFAULT_KM_PER_DEGREE", config::DEFAULT_KM_PER_DEGREE)?;

    Ok(())
}
