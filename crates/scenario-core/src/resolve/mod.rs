//! Candidate resolution: distance and rule culling, then MX resolution.
//!
//! Everything in this module is a pure computation over borrowed reference
//! tables and owned candidate lists.

pub mod cull;
pub mod geo;
pub mod mx;
pub mod rules;
