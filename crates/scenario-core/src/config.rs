//! Study configuration consumed by the culling and MX components.
//!
//! Everything here is read-only input supplied by the containing study. The
//! structures deserialize from JSON so a study can hand over its parameter
//! block as a document; missing fields fall back to the defaults below.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{Band, Country};

/// Kilometres per degree of arc used when no study context is available.
pub const DEFAULT_KM_PER_DEGREE: f64 = 111.15;

/// Rule extra distance applied when no study context is available.
pub const DEFAULT_RULE_EXTRA_DISTANCE_KM: f64 = 100.0;

pub const DEFAULT_MAX_RULE_EXTRA_DISTANCE_KM: f64 = 500.0;

pub const DEFAULT_CO_CHANNEL_MX_DISTANCE_KM: f64 = 5.0;

const ENV_MX_CHECK: &str = "SCENARIO_MX_CHECK";
const ENV_USE_MAX_RULE_EXTRA: &str = "SCENARIO_USE_MAX_RULE_EXTRA";

// ---------------------------------------------------------------------------
// Curve parameters
// ---------------------------------------------------------------------------

/// Service contour level for a service type, optionally narrowed to one
/// station class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContourLevel {
    pub service_type: i32,
    #[serde(default)]
    pub station_class: Option<String>,
    pub level_dbu: f64,
}

/// Country-specific propagation curve set.
///
/// Field strength at distance `d` km for a station of `erp` dBk on band `b`:
/// `reference_field_dbu + erp + band_offset(b) - decay_db_per_decade * log10(d)`.
/// The reference is the UHF digital curve, so `band_offsets_db` carries each
/// band's difference from it and UHF defaults to zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurveParameters {
    pub reference_field_dbu: f64,
    pub decay_db_per_decade: f64,
    #[serde(default)]
    pub band_offsets_db: HashMap<Band, f64>,
    #[serde(default)]
    pub contour_levels: Vec<ContourLevel>,
}

impl CurveParameters {
    pub fn band_offset(&self, band: Band) -> f64 {
        self.band_offsets_db.get(&band).copied().unwrap_or(0.0)
    }

    /// Contour level for a service type and class. A class-specific entry
    /// wins over a class-less entry for the same service type.
    pub fn contour_level(&self, service_type: i32, station_class: Option<&str>) -> Option<f64> {
        let mut fallback = None;
        for level in self
            .contour_levels
            .iter()
            .filter(|l| l.service_type == service_type)
        {
            match (level.station_class.as_deref(), station_class) {
                (Some(a), Some(b)) if a == b => return Some(level.level_dbu),
                (None, _) => fallback = Some(level.level_dbu),
                _ => {}
            }
        }
        fallback
    }
}

// ---------------------------------------------------------------------------
// StudyParameters
// ---------------------------------------------------------------------------

/// Study-level parameters for culling and MX resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyParameters {
    pub km_per_degree: f64,
    pub check_mx: bool,
    pub co_channel_mx_distance_km: f64,
    pub use_max_rule_extra_distance: bool,
    pub max_rule_extra_distance_km: f64,
    pub default_rule_extra_distance_km: f64,
    pub curves: HashMap<Country, CurveParameters>,
}

impl Default for StudyParameters {
    fn default() -> Self {
        Self {
            km_per_degree: DEFAULT_KM_PER_DEGREE,
            check_mx: true,
            co_channel_mx_distance_km: DEFAULT_CO_CHANNEL_MX_DISTANCE_KM,
            use_max_rule_extra_distance: false,
            max_rule_extra_distance_km: DEFAULT_MAX_RULE_EXTRA_DISTANCE_KM,
            default_rule_extra_distance_km: DEFAULT_RULE_EXTRA_DISTANCE_KM,
            curves: HashMap::new(),
        }
    }
}

impl StudyParameters {
    pub fn from_json_str(text: &str) -> ScenarioResult<Self> {
        let params: StudyParameters = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_path(path: &Path) -> ScenarioResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject parameter blocks the distance computations cannot use.
    pub fn validate(&self) -> ScenarioResult<()> {
        if !(self.km_per_degree.is_finite() && self.km_per_degree > 0.0) {
            return Err(ScenarioError::Config(format!(
                "km_per_degree must be positive, got {}",
                self.km_per_degree
            )));
        }
        for (name, value) in [
            ("co_channel_mx_distance_km", self.co_channel_mx_distance_km),
            ("max_rule_extra_distance_km", self.max_rule_extra_distance_km),
            (
                "default_rule_extra_distance_km",
                self.default_rule_extra_distance_km,
            ),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ScenarioError::Config(format!(
                    "{name} must be a non-negative distance, got {value}"
                )));
            }
        }
        for (country, curves) in &self.curves {
            if !(curves.decay_db_per_decade.is_finite() && curves.decay_db_per_decade > 0.0) {
                return Err(ScenarioError::Config(format!(
                    "curve decay for {country:?} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Apply `SCENARIO_MX_CHECK` and `SCENARIO_USE_MAX_RULE_EXTRA` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(flag) = env_flag(ENV_MX_CHECK) {
            self.check_mx = flag;
        }
        if let Some(flag) = env_flag(ENV_USE_MAX_RULE_EXTRA) {
            self.use_max_rule_extra_distance = flag;
        }
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
