//! Interference rule table and the per-station rule extra distance.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{StudyParameters, DEFAULT_RULE_EXTRA_DISTANCE_KM};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{Facility, FacilityKind};

/// One interference rule: undesired stations of `undesired_service_type`
/// at `channel_delta` from a desired station of `desired_service_type`
/// must be considered out to `distance_km`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterferenceRule {
    pub desired_service_type: i32,
    pub undesired_service_type: i32,
    pub channel_delta: i32,
    pub distance_km: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

type RuleKey = (i32, i32, i32);

/// Read-only rule table with the per-delta culling distances precomputed.
#[derive(Clone, Debug, Default)]
pub struct RuleTable {
    rules: Vec<InterferenceRule>,
    max_distance: HashMap<RuleKey, f64>,
}

impl RuleTable {
    pub fn new(rules: Vec<InterferenceRule>) -> ScenarioResult<Self> {
        let mut max_distance: HashMap<RuleKey, f64> = HashMap::new();
        for rule in &rules {
            if !(rule.distance_km.is_finite() && rule.distance_km >= 0.0) {
                return Err(ScenarioError::Config(format!(
                    "rule distance must be non-negative, got {} for delta {}",
                    rule.distance_km, rule.channel_delta
                )));
            }
            if !rule.is_active {
                continue;
            }
            let key = (
                rule.desired_service_type,
                rule.undesired_service_type,
                rule.channel_delta,
            );
            let entry = max_distance.entry(key).or_insert(rule.distance_km);
            *entry = entry.max(rule.distance_km);
        }
        Ok(Self {
            rules,
            max_distance,
        })
    }

    pub fn from_json_str(text: &str) -> ScenarioResult<Self> {
        let rules: Vec<InterferenceRule> = serde_json::from_str(text)?;
        Self::new(rules)
    }

    pub fn from_path(path: &Path) -> ScenarioResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn rules(&self) -> &[InterferenceRule] {
        &self.rules
    }

    /// Largest active rule distance for a service-type pair at `delta`, or
    /// `None` when no rule covers that delta.
    pub fn max_distance(
        &self,
        desired_service_type: i32,
        undesired_service_type: i32,
        delta: i32,
    ) -> Option<f64> {
        self.max_distance
            .get(&(desired_service_type, undesired_service_type, delta))
            .copied()
    }

    pub fn has_active_rules(&self) -> bool {
        !self.max_distance.is_empty()
    }
}

/// Channel delta (undesired minus desired) between two facilities, or `None`
/// when the pairing has no channel relationship. Wireless undesireds are
/// studied against the desired TV channel itself.
pub fn channel_delta(desired: &Facility, undesired: &Facility) -> Option<i32> {
    match (&desired.kind, &undesired.kind) {
        (FacilityKind::Wireless { .. }, _) => None,
        (FacilityKind::Tv { .. }, FacilityKind::Wireless { .. }) => Some(0),
        (FacilityKind::Fm { .. }, FacilityKind::Wireless { .. }) => None,
        _ => Some(undesired.channel()? - desired.channel()?),
    }
}

/// Station-specific distance added to the rule distance.
///
/// This is the distance at which the station's field, on its country's curve
/// set, falls to the service contour level for its service type and class.
/// Band offsets put every signal class on the UHF digital reference basis.
/// Without a study context the fixed default applies; with the "use
/// maximum" option set the study maximum applies.
pub fn rule_extra_distance(facility: &Facility, params: Option<&StudyParameters>) -> f64 {
    let Some(params) = params else {
        return DEFAULT_RULE_EXTRA_DISTANCE_KM;
    };
    if params.use_max_rule_extra_distance {
        return params.max_rule_extra_distance_km;
    }
    let Some(curves) = params.curves.get(&facility.country) else {
        return params.default_rule_extra_distance_km;
    };

    let class = match &facility.kind {
        FacilityKind::Fm { station_class, .. } => Some(station_class.as_str()),
        FacilityKind::Tv { .. } => Some(facility.service.code.as_str()),
        FacilityKind::Wireless { .. } => None,
    };
    let Some(contour) = curves.contour_level(facility.service.service_type, class) else {
        return params.default_rule_extra_distance_km;
    };

    let erp_dbk = 10.0 * facility.erp_kw.max(f64::MIN_POSITIVE).log10();
    let margin = curves.reference_field_dbu + erp_dbk + curves.band_offset(facility.band()) - contour;
    let distance = 10f64.powf(margin / curves.decay_db_per_decade);
    if !distance.is_finite() {
        return params.max_rule_extra_distance_km;
    }
    distance.clamp(0.0, params.max_rule_extra_distance_km)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContourLevel, CurveParameters};
    use crate::models::fixtures::{fm_facility, tv_facility};
    use crate::models::{Band, Country, GeoPoint};

    fn rule(delta: i32, distance_km: f64) -> InterferenceRule {
        InterferenceRule {
            desired_service_type: 1,
            undesired_service_type: 20,
            channel_delta: delta,
            distance_km,
            is_active: true,
        }
    }

    fn curve_params() -> StudyParameters {
        let mut band_offsets_db = HashMap::new();
        band_offsets_db.insert(Band::Fm, -10.0);
        let mut params = StudyParameters::default();
        params.curves.insert(
            Country::Us,
            CurveParameters {
                reference_field_dbu: 100.0,
                decay_db_per_decade: 40.0,
                band_offsets_db,
                contour_levels: vec![
                    ContourLevel {
                        service_type: 20,
                        station_class: Some("B".to_string()),
                        level_dbu: 60.0,
                    },
                    ContourLevel {
                        service_type: 1,
                        station_class: None,
                        level_dbu: 40.0,
                    },
                ],
            },
        );
        params
    }

    #[test]
    fn culling_distance_is_max_over_shared_delta() {
        let table = RuleTable::new(vec![rule(2, 50.0), rule(2, 80.0), rule(3, 10.0)]).unwrap();
        assert_eq!(table.max_distance(1, 20, 2), Some(80.0));
        assert_eq!(table.max_distance(1, 20, 3), Some(10.0));
        assert_eq!(table.max_distance(1, 20, 5), None);
        assert_eq!(table.max_distance(2, 20, 2), None);
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut off = rule(2, 500.0);
        off.is_active = false;
        let table = RuleTable::new(vec![rule(2, 50.0), off]).unwrap();
        assert_eq!(table.max_distance(1, 20, 2), Some(50.0));
        assert_eq!(table.rules().len(), 2);
    }

    #[test]
    fn rule_table_from_json() {
        let table = RuleTable::from_json_str(
            r#"[{"desired_service_type": 1, "undesired_service_type": 1,
                 "channel_delta": 0, "distance_km": 300.0}]"#,
        )
        .unwrap();
        assert!(table.has_active_rules());
        assert_eq!(table.max_distance(1, 1, 0), Some(300.0));
        assert!(RuleTable::from_json_str(
            r#"[{"desired_service_type": 1, "undesired_service_type": 1,
                 "channel_delta": 0, "distance_km": -3.0}]"#
        )
        .is_err());
    }

    #[test]
    fn deltas_follow_record_types() {
        let here = GeoPoint::new(40.0, -75.0);
        let tv = tv_facility(30, here);
        let fm = fm_facility(5, 250, here);
        assert_eq!(channel_delta(&tv, &tv_facility(32, here)), Some(2));
        assert_eq!(channel_delta(&tv_facility(32, here), &tv), Some(-2));
        assert_eq!(channel_delta(&tv, &fm), Some(220));

        let mut wireless = tv.clone();
        wireless.kind = FacilityKind::Wireless {
            sector_id: "S1".to_string(),
        };
        assert_eq!(channel_delta(&tv, &wireless), Some(0));
        assert_eq!(channel_delta(&wireless, &tv), None);
        assert_eq!(channel_delta(&fm, &wireless), None);
    }

    #[test]
    fn extra_distance_fallbacks() {
        let here = GeoPoint::new(40.0, -75.0);
        let tv = tv_facility(30, here);
        assert_eq!(rule_extra_distance(&tv, None), DEFAULT_RULE_EXTRA_DISTANCE_KM);

        let mut params = StudyParameters {
            default_rule_extra_distance_km: 33.0,
            ..StudyParameters::default()
        };
        assert_eq!(rule_extra_distance(&tv, Some(&params)), 33.0);

        params.use_max_rule_extra_distance = true;
        params.max_rule_extra_distance_km = 250.0;
        assert_eq!(rule_extra_distance(&tv, Some(&params)), 250.0);
    }

    #[test]
    fn extra_distance_from_contour_and_erp() {
        let here = GeoPoint::new(40.0, -75.0);
        let params = curve_params();

        // 1000 kW = 30 dBk: 100 + 30 - 40 = 90 dB margin, 10^(90/40) km.
        let tv = tv_facility(30, here);
        let expected = 10f64.powf(90.0 / 40.0);
        assert!((rule_extra_distance(&tv, Some(&params)) - expected).abs() < 1e-9);

        // 50 kW FM class B on the FM band offset: 100 + 16.99 - 10 - 60.
        let fm = fm_facility(5, 250, here);
        let margin = 100.0 + 10.0 * 50f64.log10() - 10.0 - 60.0;
        let expected = 10f64.powf(margin / 40.0);
        assert!((rule_extra_distance(&fm, Some(&params)) - expected).abs() < 1e-9);
    }

    #[test]
    fn extra_distance_grows_with_erp_and_is_capped() {
        let here = GeoPoint::new(40.0, -75.0);
        let params = curve_params();
        let mut low = tv_facility(30, here);
        low.erp_kw = 10.0;
        let mut high = low.clone();
        high.erp_kw = 100.0;
        assert!(rule_extra_distance(&high, Some(&params)) > rule_extra_distance(&low, Some(&params)));

        let mut huge = low.clone();
        huge.erp_kw = 1.0e12;
        assert_eq!(
            rule_extra_distance(&huge, Some(&params)),
            params.max_rule_extra_distance_km
        );
    }
}
