//! Distance and rule culling of candidate records.
//!
//! A candidate survives when, for at least one desired station and the
//! channel delta between them, some pair of their sites lies within the
//! rule distance for that delta plus the protected station's rule extra
//! distance. Candidates are evaluated in parallel with Rayon; the survivor
//! list keeps candidate order.

use rayon::prelude::*;
use tracing::debug;

use crate::config::{StudyParameters, DEFAULT_KM_PER_DEGREE};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{ExternalRecord, Facility, SearchType};
use crate::resolve::geo::min_distance_km;
use crate::resolve::rules::{channel_delta, rule_extra_distance, RuleTable};

/// Culling engine bound to one study's read-only reference tables.
pub struct CullEngine<'a> {
    rules: &'a RuleTable,
    params: Option<&'a StudyParameters>,
}

impl<'a> CullEngine<'a> {
    pub fn new(rules: &'a RuleTable, params: Option<&'a StudyParameters>) -> Self {
        Self { rules, params }
    }

    fn km_per_degree(&self) -> f64 {
        self.params
            .map(|p| p.km_per_degree)
            .unwrap_or(DEFAULT_KM_PER_DEGREE)
    }

    /// Effective protection distance for `undesired` against `desired`, or
    /// `None` when no active rule covers their channel delta.
    pub fn protection_distance(&self, desired: &Facility, undesired: &Facility) -> Option<f64> {
        let delta = channel_delta(desired, undesired)?;
        let rule_distance = self.rules.max_distance(
            desired.service.service_type,
            undesired.service.service_type,
            delta,
        )?;
        Some(rule_distance + rule_extra_distance(desired, self.params))
    }

    /// Whether `candidate` is within interference-relevant range of any
    /// station in `targets`. For an undesireds search the targets are the
    /// desired stations; for a protecteds search the candidate is the
    /// would-be desired station and the targets act as undesireds.
    pub fn in_range(&self, candidate: &Facility, targets: &[&Facility], search: SearchType) -> bool {
        let km_per_degree = self.km_per_degree();
        targets.iter().any(|target| {
            let (desired, undesired) = match search {
                SearchType::Protecteds => (candidate, *target),
                SearchType::Undesireds | SearchType::Desireds => (*target, candidate),
            };
            let Some(limit) = self.protection_distance(desired, undesired) else {
                return false;
            };
            min_distance_km(desired.sites(), undesired.sites(), km_per_degree)
                .is_some_and(|d| d <= limit)
        })
    }

    /// Drop candidates that are out of range of every target.
    ///
    /// Desireds searches are not culled; the external search selected them
    /// by location already.
    pub fn cull(
        &self,
        candidates: Vec<ExternalRecord>,
        targets: &[&Facility],
        search: SearchType,
    ) -> ScenarioResult<Vec<ExternalRecord>> {
        if search == SearchType::Desireds {
            return Ok(candidates);
        }
        if targets.is_empty() {
            return Err(ScenarioError::MissingPrerequisite(
                "scenario has no desired station to cull against".to_string(),
            ));
        }

        let total = candidates.len();
        let survivors: Vec<ExternalRecord> = candidates
            .into_par_iter()
            .filter(|candidate| self.in_range(&candidate.facility, targets, search))
            .collect();
        debug!(
            "Culling kept {} of {} candidates ({:?} search, {} targets)",
            survivors.len(),
            total,
            search,
            targets.len()
        );
        Ok(survivors)
    }
}

/// Cull `candidates` against `targets` using `rules`. A missing rule table is
/// a malformed study, not an empty result.
pub fn cull(
    candidates: Vec<ExternalRecord>,
    targets: &[&Facility],
    rules: Option<&RuleTable>,
    params: Option<&StudyParameters>,
    search: SearchType,
) -> ScenarioResult<Vec<ExternalRecord>> {
    let rules = rules.ok_or_else(|| {
        ScenarioError::MissingPrerequisite("interference rule table is unavailable".to_string())
    })?;
    CullEngine::new(rules, params).cull(candidates, targets, search)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{fm_facility, record, tv_facility};
    use crate::models::{FacilityKind, GeoPoint};
    use crate::resolve::rules::InterferenceRule;

    const KPD: f64 = 100.0;

    fn north_of(origin: GeoPoint, km: f64) -> GeoPoint {
        GeoPoint::new(origin.latitude + km / KPD, origin.longitude)
    }

    fn params(extra_km: f64) -> StudyParameters {
        StudyParameters {
            km_per_degree: KPD,
            use_max_rule_extra_distance: true,
            max_rule_extra_distance_km: extra_km,
            ..StudyParameters::default()
        }
    }

    fn rules(delta: i32, distance_km: f64) -> RuleTable {
        RuleTable::new(vec![InterferenceRule {
            desired_service_type: 1,
            undesired_service_type: 20,
            channel_delta: delta,
            distance_km,
            is_active: true,
        }])
        .unwrap()
    }

    fn fm_at(id: &str, channel: i32, location: GeoPoint) -> ExternalRecord {
        record(3, id, fm_facility(id.len() as i64 + channel as i64, channel, location))
    }

    #[test]
    fn keeps_candidates_inside_rule_plus_extra_distance() {
        let origin = GeoPoint::new(40.0, -90.0);
        let desired = tv_facility(6, origin);
        let rules = rules(202, 50.0);
        let params = params(10.0);
        let candidates = vec![
            fm_at("near", 208, north_of(origin, 40.0)),
            fm_at("far", 208, north_of(origin, 65.0)),
            fm_at("other-delta", 211, north_of(origin, 40.0)),
        ];
        let survivors = cull(
            candidates,
            &[&desired],
            Some(&rules),
            Some(&params),
            SearchType::Undesireds,
        )
        .unwrap();
        let ids: Vec<&str> = survivors.iter().map(|r| r.key.record_id.as_str()).collect();
        assert_eq!(ids, vec!["near"]);
    }

    #[test]
    fn boundary_distance_is_inclusive() {
        let origin = GeoPoint::new(0.0, 0.0);
        let desired = tv_facility(6, origin);
        let rules = rules(202, 0.0);
        let params = params(0.0);
        let engine = CullEngine::new(&rules, Some(&params));
        let co_sited = fm_facility(1, 208, origin);
        assert!(engine.in_range(&co_sited, &[&desired], SearchType::Undesireds));
        let nearby = fm_facility(1, 208, north_of(origin, 0.01));
        assert!(!engine.in_range(&nearby, &[&desired], SearchType::Undesireds));
    }

    #[test]
    fn candidate_exactly_at_rule_plus_extra_survives() {
        let origin = GeoPoint::new(0.0, 0.0);
        let desired = tv_facility(6, origin);
        let at_edge = fm_facility(1, 208, north_of(origin, 60.0));
        let edge_km = crate::resolve::geo::distance_km(&origin, &at_edge.location, KPD);

        // Both terms stay in [32, 64), so the sum reproduces the edge exactly.
        let rules = rules(202, edge_km - 8.0);
        let params = params(8.0);
        let engine = CullEngine::new(&rules, Some(&params));
        assert_eq!(engine.protection_distance(&desired, &at_edge), Some(edge_km));
        assert!(engine.in_range(&at_edge, &[&desired], SearchType::Undesireds));

        let past_edge = fm_facility(1, 208, north_of(origin, 60.01));
        assert!(!engine.in_range(&past_edge, &[&desired], SearchType::Undesireds));
    }

    #[test]
    fn dts_desired_survives_on_any_site() {
        let origin = GeoPoint::new(40.0, -90.0);
        let mut desired = tv_facility(6, origin);
        desired.kind = FacilityKind::Tv {
            channel: 6,
            dts_sites: vec![origin, north_of(origin, 100.0)],
        };
        let rules = rules(202, 50.0);
        let params = params(10.0);
        let engine = CullEngine::new(&rules, Some(&params));
        let candidate = fm_facility(1, 208, north_of(origin, 150.0));
        assert!(engine.in_range(&candidate, &[&desired], SearchType::Undesireds));
        let beyond = fm_facility(1, 208, north_of(origin, 161.0));
        assert!(!engine.in_range(&beyond, &[&desired], SearchType::Undesireds));
    }

    #[test]
    fn protecteds_search_swaps_roles() {
        let origin = GeoPoint::new(40.0, -90.0);
        let proposal = fm_facility(1, 208, origin);
        let rules = rules(202, 50.0);
        let params = params(10.0);
        let engine = CullEngine::new(&rules, Some(&params));
        let protected_tv = tv_facility(6, north_of(origin, 55.0));
        assert!(engine.in_range(&protected_tv, &[&proposal], SearchType::Protecteds));
        assert!(!engine.in_range(&protected_tv, &[&proposal], SearchType::Undesireds));
    }

    #[test]
    fn increasing_distances_never_removes_survivors() {
        let origin = GeoPoint::new(40.0, -90.0);
        let desired = tv_facility(6, origin);
        let candidates: Vec<ExternalRecord> = (0..40)
            .map(|i| fm_at(&format!("c{i}"), 208, north_of(origin, 5.0 * i as f64)))
            .collect();

        let mut previous = 0;
        for (rule_km, extra_km) in [(10.0, 0.0), (10.0, 20.0), (60.0, 20.0), (60.0, 92.0)] {
            let survivors = cull(
                candidates.clone(),
                &[&desired],
                Some(&rules(202, rule_km)),
                Some(&params(extra_km)),
                SearchType::Undesireds,
            )
            .unwrap();
            assert!(survivors.len() >= previous);
            previous = survivors.len();
        }
        assert_eq!(previous, 31);
    }

    #[test]
    fn missing_prerequisites_are_errors() {
        let origin = GeoPoint::new(40.0, -90.0);
        let desired = tv_facility(6, origin);
        let candidates = vec![fm_at("a", 208, origin)];
        let err = cull(candidates.clone(), &[&desired], None, None, SearchType::Undesireds);
        assert!(matches!(err, Err(ScenarioError::MissingPrerequisite(_))));
        let err = cull(candidates, &[], Some(&rules(202, 50.0)), None, SearchType::Undesireds);
        assert!(matches!(err, Err(ScenarioError::MissingPrerequisite(_))));
    }

    #[test]
    fn desireds_search_is_not_culled() {
        let origin = GeoPoint::new(40.0, -90.0);
        let candidates = vec![fm_at("a", 208, north_of(origin, 900.0))];
        let survivors =
            cull(candidates, &[], Some(&rules(202, 1.0)), None, SearchType::Desireds).unwrap();
        assert_eq!(survivors.len(), 1);
    }
}
