//! Mutual-exclusivity (MX) resolution.
//!
//! Two records are MX when they cannot coexist: the same facility on file
//! twice, or co-channel stations of the same type closer than the study's
//! MX distance, regardless of country. Of every conflicting pair exactly one is kept, chosen by a
//! total preference order:
//!
//! 1. higher service preference rank,
//! 2. lower status type (licensed before permits before applications),
//! 3. higher external record id, compared as strings,
//! 4. lower external dataset id.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::config::{StudyParameters, DEFAULT_CO_CHANNEL_MX_DISTANCE_KM, DEFAULT_KM_PER_DEGREE};
use crate::models::{
    ExternalKey, ExternalRecord, Facility, RecordType, Source, SourceId, SourceListItem, StatusType,
};
use crate::resolve::geo::distance_km;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MxSettings {
    pub check_mx: bool,
    pub co_channel_distance_km: f64,
    pub km_per_degree: f64,
}

impl Default for MxSettings {
    fn default() -> Self {
        Self {
            check_mx: true,
            co_channel_distance_km: DEFAULT_CO_CHANNEL_MX_DISTANCE_KM,
            km_per_degree: DEFAULT_KM_PER_DEGREE,
        }
    }
}

impl From<&StudyParameters> for MxSettings {
    fn from(params: &StudyParameters) -> Self {
        Self {
            check_mx: params.check_mx,
            co_channel_distance_km: params.co_channel_mx_distance_km,
            km_per_degree: params.km_per_degree,
        }
    }
}

/// A scenario member already present when candidates are resolved.
#[derive(Clone, Copy, Debug)]
pub struct ExistingMember<'a> {
    pub source: &'a Source,
    pub item: SourceListItem,
}

impl ExistingMember<'_> {
    /// Permanent and desired members are never displaced by a candidate.
    fn displaceable(&self) -> bool {
        !self.item.is_permanent && !self.item.is_desired
    }
}

#[derive(Debug, Default)]
pub struct MxOutcome {
    pub survivors: Vec<ExternalRecord>,
    /// Existing members that lost an MX conflict to a surviving candidate.
    pub displaced: Vec<SourceId>,
}

// ---------------------------------------------------------------------------
// Preference
// ---------------------------------------------------------------------------

struct Preference<'a> {
    rank: i32,
    status: StatusType,
    record_id: &'a str,
    dataset_id: i32,
}

impl<'a> Preference<'a> {
    fn of(facility: &'a Facility, key: Option<&'a ExternalKey>) -> Self {
        Self {
            rank: facility.service.preference_rank,
            status: facility.status,
            record_id: key.map(|k| k.record_id.as_str()).unwrap_or(""),
            dataset_id: key.map(|k| k.dataset_id).unwrap_or(i32::MAX),
        }
    }
}

/// `Less` when `a` is preferred over `b`.
fn compare(a: &Preference<'_>, b: &Preference<'_>) -> Ordering {
    b.rank
        .cmp(&a.rank)
        .then(a.status.cmp(&b.status))
        .then_with(|| b.record_id.cmp(a.record_id))
        .then(a.dataset_id.cmp(&b.dataset_id))
}

/// Preference order over candidate records; sorting with it puts the most
/// preferred record first.
pub fn preference_order(a: &ExternalRecord, b: &ExternalRecord) -> Ordering {
    compare(
        &Preference::of(&a.facility, Some(&a.key)),
        &Preference::of(&b.facility, Some(&b.key)),
    )
}

// ---------------------------------------------------------------------------
// MX predicate
// ---------------------------------------------------------------------------

/// Record-type-specific MX test. Only records of the same type conflict;
/// wireless records never do.
pub fn are_mx(a: &Facility, b: &Facility, settings: &MxSettings) -> bool {
    let record_type = a.record_type();
    if record_type != b.record_type() || record_type == RecordType::Wireless {
        return false;
    }
    if a.facility_id != 0 && a.facility_id == b.facility_id {
        return true;
    }
    a.channel() == b.channel()
        && distance_km(&a.location, &b.location, settings.km_per_degree)
            <= settings.co_channel_distance_km
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve duplicates and MX conflicts among `candidates` and against
/// `existing` scenario members.
///
/// Candidates that duplicate an existing member (same dataset and record
/// id, replications included), or an earlier candidate, are always dropped. When
/// MX checking is enabled, candidates are visited in preference order and
/// each one is kept only if it conflicts with no kept candidate and wins
/// against every conflicting existing member; winning members that may be
/// displaced are reported in [`MxOutcome::displaced`]. Existing members win
/// ties.
pub fn resolve_mx(
    candidates: Vec<ExternalRecord>,
    existing: &[ExistingMember<'_>],
    settings: &MxSettings,
) -> MxOutcome {
    // Replications carry their original's key, so they count as well.
    let existing_keys: HashSet<&ExternalKey> = existing
        .iter()
        .filter_map(|m| m.source.external_key())
        .collect();

    let mut seen: HashSet<ExternalKey> = HashSet::new();
    let mut remaining: Vec<ExternalRecord> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if existing_keys.contains(&candidate.key) || !seen.insert(candidate.key.clone()) {
            debug!("Dropping duplicate candidate {}", candidate.key);
            continue;
        }
        remaining.push(candidate);
    }

    if !settings.check_mx {
        return MxOutcome {
            survivors: remaining,
            displaced: Vec::new(),
        };
    }

    remaining.sort_by(preference_order);

    let mut kept: Vec<ExternalRecord> = Vec::with_capacity(remaining.len());
    let mut displaced: Vec<SourceId> = Vec::new();
    for candidate in remaining {
        if let Some(winner) = kept
            .iter()
            .find(|k| are_mx(&k.facility, &candidate.facility, settings))
        {
            debug!("MX: {} loses to candidate {}", candidate.key, winner.key);
            continue;
        }

        let mine = Preference::of(&candidate.facility, Some(&candidate.key));
        let mut losers: Vec<SourceId> = Vec::new();
        let mut blocked = false;
        for member in existing {
            if displaced.contains(&member.source.id)
                || !are_mx(&member.source.facility, &candidate.facility, settings)
            {
                continue;
            }
            let theirs = Preference::of(&member.source.facility, member.source.external_key());
            if compare(&mine, &theirs) == Ordering::Less && member.displaceable() {
                losers.push(member.source.id);
            } else {
                debug!(
                    "MX: {} loses to existing source {}",
                    candidate.key, member.source.id
                );
                blocked = true;
                break;
            }
        }
        if blocked {
            continue;
        }
        displaced.extend(losers);
        kept.push(candidate);
    }

    MxOutcome {
        survivors: kept,
        displaced,
    }
}
