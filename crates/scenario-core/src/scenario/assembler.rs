//! Scenario assembly: turn candidate records into scenario memberships.
//!
//! Every operation here runs against one `&mut StudyState`, which the
//! session hands out under its lock. Operations that can fail stage their
//! changes first and only touch the store and scenario once nothing else can
//! fail, so an error leaves the study as it was. Ids allocated by an aborted
//! operation stay marked until the registry is rebuilt after a save.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{ExternalRecord, Facility, RecordType, SearchType, Source, SourceId};
use crate::resolve::cull;
use crate::resolve::mx::{resolve_mx, ExistingMember, MxSettings};
use crate::scenario::membership::{Scenario, Upsert};
use crate::scenario::session::StudyState;
use crate::store::sharing::Namespace;

/// How an add request was searched and which flags new members receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddRequest {
    pub search: SearchType,
    pub desired: bool,
    pub undesired: bool,
}

impl AddRequest {
    pub fn desireds() -> Self {
        Self {
            search: SearchType::Desireds,
            desired: true,
            undesired: true,
        }
    }

    pub fn undesireds() -> Self {
        Self {
            search: SearchType::Undesireds,
            desired: false,
            undesired: true,
        }
    }

    pub fn protecteds() -> Self {
        Self {
            search: SearchType::Protecteds,
            desired: true,
            undesired: true,
        }
    }
}

fn scenario_mut(state: &mut StudyState, key: i32) -> ScenarioResult<&mut Scenario> {
    state
        .scenarios
        .get_mut(&key)
        .ok_or(ScenarioError::UnknownScenario(key))
}

fn admits(state: &StudyState, record_type: RecordType, search: SearchType, desired: bool) -> bool {
    state.study_type.admits(record_type, search) && !(desired && record_type == RecordType::Wireless)
}

/// Search type implied by a direct add with the given desired flag.
fn direct_search(desired: bool) -> SearchType {
    if desired {
        SearchType::Desireds
    } else {
        SearchType::Undesireds
    }
}

// ---------------------------------------------------------------------------
// Add external records
// ---------------------------------------------------------------------------

/// Add external candidate records to scenario `key`.
///
/// Records the study cannot admit are skipped; if none remain the result is
/// `Ok(0)`. Survivors of culling and MX resolution are matched to shared
/// sources where possible, otherwise derived into new sources. Existing
/// members displaced by a preferred candidate are removed. Returns the number
/// of new scenario memberships.
pub fn add_to_scenario(
    state: &mut StudyState,
    key: i32,
    records: Vec<ExternalRecord>,
    request: AddRequest,
) -> ScenarioResult<usize> {
    let scenario = state
        .scenarios
        .get(&key)
        .ok_or(ScenarioError::UnknownScenario(key))?;

    let total = records.len();
    let records: Vec<ExternalRecord> = records
        .into_iter()
        .filter(|r| admits(state, r.record_type(), request.search, request.desired))
        .collect();
    if records.is_empty() {
        debug!(
            "No admissible records among {} for scenario {} ({:?} study, {:?} search)",
            total, key, state.study_type, request.search
        );
        return Ok(0);
    }
    if let Some(unlocked) = records.iter().find(|r| !r.is_locked) {
        return Err(ScenarioError::derivation(
            unlocked.key.dataset_id,
            &unlocked.key.record_id,
            "external candidates must be locked",
        ));
    }

    // Culling.
    let survivors = if request.search == SearchType::Desireds {
        records
    } else {
        let desired_ids = scenario.desired_ids();
        let targets: Vec<&Facility> = desired_ids
            .iter()
            .filter_map(|id| state.store.get(*id))
            .map(|source| &source.facility)
            .collect();
        cull::cull(
            records,
            &targets,
            state.rules.as_ref(),
            state.parameters.as_ref(),
            request.search,
        )?
    };

    // MX resolution against candidates and current members.
    let existing: Vec<ExistingMember<'_>> = scenario
        .items()
        .filter_map(|item| match state.store.get(item.source_id) {
            Some(source) => Some(ExistingMember {
                source,
                item: *item,
            }),
            None => {
                warn!("Scenario {} references missing source {}", key, item.source_id);
                None
            }
        })
        .collect();
    let settings = state
        .parameters
        .as_ref()
        .map(MxSettings::from)
        .unwrap_or_default();
    let outcome = resolve_mx(survivors, &existing, &settings);

    // Stage: find shared sources or derive new ones.
    let mut member_ids: Vec<SourceId> = Vec::with_capacity(outcome.survivors.len());
    let mut new_sources: Vec<Source> = Vec::new();
    for record in &outcome.survivors {
        let shared = state
            .store
            .find_shared(Namespace::External(record.key.dataset_id), &record.key.record_id)
            .filter(|source| source.record_type() == record.record_type());
        if let Some(source) = shared {
            member_ids.push(source.id);
            continue;
        }
        let id = state.registry.try_allocate()?;
        let source = Source::from_external(id, record).map_err(|reason| {
            ScenarioError::derivation(record.key.dataset_id, &record.key.record_id, reason)
        })?;
        member_ids.push(id);
        new_sources.push(source);
    }

    // Commit.
    let created = new_sources.len();
    for source in new_sources {
        state.store.put(source);
    }
    let scenario = scenario_mut(state, key)?;
    for id in &outcome.displaced {
        scenario.remove(*id)?;
    }
    let mut added = 0;
    for id in member_ids {
        if scenario.upsert(id, request.desired, request.undesired) == Upsert::Added {
            added += 1;
        }
    }

    info!(
        "Added {} of {} records to scenario {} ({} new sources, {} displaced)",
        added,
        total,
        key,
        created,
        outcome.displaced.len()
    );
    Ok(added)
}

// ---------------------------------------------------------------------------
// Direct sources
// ---------------------------------------------------------------------------

/// Add a user-entered record to scenario `key`, reusing the study's shared
/// source for `user_record_id` if there is one. `Ok(None)` when the study
/// cannot admit the record.
pub fn add_user_record(
    state: &mut StudyState,
    key: i32,
    user_record_id: i64,
    facility: Facility,
    desired: bool,
    undesired: bool,
) -> ScenarioResult<Option<SourceId>> {
    scenario_mut(state, key)?;
    if !admits(state, facility.record_type(), direct_search(desired), desired) {
        debug!("User record {user_record_id} is not admitted by scenario {key}");
        return Ok(None);
    }

    let natural_id = user_record_id.to_string();
    let shared = state
        .store
        .find_shared(Namespace::User, &natural_id)
        .filter(|source| source.record_type() == facility.record_type())
        .map(|source| source.id);
    let id = match shared {
        Some(id) => id,
        None => {
            let id = state.registry.try_allocate()?;
            let source = Source::from_user_record(id, user_record_id, facility)
                .map_err(|reason| ScenarioError::InvalidSource(id, reason))?;
            state.store.put(source);
            id
        }
    };
    scenario_mut(state, key)?.upsert(id, desired, undesired);
    Ok(Some(id))
}

/// Create a private, editable source in scenario `key`. `Ok(None)` when the
/// study cannot admit the record.
pub fn create_source(
    state: &mut StudyState,
    key: i32,
    facility: Facility,
    desired: bool,
    undesired: bool,
) -> ScenarioResult<Option<SourceId>> {
    scenario_mut(state, key)?;
    if !admits(state, facility.record_type(), direct_search(desired), desired) {
        debug!("Private {} source is not admitted by scenario {key}", facility.record_type());
        return Ok(None);
    }
    let id = state.registry.try_allocate()?;
    let source =
        Source::private(id, facility).map_err(|reason| ScenarioError::InvalidSource(id, reason))?;
    state.store.put(source);
    scenario_mut(state, key)?.upsert(id, desired, undesired);
    Ok(Some(id))
}

/// Apply `edit` to the facility of an unlocked source. The record type cannot
/// change and the result must validate.
pub fn edit_source<F>(state: &mut StudyState, id: SourceId, edit: F) -> ScenarioResult<()>
where
    F: FnOnce(&mut Facility),
{
    let source = state.store.get(id).ok_or(ScenarioError::UnknownSource(id))?;
    if source.is_locked {
        return Err(ScenarioError::LockedSource(id));
    }
    let mut edited = source.clone();
    edit(&mut edited.facility);
    if edited.record_type() != source.record_type() {
        return Err(ScenarioError::RecordTypeMismatch(format!(
            "source {id} cannot change from {} to {}",
            source.record_type(),
            edited.record_type()
        )));
    }
    edited
        .facility
        .validate()
        .map_err(|reason| ScenarioError::InvalidSource(id, reason))?;
    edited.mod_count += 1;
    state.store.put(edited);
    Ok(())
}

/// Replace a locked member of scenario `key` with a private, editable copy.
/// Returns the id the scenario now references.
pub fn unlock_source(state: &mut StudyState, key: i32, id: SourceId) -> ScenarioResult<SourceId> {
    let item = *scenario_mut(state, key)?
        .get(id)
        .ok_or(ScenarioError::UnknownSource(id))?;
    let source = state.store.get(id).ok_or(ScenarioError::UnknownSource(id))?;
    if !source.is_locked {
        return Ok(id);
    }
    if item.is_permanent {
        return Err(ScenarioError::PermanentEntry(id));
    }
    let new_id = state.registry.try_allocate()?;
    let copy = source.unlocked_copy(new_id);
    state.store.put(copy);
    scenario_mut(state, key)?.replace_source(id, new_id)?;
    info!("Unlocked source {id} in scenario {key} as {new_id}");
    Ok(new_id)
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Move member `id` of scenario `key` onto `channel` through a replication
/// source, keeping its flags. Replicating back onto the original channel
/// returns the original.
pub fn replicate(
    state: &mut StudyState,
    key: i32,
    id: SourceId,
    channel: i32,
) -> ScenarioResult<SourceId> {
    let item = *scenario_mut(state, key)?
        .get(id)
        .ok_or(ScenarioError::UnknownSource(id))?;
    if item.is_permanent {
        return Err(ScenarioError::PermanentEntry(id));
    }
    let source = state.store.get(id).ok_or(ScenarioError::UnknownSource(id))?;
    if source.record_type() != RecordType::Tv {
        return Err(ScenarioError::RecordTypeMismatch(format!(
            "only TV sources can be replicated, source {id} is {}",
            source.record_type()
        )));
    }
    let base = match source.original_id {
        Some(original_id) => match state.store.get(original_id) {
            Some(original) => original,
            None => {
                warn!("Replication {id} has no original {original_id}; replicating it directly");
                source
            }
        },
        None => source,
    };

    let target = if base.facility.channel() == Some(channel) {
        base.id
    } else {
        let shared = Namespace::of(&base.sharing)
            .filter(|_| base.is_locked)
            .and_then(|(ns, natural_id)| {
                state.store.find_shared_replication(ns, &natural_id, channel)
            })
            .filter(|rep| rep.original_id == Some(base.id))
            .map(|rep| rep.id);
        match shared {
            Some(rep_id) => rep_id,
            None => {
                let base_id = base.id;
                let rep_id = state.registry.try_allocate()?;
                let replication = base
                    .replicate(rep_id, channel)
                    .map_err(|reason| ScenarioError::InvalidSource(base_id, reason))?;
                state.store.put(replication);
                rep_id
            }
        }
    };

    scenario_mut(state, key)?.replace_source(id, target)?;
    info!("Replicated source {id} onto channel {channel} as {target} in scenario {key}");
    Ok(target)
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

/// Remove sources that no scenario references and that no remaining
/// replication points at, then rebuild the sharing index. Returns the number
/// of sources removed. Their ids stay marked until the registry is rebuilt
/// after the next save.
pub fn purge_unreferenced(state: &mut StudyState) -> usize {
    let referenced: HashSet<SourceId> = state
        .scenarios
        .values()
        .flat_map(|scenario| scenario.items().map(|item| item.source_id))
        .collect();

    let mut removed = 0;
    loop {
        let originals: HashSet<SourceId> =
            state.store.iter().filter_map(|s| s.original_id).collect();
        let doomed: Vec<SourceId> = state
            .store
            .ids()
            .filter(|id| !referenced.contains(id) && !originals.contains(id))
            .collect();
        if doomed.is_empty() {
            break;
        }
        for id in doomed {
            state.store.remove(id);
            removed += 1;
        }
    }
    state.store.rebuild_index();
    if removed > 0 {
        info!("Purged {removed} unreferenced sources");
    }
    removed
}
