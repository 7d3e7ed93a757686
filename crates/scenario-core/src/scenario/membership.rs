//! Scenario membership lists.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{SourceId, SourceListItem};
use crate::store::database::ScenarioRecord;

/// Result of [`Scenario::upsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    /// The existing entry is permanent and was left untouched.
    Permanent,
}

/// Ordered set of scenario memberships, keyed by source id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Scenario {
    pub key: i32,
    pub name: String,
    items: IndexMap<SourceId, SourceListItem>,
}

impl Scenario {
    pub fn new(key: i32, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            items: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: SourceId) -> Option<&SourceListItem> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &SourceListItem> {
        self.items.values()
    }

    pub fn desired_ids(&self) -> Vec<SourceId> {
        self.items
            .values()
            .filter(|item| item.is_desired)
            .map(|item| item.source_id)
            .collect()
    }

    fn editable(&self, id: SourceId) -> ScenarioResult<&SourceListItem> {
        let item = self.items.get(&id).ok_or(ScenarioError::UnknownSource(id))?;
        if item.is_permanent {
            return Err(ScenarioError::PermanentEntry(id));
        }
        Ok(item)
    }

    /// Append a membership, or update the flags of an existing one. A
    /// permanent entry keeps its flags.
    pub fn upsert(&mut self, source_id: SourceId, is_desired: bool, is_undesired: bool) -> Upsert {
        match self.items.get_mut(&source_id) {
            Some(item) if item.is_permanent => Upsert::Permanent,
            Some(item) => {
                item.is_desired = is_desired;
                item.is_undesired = is_undesired;
                Upsert::Updated
            }
            None => {
                self.items.insert(
                    source_id,
                    SourceListItem::new(source_id, is_desired, is_undesired),
                );
                Upsert::Added
            }
        }
    }

    pub fn set_flags(
        &mut self,
        source_id: SourceId,
        is_desired: bool,
        is_undesired: bool,
    ) -> ScenarioResult<()> {
        self.editable(source_id)?;
        if let Some(item) = self.items.get_mut(&source_id) {
            item.is_desired = is_desired;
            item.is_undesired = is_undesired;
        }
        Ok(())
    }

    pub fn remove(&mut self, source_id: SourceId) -> ScenarioResult<SourceListItem> {
        self.editable(source_id)?;
        self.items
            .shift_remove(&source_id)
            .ok_or(ScenarioError::UnknownSource(source_id))
    }

    pub fn mark_permanent(&mut self, source_id: SourceId) -> ScenarioResult<()> {
        let item = self
            .items
            .get_mut(&source_id)
            .ok_or(ScenarioError::UnknownSource(source_id))?;
        item.is_permanent = true;
        Ok(())
    }

    /// Point the membership of `old` at `new`, keeping its position and
    /// flags. If `new` is already a member, the `old` entry is dropped.
    pub fn replace_source(&mut self, old: SourceId, new: SourceId) -> ScenarioResult<()> {
        if old == new {
            return Ok(());
        }
        let item = *self.editable(old)?;
        let Some((index, _, _)) = self.items.shift_remove_full(&old) else {
            return Err(ScenarioError::UnknownSource(old));
        };
        if !self.items.contains_key(&new) {
            self.items.shift_insert(
                index,
                new,
                SourceListItem {
                    source_id: new,
                    ..item
                },
            );
        }
        Ok(())
    }

    /// Drop every membership whose source fails `keep`, permanent or not.
    /// Returns the number dropped.
    pub(crate) fn retain_sources(&mut self, mut keep: impl FnMut(SourceId) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|id, _| keep(*id));
        before - self.items.len()
    }

    pub fn to_record(&self) -> ScenarioRecord {
        ScenarioRecord {
            key: self.key,
            name: self.name.clone(),
            items: self.items.values().copied().collect(),
        }
    }

    pub fn from_record(record: ScenarioRecord) -> Self {
        Self {
            key: record.key,
            name: record.name,
            items: record
                .items
                .into_iter()
                .map(|item| (item.source_id, item))
                .collect(),
        }
    }
}
