//! Sharing index: natural external identity -> canonical source.
//!
//! There is one index per external dataset plus one for user-entered
//! records. Each index holds a primary map for ordinary sources and one map
//! per channel for replication sources. Entries hold source ids, never
//! references; the record store validates every hit, so an entry left
//! behind by a removal resolves to "absent".

use std::collections::HashMap;

use crate::models::{Sharing, Source, SourceId};

/// Namespace a shared source is filed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    External(i32),
    User,
}

impl Namespace {
    /// Namespace and natural key for a sharing identity; `None` for private
    /// sources.
    pub fn of(sharing: &Sharing) -> Option<(Namespace, String)> {
        match sharing {
            Sharing::Private => None,
            Sharing::External(key) => Some((
                Namespace::External(key.dataset_id),
                key.record_id.clone(),
            )),
            Sharing::User { user_record_id } => {
                Some((Namespace::User, user_record_id.to_string()))
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SharingIndex {
    primary: HashMap<String, SourceId>,
    replications: HashMap<i32, HashMap<String, SourceId>>,
}

impl SharingIndex {
    pub fn primary(&self, natural_id: &str) -> Option<SourceId> {
        self.primary.get(natural_id).copied()
    }

    pub fn replication(&self, natural_id: &str, channel: i32) -> Option<SourceId> {
        self.replications
            .get(&channel)
            .and_then(|bucket| bucket.get(natural_id))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.replications.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All sharing indexes of one study.
#[derive(Clone, Debug, Default)]
pub struct SharingIndexes {
    by_namespace: HashMap<Namespace, SharingIndex>,
}

impl SharingIndexes {
    pub fn clear(&mut self) {
        self.by_namespace.clear();
    }

    pub fn namespace(&self, namespace: Namespace) -> Option<&SharingIndex> {
        self.by_namespace.get(&namespace)
    }

    /// File `source` under its namespace. `original_locked` reports whether
    /// a replication's original is present and locked; replications of
    /// anything else are not shared.
    pub(crate) fn file(&mut self, source: &Source, original_locked: bool) -> bool {
        if !source.is_locked {
            return false;
        }
        let Some((namespace, natural_id)) = Namespace::of(&source.sharing) else {
            return false;
        };
        let index = self.by_namespace.entry(namespace).or_default();
        if source.is_replication() {
            let (true, Some(channel)) = (original_locked, source.facility.channel()) else {
                return false;
            };
            index
                .replications
                .entry(channel)
                .or_default()
                .insert(natural_id, source.id);
        } else {
            index.primary.insert(natural_id, source.id);
        }
        true
    }

    /// Every (namespace, natural id, channel, source id) entry, sorted.
    /// Channel is `None` for primary entries.
    pub fn entries(&self) -> Vec<(Namespace, String, Option<i32>, SourceId)> {
        let mut out = Vec::new();
        for (namespace, index) in &self.by_namespace {
            for (natural_id, id) in &index.primary {
                out.push((*namespace, natural_id.clone(), None, *id));
            }
            for (channel, bucket) in &index.replications {
                for (natural_id, id) in bucket {
                    out.push((*namespace, natural_id.clone(), Some(*channel), *id));
                }
            }
        }
        out.sort();
        out
    }
}
