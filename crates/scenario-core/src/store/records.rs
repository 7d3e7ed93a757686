//! Canonical record store: one source per identity, plus its sharing index.

use std::collections::BTreeMap;

use tracing::warn;

use crate::models::{Source, SourceId};
use crate::store::sharing::{Namespace, SharingIndexes};

/// Maps source ids to the canonical source records of one study and keeps
/// the sharing index over the locked ones.
#[derive(Clone, Debug, Default)]
pub struct SourceStore {
    sources: BTreeMap<SourceId, Source>,
    index: SharingIndexes,
}

fn original_locked(sources: &BTreeMap<SourceId, Source>, source: &Source) -> bool {
    source
        .original_id
        .and_then(|orig| sources.get(&orig))
        .is_some_and(|orig| orig.is_locked)
}

impl SourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn index(&self) -> &SharingIndexes {
        &self.index
    }

    /// Insert or replace the source with `source.id`, then file it in the
    /// sharing index when it is locked. A replication is filed only while its
    /// original is locked in this store.
    pub fn put(&mut self, source: Source) {
        let id = source.id;
        self.sources.insert(id, source);
        let source = &self.sources[&id];
        let locked = original_locked(&self.sources, source);
        self.index.file(source, locked);
    }

    /// Remove a source. Index entries pointing at it stay until the next
    /// [`rebuild_index`](Self::rebuild_index); lookups already treat them
    /// as absent.
    pub fn remove(&mut self, id: SourceId) -> Option<Source> {
        self.sources.remove(&id)
    }

    /// Rebuild every index map from a full scan of the store.
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        for source in self.sources.values() {
            let locked = original_locked(&self.sources, source);
            self.index.file(source, locked);
        }
    }

    fn shared_entry_matches(&self, source: &Source, namespace: Namespace, natural_id: &str) -> bool {
        source.is_locked
            && Namespace::of(&source.sharing)
                .is_some_and(|(ns, key)| ns == namespace && key == natural_id)
    }

    /// Shared, locked, non-replication source for a natural id.
    pub fn find_shared(&self, namespace: Namespace, natural_id: &str) -> Option<&Source> {
        let id = self.index.namespace(namespace)?.primary(natural_id)?;
        let Some(source) = self.sources.get(&id) else {
            warn!("Sharing index entry {natural_id} points at removed source {id}");
            return None;
        };
        (!source.is_replication() && self.shared_entry_matches(source, namespace, natural_id))
            .then_some(source)
    }

    /// Shared replication of a natural id onto `channel`.
    pub fn find_shared_replication(
        &self,
        namespace: Namespace,
        natural_id: &str,
        channel: i32,
    ) -> Option<&Source> {
        let id = self
            .index
            .namespace(namespace)?
            .replication(natural_id, channel)?;
        let source = self.sources.get(&id)?;
        let valid = source.is_replication()
            && source.facility.channel() == Some(channel)
            && original_locked(&self.sources, source)
            && self.shared_entry_matches(source, namespace, natural_id);
        valid.then_some(source)
    }

    /// Ids of replication sources whose original is `id`.
    pub fn replications_of(&self, id: SourceId) -> Vec<SourceId> {
        self.sources
            .values()
            .filter(|s| s.original_id == Some(id))
            .map(|s| s.id)
            .collect()
    }
}
