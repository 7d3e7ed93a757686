//! Source identity allocation.
//!
//! Identities are 16-bit so that cached downstream artifacts stay compact.
//! Studies create and discard many sources over their lifetime, so ids are
//! recycled, but only through [`IdRegistry::rebuild`] after the study state
//! has been durably saved. Within one editing session an id is never issued
//! twice.

use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{SourceId, MAX_SOURCE_ID};

const WORD_BITS: usize = 64;
const WORDS: usize = (MAX_SOURCE_ID as usize + 1) / WORD_BITS;

/// In-use bitmap over `0..=65535` with a rotating allocation cursor. Bit 0
/// is reserved and always clear.
#[derive(Clone, Debug)]
pub struct IdRegistry {
    bits: Box<[u64]>,
    cursor: u16,
    in_use: usize,
}

impl Default for IdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdRegistry {
    pub fn new() -> Self {
        Self {
            bits: vec![0u64; WORDS].into_boxed_slice(),
            cursor: 0,
            in_use: 0,
        }
    }

    fn test(&self, raw: u16) -> bool {
        let raw = raw as usize;
        self.bits[raw / WORD_BITS] & (1u64 << (raw % WORD_BITS)) != 0
    }

    fn set(&mut self, raw: u16) {
        if !self.test(raw) {
            let raw = raw as usize;
            self.bits[raw / WORD_BITS] |= 1u64 << (raw % WORD_BITS);
            self.in_use += 1;
        }
    }

    /// Allocate the next free id after the last one issued, wrapping at the
    /// top of the range. Returns `None` when every id is in use.
    ///
    /// The id is marked in use immediately, whether or not the caller ever
    /// commits a source under it.
    pub fn allocate(&mut self) -> Option<SourceId> {
        let mut next = self.cursor;
        for _ in 0..MAX_SOURCE_ID {
            next = if next >= MAX_SOURCE_ID { 1 } else { next + 1 };
            if !self.test(next) {
                self.set(next);
                self.cursor = next;
                return SourceId::new(next);
            }
        }
        None
    }

    /// [`allocate`](Self::allocate), with exhaustion surfaced as an error.
    pub fn try_allocate(&mut self) -> ScenarioResult<SourceId> {
        self.allocate().ok_or(ScenarioError::Exhausted)
    }

    /// Mark an id in use without moving the cursor.
    pub fn mark(&mut self, id: SourceId) {
        self.set(id.get());
    }

    pub fn is_in_use(&self, id: SourceId) -> bool {
        self.test(id.get())
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    /// Reset the bitmap to exactly `live`. Call only when in-memory and
    /// persisted state agree, right after a successful save. The cursor is
    /// kept so released ids are reissued only after the rest of the range.
    pub fn rebuild<I>(&mut self, live: I)
    where
        I: IntoIterator<Item = SourceId>,
    {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.in_use = 0;
        for id in live {
            self.set(id.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::fixtures::id;

    #[test]
    fn allocates_from_one_upwards() {
        let mut registry = IdRegistry::new();
        assert_eq!(registry.allocate(), Some(id(1)));
        assert_eq!(registry.allocate(), Some(id(2)));
        assert_eq!(registry.in_use_count(), 2);
    }

    #[test]
    fn skips_ids_already_in_use() {
        let mut registry = IdRegistry::new();
        registry.mark(id(2));
        registry.mark(id(3));
        assert_eq!(registry.allocate(), Some(id(1)));
        assert_eq!(registry.allocate(), Some(id(4)));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut registry = IdRegistry::new();
        let mut issued = HashSet::new();
        while let Some(next) = registry.allocate() {
            assert!(issued.insert(next), "id {next} issued twice");
        }
        assert_eq!(issued.len(), MAX_SOURCE_ID as usize);
        assert!(matches!(registry.try_allocate(), Err(ScenarioError::Exhausted)));
        assert!(!issued.iter().any(|i| i.get() == 0));
    }

    #[test]
    fn rebuild_releases_unused_ids_after_wrap() {
        let mut registry = IdRegistry::new();
        for _ in 0..10 {
            registry.allocate();
        }
        registry.rebuild([id(2), id(5)]);
        assert_eq!(registry.in_use_count(), 2);
        assert!(registry.is_in_use(id(5)));
        assert!(!registry.is_in_use(id(3)));

        // The cursor continues past the last issued id.
        assert_eq!(registry.allocate(), Some(id(11)));
    }

    #[test]
    fn rebuild_never_reissues_live_ids() {
        let mut registry = IdRegistry::new();
        for _ in 0..100 {
            registry.allocate();
        }
        let live: Vec<SourceId> = (1..=100).filter(|n| n % 3 == 0).map(id).collect();
        registry.rebuild(live.iter().copied());

        let live: HashSet<SourceId> = live.into_iter().collect();
        while let Some(next) = registry.allocate() {
            assert!(!live.contains(&next));
        }
        assert_eq!(
            registry.in_use_count(),
            MAX_SOURCE_ID as usize,
            "every id ends up in use"
        );
    }

    #[test]
    fn wraps_to_start_of_range() {
        let mut registry = IdRegistry::new();
        registry.cursor = MAX_SOURCE_ID - 1;
        assert_eq!(registry.allocate(), Some(id(MAX_SOURCE_ID)));
        assert_eq!(registry.allocate(), Some(id(1)));
    }
}
