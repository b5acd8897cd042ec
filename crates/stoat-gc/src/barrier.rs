//! Remembered set for old-to-young edges
//!
//! A minor collection traces only the young generation, so every edge
//! from an old object into young space must be recorded here at the time
//! the store happens. The single correctness obligation: no minor
//! collection may run with a missing old-to-young edge.

use rustc_hash::FxHashSet;

use crate::object::Ref;

/// The set of old-generation objects known to hold at least one young
/// reference. Sources, not edges: a minor collection re-traces each
/// recorded source in full.
#[derive(Debug, Default)]
pub struct RememberedSet {
    entries: FxHashSet<Ref>,
}

impl RememberedSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an old object that now holds a young reference
    #[inline]
    pub fn add(&mut self, source: Ref) {
        self.entries.insert(source);
    }

    /// Drop an entry (the source was freed or no longer holds young refs)
    pub fn remove(&mut self, source: Ref) {
        self.entries.remove(&source);
    }

    /// Check membership
    pub fn contains(&self, source: Ref) -> bool {
        self.entries.contains(&source)
    }

    /// Iterate the recorded sources
    pub fn iter(&self) -> impl Iterator<Item = Ref> + '_ {
        self.entries.iter().copied()
    }

    /// Snapshot the recorded sources
    pub fn sources(&self) -> Vec<Ref> {
        self.entries.iter().copied().collect()
    }

    /// Clear the set (after a major collection re-derives it)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of recorded sources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
