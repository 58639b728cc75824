//! Tracking which record ids are active in on-demand mode.

use std::collections::{HashMap, HashSet};
use tidemark_remote::Subset;

/// Maps loaded subset descriptors to the ids their last hydration
/// produced, maintaining the union of every loaded subset.
///
/// The engine consults [`is_active`](Self::is_active) before forwarding
/// insert/update live events; delete events bypass the gate and evict the
/// id from every subset.
#[derive(Debug, Default)]
pub struct SubsetCache {
    subsets: HashMap<String, HashSet<String>>,
    active: HashSet<String>,
}

impl SubsetCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the ids loaded for a descriptor.
    pub fn load(&mut self, subset: &Subset, ids: impl IntoIterator<Item = String>) {
        self.subsets
            .insert(subset.cache_key(), ids.into_iter().collect());
        self.recompute();
    }

    /// Forgets a descriptor. Returns true when no subsets remain loaded
    /// (the caller closes live handles then).
    pub fn unload(&mut self, subset: &Subset) -> bool {
        self.subsets.remove(&subset.cache_key());
        self.recompute();
        self.subsets.is_empty()
    }

    /// Adds one id to the subset it arrived through.
    pub fn admit(&mut self, subset: &Subset, id: &str) {
        self.subsets
            .entry(subset.cache_key())
            .or_default()
            .insert(id.to_owned());
        self.active.insert(id.to_owned());
    }

    /// Removes an id from every subset (a delete observed anywhere).
    pub fn evict(&mut self, id: &str) {
        for ids in self.subsets.values_mut() {
            ids.remove(id);
        }
        self.active.remove(id);
    }

    /// True when the id is visible through at least one loaded subset.
    #[must_use]
    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains(id)
    }

    /// True when no subset is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }

    /// Number of loaded subsets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subsets.len()
    }

    fn recompute(&mut self) {
        self.active = self.subsets.values().flatten().cloned().collect();
    }
}
