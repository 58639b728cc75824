//! The identifier intern pool.

use super::id::RecordId;
use super::normalize::RecordIdInput;
use parking_lot::Mutex;
use std::collections::HashMap;

/// An append-only intern pool for record identifiers.
///
/// Equal canonical strings intern to the same allocation, so identifiers
/// handed to the host runtime satisfy pointer equality. Entries are never
/// evicted; memory is bounded by the number of distinct identifiers
/// observed. The cache is explicitly owned (one per collection runtime)
/// rather than process-global so tests can start from a clean pool.
#[derive(Debug, Default)]
pub struct IdentityCache {
    pool: Mutex<HashMap<String, RecordId>>,
}

impl IdentityCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns any accepted identifier input.
    ///
    /// Returns `None` when the input does not denote a record identifier.
    pub fn intern(&self, input: &RecordIdInput) -> Option<RecordId> {
        self.intern_canonical(input.to_canonical_string()?)
    }

    /// Interns a textual variant.
    pub fn intern_str(&self, input: &str) -> Option<RecordId> {
        self.intern(&RecordIdInput::Text(input.to_owned()))
    }

    /// Interns `(table, key)` parts.
    pub fn intern_parts(&self, table: &str, key: &str) -> Option<RecordId> {
        let id = RecordId::from_parts(table, key)?;
        Some(self.adopt(&id))
    }

    /// Returns the pool-resident instance for an existing identifier.
    ///
    /// If an equal identifier is already interned that instance is returned;
    /// otherwise `id` itself joins the pool.
    pub fn adopt(&self, id: &RecordId) -> RecordId {
        let mut pool = self.pool.lock();
        pool.entry(id.canonical().to_owned())
            .or_insert_with(|| id.clone())
            .clone()
    }

    // Canonical strings are already unwrapped; split without re-parsing so
    // keys that still look quoted or bracketed stay byte-identical.
    fn intern_canonical(&self, canonical: String) -> Option<RecordId> {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.get(&canonical) {
            return Some(existing.clone());
        }
        let (table, key) = canonical.split_once(':')?;
        let id = RecordId::from_parts(table, key)?;
        pool.insert(canonical, id.clone());
        Some(id)
    }

    /// Number of distinct identifiers interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    /// True if nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_canonicals_share_one_allocation() {
        let cache = IdentityCache::new();
        let a = cache.intern_str("products:1").unwrap();
        let b = cache.intern_str("'products:1'").unwrap();
        let c = cache.intern_str("products:⟨1⟩").unwrap();
        assert!(RecordId::same_ref(&a, &b));
        assert!(RecordId::same_ref(&b, &c));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_ids_distinct_allocations() {
        let cache = IdentityCache::new();
        let a = cache.intern_str("products:1").unwrap();
        let b = cache.intern_str("products:2").unwrap();
        assert!(!RecordId::same_ref(&a, &b));
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn adopt_prefers_existing() {
        let cache = IdentityCache::new();
        let interned = cache.intern_str("task:1").unwrap();
        let outside = RecordId::parse("task:1").unwrap();
        assert!(!RecordId::same_ref(&interned, &outside));
        let adopted = cache.adopt(&outside);
        assert!(RecordId::same_ref(&interned, &adopted));
    }

    #[test]
    fn adopt_registers_new() {
        let cache = IdentityCache::new();
        let outside = RecordId::parse("task:9").unwrap();
        let adopted = cache.adopt(&outside);
        assert!(RecordId::same_ref(&outside, &adopted));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn non_id_inputs_do_not_pollute_pool() {
        let cache = IdentityCache::new();
        assert!(cache.intern_str("not an id").is_none());
        assert!(cache.intern_str("9table:1").is_none());
        assert!(cache.is_empty());
    }
}
