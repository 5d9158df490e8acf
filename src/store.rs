//! In-memory entry store.
//!
//! The store maps canonical key tokens to [`QueryEntry`] values and owns the
//! per-key generation counters. Generations live beside the entries, not in
//! them, so restoring an old entry can never move a counter backwards.
//!
//! Every public method takes the store lock once. Operations that must be
//! atomic across several keys or steps (a generation check followed by a
//! write, a snapshot followed by a patch) go through [`EntryStore::with_entries`].
//! The lock is never held across an `.await`.

mod entry;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

pub use entry::{QueryData, QueryEntry, QueryStatus};

use crate::key::{KeyToken, QueryKey};

/// The synchronized state of an [`EntryStore`].
#[derive(Debug, Default)]
pub struct Entries {
    map: HashMap<KeyToken, QueryEntry>,
    generations: HashMap<KeyToken, u64>,
}

impl Entries {
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<&QueryEntry> {
        self.map.get(key.token())
    }

    /// Replaces the entry for its key, stamping `last_updated` with the
    /// current time.
    pub fn set(&mut self, mut entry: QueryEntry) {
        entry.last_updated = Some(Instant::now());
        self.restore(entry);
    }

    /// Replaces the entry for its key verbatim.
    pub fn restore(&mut self, entry: QueryEntry) {
        self.map.insert(entry.key.token().clone(), entry);
    }

    pub fn delete(&mut self, key: &QueryKey) -> Option<QueryEntry> {
        self.map.remove(key.token())
    }

    /// Returns the key's current generation (zero if it was never bumped).
    #[must_use]
    pub fn generation(&self, key: &QueryKey) -> u64 {
        self.generations.get(key.token()).copied().unwrap_or(0)
    }

    /// Increments and returns the key's generation.
    pub fn bump_generation(&mut self, key: &QueryKey) -> u64 {
        let generation = self.generations.entry(key.token().clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Iterates over every entry whose key has `pattern` as a prefix.
    pub fn matching<'a>(&'a self, pattern: &'a QueryKey) -> impl Iterator<Item = &'a QueryEntry> {
        self.map
            .values()
            .filter(move |entry| pattern.is_prefix_of(&entry.key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Thread-safe store of query entries.
#[derive(Default)]
pub struct EntryStore {
    entries: Mutex<Entries>,
    poisoned: AtomicBool,
}

impl EntryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to the entries.
    ///
    /// `f` must not call back into the store.
    pub fn with_entries<R>(&self, f: impl FnOnce(&mut Entries) -> R) -> R {
        // A panic inside `f` cannot leave a half-written entry behind because
        // entries are replaced wholesale, so a poisoned mutex is still usable.
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut entries)
    }

    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<QueryEntry> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    /// Replaces the entry for its key and stamps `last_updated`.
    pub fn set(&self, entry: QueryEntry) {
        self.with_entries(|entries| entries.set(entry));
    }

    /// Replaces the entry for its key without touching any field.
    pub fn restore(&self, entry: QueryEntry) {
        self.with_entries(|entries| entries.restore(entry));
    }

    pub fn delete(&self, key: &QueryKey) -> Option<QueryEntry> {
        self.with_entries(|entries| entries.delete(key))
    }

    /// Returns all entries whose key has `pattern` as a prefix.
    #[must_use]
    pub fn match_prefix(&self, pattern: &QueryKey) -> Vec<QueryEntry> {
        self.with_entries(|entries| entries.matching(pattern).cloned().collect())
    }

    #[must_use]
    pub fn generation(&self, key: &QueryKey) -> u64 {
        self.with_entries(|entries| entries.generation(key))
    }

    pub fn bump_generation(&self, key: &QueryKey) -> u64 {
        self.with_entries(|entries| entries.bump_generation(key))
    }

    /// Marks every entry under `pattern` as invalidated and bumps its
    /// generation, so in-flight fetches for those keys are discarded and the
    /// next query refetches. Returns the invalidated keys.
    pub fn invalidate_prefix(&self, pattern: &QueryKey) -> Vec<QueryKey> {
        self.with_entries(|entries| {
            let keys: Vec<QueryKey> = entries.matching(pattern).map(|e| e.key.clone()).collect();
            for key in &keys {
                let generation = entries.bump_generation(key);
                if let Some(entry) = entries.delete(key) {
                    entries.restore(entry.invalidated(generation));
                }
            }
            keys
        })
    }

    /// Removes every entry under `pattern` and bumps its generation. Returns
    /// the removed keys.
    pub fn evict_prefix(&self, pattern: &QueryKey) -> Vec<QueryKey> {
        self.with_entries(|entries| {
            let keys: Vec<QueryKey> = entries.matching(pattern).map(|e| e.key.clone()).collect();
            for key in &keys {
                entries.bump_generation(key);
                entries.delete(key);
            }
            keys
        })
    }

    /// Keeps only the entries for which `keep` returns `true`. Returns the
    /// removed keys.
    pub fn retain(&self, mut keep: impl FnMut(&QueryEntry) -> bool) -> Vec<QueryKey> {
        self.with_entries(|entries| {
            let mut removed = Vec::new();
            entries.map.retain(|_, entry| {
                let kept = keep(entry);
                if !kept {
                    removed.push(entry.key.clone());
                }
                kept
            });
            removed
        })
    }

    /// Removes every entry. Generations are kept so late fetch results for
    /// cleared keys are still discarded.
    pub fn clear(&self) -> Vec<QueryKey> {
        self.with_entries(|entries| {
            let keys: Vec<QueryKey> = entries.map.values().map(|e| e.key.clone()).collect();
            for key in &keys {
                entries.bump_generation(key);
            }
            entries.map.clear();
            keys
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the store as untrustworthy after a failed rollback.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("len", &self.len())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::query_key;

    fn success(key: &QueryKey, value: i32) -> QueryEntry {
        QueryEntry::new(key.clone()).succeeded(Arc::new(value), 0)
    }

    #[test]
    fn test_store_cache_operations() {
        let store = EntryStore::new();
        let key = query_key!["facility", "F1"].expect("valid key");

        // Initially no entry
        assert!(store.get(&key).is_none());

        store.set(success(&key, 42));
        let cached = store.get(&key).expect("entry should be stored");
        assert_eq!(cached.data::<i32>().as_deref(), Some(&42));
        assert!(cached.last_updated.is_some());

        assert!(store.delete(&key).is_some());
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_replaces_entry_for_same_key() {
        let store = EntryStore::new();
        let a = query_key!["search", serde_json::json!({"city": "Oslo", "page": 1})]
            .expect("valid key");
        let b = query_key!["search", serde_json::json!({"page": 1, "city": "Oslo"})]
            .expect("valid key");

        store.set(success(&a, 1));
        store.set(success(&b, 2));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).and_then(|e| e.data::<i32>()).as_deref(), Some(&2));
    }

    #[test]
    fn test_restore_is_verbatim() {
        let store = EntryStore::new();
        let key = QueryKey::from("documents");
        let entry = success(&key, 1);

        store.restore(entry.clone());
        assert_eq!(store.get(&key), Some(entry));
    }

    #[test]
    fn test_match_prefix() {
        let store = EntryStore::new();
        let u1 = query_key!["bookings", "u1"].expect("valid key");
        let u2 = query_key!["bookings", "u2"].expect("valid key");
        let tours = query_key!["tours", "u1"].expect("valid key");
        store.set(success(&u1, 1));
        store.set(success(&u2, 2));
        store.set(success(&tours, 3));

        let pattern = QueryKey::from("bookings");
        let mut keys: Vec<_> = store.match_prefix(&pattern).into_iter().map(|e| e.key).collect();
        keys.sort();
        assert_eq!(keys, vec![u1.clone(), u2]);

        assert_eq!(store.match_prefix(&u1).len(), 1);
        assert_eq!(store.match_prefix(&QueryKey::root()).len(), 3);
    }

    #[test]
    fn test_generation_is_monotonic() {
        let store = EntryStore::new();
        let key = QueryKey::from("reviews");
        assert_eq!(store.generation(&key), 0);
        assert_eq!(store.bump_generation(&key), 1);
        assert_eq!(store.bump_generation(&key), 2);

        // Restoring an entry stamped with an older generation leaves the counter alone.
        store.restore(success(&key, 1));
        assert_eq!(store.generation(&key), 2);
    }

    #[test]
    fn test_invalidate_prefix() {
        let store = EntryStore::new();
        let u1 = query_key!["bookings", "u1"].expect("valid key");
        let u2 = query_key!["bookings", "u2"].expect("valid key");
        store.set(success(&u1, 1));
        store.set(success(&u2, 2));

        let invalidated = store.invalidate_prefix(&u1);
        assert_eq!(invalidated, vec![u1.clone()]);
        assert!(store.get(&u1).is_some_and(|e| e.is_invalidated));
        assert!(store.get(&u2).is_some_and(|e| !e.is_invalidated));

        let invalidated = store.invalidate_prefix(&QueryKey::from("bookings"));
        assert_eq!(invalidated.len(), 2);
        assert!(store.get(&u2).is_some_and(|e| e.is_invalidated));
        assert_eq!(store.generation(&u1), 2);
        assert_eq!(store.generation(&u2), 1);
    }

    #[test]
    fn test_evict_prefix_and_clear() {
        let store = EntryStore::new();
        let u1 = query_key!["bookings", "u1"].expect("valid key");
        let doc = query_key!["documents", 7].expect("valid key");
        store.set(success(&u1, 1));
        store.set(success(&doc, 2));

        assert_eq!(store.evict_prefix(&QueryKey::from("bookings")), vec![u1.clone()]);
        assert!(store.get(&u1).is_none());
        assert_eq!(store.generation(&u1), 1);

        assert_eq!(store.clear(), vec![doc.clone()]);
        assert!(store.is_empty());
        assert_eq!(store.generation(&doc), 1);
    }

    #[test]
    fn test_retain() {
        let store = EntryStore::new();
        let keep = QueryKey::from("keep");
        let expired = QueryKey::from("expired");
        store.set(success(&keep, 1));
        store.set(success(&expired, 2));

        let removed = store.retain(|entry| entry.key == keep);
        assert_eq!(removed, vec![expired]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_poison() {
        let store = EntryStore::new();
        assert!(!store.is_poisoned());
        store.poison();
        assert!(store.is_poisoned());
    }
}
