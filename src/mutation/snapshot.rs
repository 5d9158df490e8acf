use tracing::error;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::store::{Entries, EntryStore, QueryEntry, QueryStatus};

/// The entries an optimistic patch is about to overwrite.
///
/// `prior_entries[i]` is the entry stored under `touched_keys[i]` before the
/// patch, or `None` if the key had no entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MutationSnapshot {
    pub touched_keys: Vec<QueryKey>,
    pub prior_entries: Vec<Option<QueryEntry>>,
}

impl MutationSnapshot {
    pub(crate) fn capture(entries: &Entries, touched_keys: Vec<QueryKey>) -> Self {
        let prior_entries = touched_keys
            .iter()
            .map(|key| entries.get(key).cloned())
            .collect();
        Self {
            touched_keys,
            prior_entries,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.touched_keys.is_empty()
    }

    /// Puts every captured entry back verbatim and deletes keys that had no
    /// entry. Nothing is written if the snapshot is inconsistent.
    ///
    /// A captured `Loading` entry is restored settled unless the key is
    /// loading again, since the fetch it was waiting on no longer writes.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::RollbackError`] if the keys and entries do not
    /// line up.
    pub fn restore_into(&self, entries: &mut Entries) -> Result<(), QueryError> {
        if self.touched_keys.len() != self.prior_entries.len() {
            return Err(QueryError::RollbackError(format!(
                "snapshot has {} keys but {} entries",
                self.touched_keys.len(),
                self.prior_entries.len()
            )));
        }

        let misplaced = self
            .touched_keys
            .iter()
            .zip(&self.prior_entries)
            .find_map(|(key, prior)| prior.as_ref().filter(|entry| entry.key != *key));
        if let Some(entry) = misplaced {
            return Err(QueryError::RollbackError(format!(
                "snapshot entry for {} is filed under another key",
                entry.key
            )));
        }

        for (key, prior) in self.touched_keys.iter().zip(&self.prior_entries) {
            match prior {
                Some(entry) => {
                    // A fetch that was loading at capture time may have
                    // finished since. Only a loading entry stays loading.
                    let loading = entries
                        .get(key)
                        .is_some_and(|current| current.status == QueryStatus::Loading);
                    let entry = if loading {
                        entry.clone()
                    } else {
                        entry.clone().settled()
                    };
                    entries.restore(entry);
                }
                None => {
                    entries.delete(key);
                }
            }
        }
        Ok(())
    }

    /// Restores the snapshot into `store`, poisoning it on failure.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::RollbackError`] if the snapshot is inconsistent.
    pub fn restore(&self, store: &EntryStore) -> Result<(), QueryError> {
        store
            .with_entries(|entries| self.restore_into(entries))
            .inspect_err(|e| {
                error!(error = %e, "rollback failed, poisoning the store");
                store.poison();
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_restore_puts_back_and_deletes() {
        let store = EntryStore::new();
        let existing = QueryKey::from("existing");
        let created = QueryKey::from("created");
        store.set(QueryEntry::new(existing.clone()).succeeded(Arc::new(1), 0));

        let snapshot = store.with_entries(|entries| {
            MutationSnapshot::capture(entries, vec![created.clone(), existing.clone()])
        });
        let before = store.get(&existing);

        store.set(QueryEntry::new(existing.clone()).succeeded(Arc::new(2), 1));
        store.set(QueryEntry::new(created.clone()).succeeded(Arc::new(3), 1));

        snapshot.restore(&store).expect("restore should succeed");
        assert_eq!(store.get(&existing), before);
        assert!(store.get(&created).is_none());
        assert!(!store.is_poisoned());
    }

    #[test]
    fn test_loading_entry_is_restored_settled() {
        let store = EntryStore::new();
        let key = QueryKey::from("tours");
        store.restore(
            QueryEntry::new(key.clone())
                .succeeded(Arc::new(1), 1)
                .loading(2, std::time::Duration::ZERO),
        );

        let snapshot =
            store.with_entries(|entries| MutationSnapshot::capture(entries, vec![key.clone()]));
        store.set(QueryEntry::new(key.clone()).succeeded(Arc::new(2), 3));

        snapshot.restore(&store).expect("restore should succeed");
        let restored = store.get(&key).expect("restored entry");
        assert_eq!(restored.status, QueryStatus::Success);
        assert_eq!(restored.data::<i32>().as_deref(), Some(&1));
        assert_eq!(restored.generation, 2);
    }

    #[test]
    fn test_inconsistent_snapshot_poisons_store() {
        let store = EntryStore::new();
        let key = QueryKey::from("documents");
        store.set(QueryEntry::new(key.clone()).succeeded(Arc::new(1), 0));

        let snapshot = MutationSnapshot {
            touched_keys: vec![key.clone(), QueryKey::from("other")],
            prior_entries: vec![None],
        };

        let result = snapshot.restore(&store);
        assert!(matches!(result, Err(QueryError::RollbackError(_))));
        assert!(store.is_poisoned());
        // Nothing was written.
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn test_misfiled_entry_is_rejected() {
        let store = EntryStore::new();
        let snapshot = MutationSnapshot {
            touched_keys: vec![QueryKey::from("a")],
            prior_entries: vec![Some(QueryEntry::new(QueryKey::from("b")))],
        };

        assert!(matches!(
            snapshot.restore(&store),
            Err(QueryError::RollbackError(_))
        ));
        assert!(store.is_empty());
    }
}
