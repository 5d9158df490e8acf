use std::fmt;
use std::sync::Arc;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::store::{Entries, QueryData, QueryEntry};

use super::snapshot::MutationSnapshot;

type Updater = Box<dyn FnOnce(Option<QueryData>) -> Result<QueryData, QueryError> + Send>;

enum PatchOp {
    Update { key: QueryKey, updater: Updater },
    Set { key: QueryKey, data: QueryData },
    Remove { key: QueryKey },
}

impl PatchOp {
    const fn key(&self) -> &QueryKey {
        match self {
            Self::Update { key, .. } | Self::Set { key, .. } | Self::Remove { key } => key,
        }
    }
}

/// Cache edits applied before a mutation runs and rolled back if it fails.
///
/// ```
/// use cachet::{OptimisticPatch, query_key};
///
/// let facility = query_key!["facility", "F1"].unwrap();
/// let patch = OptimisticPatch::new()
///     .update(facility.clone(), |name: Option<&String>| {
///         name.map_or_else(String::new, |name| format!("{name} (renamed)"))
///     });
/// assert_eq!(patch.touched_keys(), vec![facility]);
/// ```
#[derive(Default)]
pub struct OptimisticPatch {
    ops: Vec<PatchOp>,
}

impl OptimisticPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the data at `key` with `f(current)`.
    ///
    /// `current` is `None` when the key has no data. Applying the patch fails
    /// with [`QueryError::TypeMismatch`] if the cached data is not a `T`.
    #[must_use]
    pub fn update<T, F>(mut self, key: QueryKey, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> T + Send + 'static,
    {
        let name = key.to_string();
        let updater: Updater = Box::new(move |current: Option<QueryData>| {
            let current = current
                .map(|data| {
                    data.downcast::<T>()
                        .map_err(|_| QueryError::TypeMismatch { key: name })
                })
                .transpose()?;
            Ok(Arc::new(f(current.as_deref())) as QueryData)
        });
        self.ops.push(PatchOp::Update { key, updater });
        self
    }

    /// Writes `value` at `key`.
    #[must_use]
    pub fn set<T: Send + Sync + 'static>(mut self, key: QueryKey, value: T) -> Self {
        self.ops.push(PatchOp::Set {
            key,
            data: Arc::new(value),
        });
        self
    }

    /// Removes the entry at `key`.
    #[must_use]
    pub fn remove(mut self, key: QueryKey) -> Self {
        self.ops.push(PatchOp::Remove { key });
        self
    }

    /// Returns every key the patch writes, sorted by token and deduplicated.
    #[must_use]
    pub fn touched_keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.ops.iter().map(|op| op.key().clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Snapshots the touched keys, then applies every edit in order.
    ///
    /// Each written key's generation is bumped so fetches dispatched before
    /// the patch cannot overwrite it. If an edit fails, everything already
    /// applied is restored and the error is returned.
    pub(crate) fn apply(self, entries: &mut Entries) -> Result<MutationSnapshot, QueryError> {
        let snapshot = MutationSnapshot::capture(entries, self.touched_keys());

        for op in self.ops {
            if let Err(error) = apply_op(entries, op) {
                snapshot.restore_into(entries)?;
                return Err(error);
            }
        }

        Ok(snapshot)
    }
}

fn apply_op(entries: &mut Entries, op: PatchOp) -> Result<(), QueryError> {
    let generation = entries.bump_generation(op.key());
    match op {
        PatchOp::Update { key, updater } => {
            let base = entries.get(&key).cloned();
            let data = updater(base.as_ref().and_then(|entry| entry.data.clone()))?;
            let base = base.unwrap_or_else(|| QueryEntry::new(key));
            entries.set(base.succeeded(data, generation));
        }
        PatchOp::Set { key, data } => {
            let base = entries
                .get(&key)
                .cloned()
                .unwrap_or_else(|| QueryEntry::new(key));
            entries.set(base.succeeded(data, generation));
        }
        PatchOp::Remove { key } => {
            entries.delete(&key);
        }
    }
    Ok(())
}

impl fmt::Debug for OptimisticPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticPatch")
            .field("keys", &self.touched_keys())
            .finish()
    }
}
