//! Mutations with optimistic updates and rollback.
//!
//! A mutation is a one-off write to the backend. [`MutationEngine::mutate`]
//! wraps it in a small transaction against the cache:
//!
//! 1. The per-key locks of every key the [`OptimisticPatch`] touches are
//!    acquired, so mutations on overlapping keys run one after another in
//!    call order.
//! 2. The touched entries are snapshotted and the patch is applied in one
//!    critical section, and subscribers are notified.
//! 3. The mutator runs.
//! 4. On success every key declared with [`MutationOptions::invalidates`] is
//!    invalidated, so the next query refetches it. On failure the snapshot is
//!    restored verbatim and the error is returned as
//!    [`QueryError::MutationError`]. Dropping the mutation future before the
//!    mutator settles rolls the patch back too.
//!
//! # Example
//!
//! ```
//! use cachet::{MutationOptions, OptimisticPatch, QueryClient, QueryError, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! let facility = query_key!["facility", "F1"]?;
//! client.set_query_data(&facility, "Sunny Hills".to_string());
//!
//! let options = MutationOptions::new()
//!     .optimistic(OptimisticPatch::new().set(facility.clone(), "Sunnier Hills".to_string()))
//!     .invalidates(query_key!["facility"]?);
//!
//! let result: Result<(), _> = client
//!     .mutate(|| async { Err(QueryError::http(500, "rename failed")) }, options)
//!     .await;
//! assert!(matches!(result, Err(QueryError::MutationError(_))));
//!
//! // The optimistic name was rolled back.
//! let name = client.get_query_data::<String>(&facility)?;
//! assert_eq!(name.as_deref().map(String::as_str), Some("Sunny Hills"));
//! # Ok(())
//! # }
//! ```

mod patch;
mod queue;
mod snapshot;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

pub use patch::OptimisticPatch;
pub use snapshot::MutationSnapshot;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::store::EntryStore;
use crate::subscription::{NotifyCause, SubscriptionHub};
use queue::KeyLocks;

/// What a mutation does to the cache around the mutator call.
#[derive(Debug, Default)]
pub struct MutationOptions {
    optimistic: Option<OptimisticPatch>,
    invalidates: Vec<QueryKey>,
}

impl MutationOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `patch` before the mutator runs and rolls it back if the
    /// mutator fails.
    #[must_use]
    pub fn optimistic(mut self, patch: OptimisticPatch) -> Self {
        self.optimistic = Some(patch);
        self
    }

    /// Invalidates every key under `pattern` once the mutator succeeds.
    #[must_use]
    pub fn invalidates(mut self, pattern: QueryKey) -> Self {
        self.invalidates.push(pattern);
        self
    }
}

/// Runs mutators against the entry store.
#[derive(Debug, Clone)]
pub struct MutationEngine {
    store: Arc<EntryStore>,
    hub: Arc<SubscriptionHub>,
    locks: Arc<KeyLocks>,
}

impl MutationEngine {
    #[must_use]
    pub fn new(store: Arc<EntryStore>, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            store,
            hub,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Runs `mutator` with the optimistic patch and invalidations described
    /// by `options`.
    ///
    /// # Errors
    ///
    /// - [`QueryError::MutationError`] wrapping the mutator's error, after
    ///   the patch was rolled back.
    /// - [`QueryError::TypeMismatch`] if the patch could not be applied; the
    ///   mutator is not called.
    /// - [`QueryError::RollbackError`] if the rollback failed. The store is
    ///   poisoned.
    /// - [`QueryError::Poisoned`] if the store was already poisoned.
    pub async fn mutate<T, F, Fut>(
        &self,
        mutator: F,
        options: MutationOptions,
    ) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        if self.store.is_poisoned() {
            return Err(QueryError::Poisoned);
        }

        let MutationOptions {
            optimistic,
            invalidates,
        } = options;

        let touched = optimistic
            .as_ref()
            .map(OptimisticPatch::touched_keys)
            .unwrap_or_default();
        let _guards = self.locks.acquire(&touched).await;

        // A mutation that held our locks may have poisoned the store.
        if self.store.is_poisoned() {
            return Err(QueryError::Poisoned);
        }

        // Dropped before `_guards`, so an abandoned mutation is rolled back
        // while it still holds its key locks.
        let mut rollback = Rollback {
            store: &self.store,
            hub: &self.hub,
            snapshot: None,
        };
        if let Some(patch) = optimistic {
            let snapshot = self.store.with_entries(|entries| patch.apply(entries))?;
            debug!(keys = ?snapshot.touched_keys, "applied optimistic patch");
            self.hub
                .notify_all(&snapshot.touched_keys, NotifyCause::Optimistic);
            rollback.snapshot = Some(snapshot);
        }

        let outcome = mutator().await;
        let snapshot = rollback.disarm();
        match outcome {
            Ok(value) => {
                let invalidated: Vec<QueryKey> = invalidates
                    .iter()
                    .flat_map(|pattern| self.store.invalidate_prefix(pattern))
                    .collect();
                debug!(invalidated = invalidated.len(), "mutation succeeded");
                self.hub.notify_all(&invalidated, NotifyCause::Invalidated);
                Ok(value)
            }
            Err(error) => {
                if let Some(snapshot) = snapshot {
                    snapshot.restore(&self.store)?;
                    self.hub
                        .notify_all(&snapshot.touched_keys, NotifyCause::RolledBack);
                }
                debug!(%error, "mutation failed, optimistic patch rolled back");
                Err(QueryError::MutationError(Box::new(error)))
            }
        }
    }
}

/// Restores an applied optimistic patch if the mutation future is dropped
/// before the mutator settles.
struct Rollback<'a> {
    store: &'a EntryStore,
    hub: &'a SubscriptionHub,
    snapshot: Option<MutationSnapshot>,
}

impl Rollback<'_> {
    fn disarm(&mut self) -> Option<MutationSnapshot> {
        self.snapshot.take()
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };
        warn!(keys = ?snapshot.touched_keys, "mutation abandoned, rolling back");
        if snapshot.restore(self.store).is_ok() {
            self.hub
                .notify_all(&snapshot.touched_keys, NotifyCause::RolledBack);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::QueryEntry;
    use crate::subscription::Notification;

    fn engine() -> MutationEngine {
        MutationEngine::new(Arc::new(EntryStore::new()), Arc::new(SubscriptionHub::new()))
    }

    fn seed(engine: &MutationEngine, key: &QueryKey, value: i32) {
        engine
            .store
            .set(QueryEntry::new(key.clone()).succeeded(Arc::new(value), 0));
    }

    fn causes(engine: &MutationEngine) -> Arc<Mutex<Vec<NotifyCause>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.hub.subscribe(QueryKey::root(), move |n: &Notification| {
            sink.lock().expect("sink lock").push(n.cause);
        });
        seen
    }

    #[tokio::test]
    async fn test_success_invalidates_declared_keys() {
        let engine = engine();
        let count = QueryKey::from("count");
        let list = QueryKey::from("list");
        seed(&engine, &count, 1);
        seed(&engine, &list, 10);
        let seen = causes(&engine);

        let options = MutationOptions::new()
            .optimistic(OptimisticPatch::new().update(count.clone(), |n: Option<&i32>| {
                n.copied().unwrap_or(0) + 1
            }))
            .invalidates(list.clone());
        let result = engine.mutate(|| async { Ok("saved") }, options).await;

        assert_eq!(result, Ok("saved"));
        let entry = engine.store.get(&count).expect("count entry");
        assert_eq!(entry.data::<i32>().as_deref(), Some(&2));
        assert!(engine.store.get(&list).is_some_and(|e| e.is_invalidated));
        assert_eq!(
            *seen.lock().expect("sink lock"),
            vec![NotifyCause::Optimistic, NotifyCause::Invalidated]
        );
    }

    #[tokio::test]
    async fn test_failure_rolls_back() {
        let engine = engine();
        let count = QueryKey::from("count");
        seed(&engine, &count, 1);
        let before = engine.store.get(&count);
        let seen = causes(&engine);

        let options = MutationOptions::new()
            .optimistic(OptimisticPatch::new().set(count.clone(), 99))
            .invalidates(count.clone());
        let result: Result<(), _> = engine
            .mutate(|| async { Err(QueryError::http(409, "conflict")) }, options)
            .await;

        assert_eq!(
            result,
            Err(QueryError::MutationError(Box::new(QueryError::http(409, "conflict"))))
        );
        assert_eq!(engine.store.get(&count), before);
        assert_eq!(
            *seen.lock().expect("sink lock"),
            vec![NotifyCause::Optimistic, NotifyCause::RolledBack]
        );
    }

    #[tokio::test]
    async fn test_patch_type_mismatch_skips_mutator() {
        let engine = engine();
        let count = QueryKey::from("count");
        seed(&engine, &count, 1);
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);

        let options = MutationOptions::new().optimistic(
            OptimisticPatch::new().update(count.clone(), |s: Option<&String>| {
                s.cloned().unwrap_or_default()
            }),
        );
        let result = engine
            .mutate(
                || async move {
                    *flag.lock().expect("flag lock") = true;
                    Ok(())
                },
                options,
            )
            .await;

        assert!(matches!(result, Err(QueryError::TypeMismatch { .. })));
        assert!(!*called.lock().expect("flag lock"));
        assert_eq!(engine.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_mutation_rolls_back() {
        let engine = engine();
        let count = QueryKey::from("count");
        seed(&engine, &count, 1);
        let before = engine.store.get(&count);
        let seen = causes(&engine);

        let options =
            MutationOptions::new().optimistic(OptimisticPatch::new().set(count.clone(), 99));
        let mutator = futures::future::pending::<Result<(), QueryError>>;
        let mut pending = Box::pin(engine.mutate(mutator, options));
        assert!(futures::poll!(&mut pending).is_pending());
        assert_eq!(
            engine.store.get(&count).and_then(|e| e.data::<i32>()).as_deref(),
            Some(&99)
        );

        drop(pending);
        assert_eq!(engine.store.get(&count), before);
        assert_eq!(engine.locks.len(), 0);
        assert_eq!(
            *seen.lock().expect("sink lock"),
            vec![NotifyCause::Optimistic, NotifyCause::RolledBack]
        );
    }

    #[tokio::test]
    async fn test_poisoned_store_refuses_mutations() {
        let engine = engine();
        engine.store.poison();

        let result = engine
            .mutate(|| async { Ok(()) }, MutationOptions::new())
            .await;
        assert_eq!(result, Err(QueryError::Poisoned));
    }
}
