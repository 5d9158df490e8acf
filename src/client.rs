//! The query client facade.
//!
//! [`QueryClient`] wires the entry store, fetch executor, mutation engine and
//! subscription hub together behind one cheaply clonable handle. Clones share
//! the same cache.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use cachet::{QueryClient, QueryConfig, QueryError, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = QueryClient::with_config(QueryConfig::new(
//!     Duration::from_secs(30),  // stale_time
//!     Duration::from_secs(300), // cache_time
//! ));
//!
//! let key = query_key!["facility", "F1"]?;
//! let name = client
//!     .query(&key, |_signal| async { Ok("Sunny Hills".to_string()) })
//!     .await?;
//! assert_eq!(name.as_str(), "Sunny Hills");
//!
//! // Marks the entry stale; the next query refetches.
//! assert_eq!(client.invalidate(&query_key!["facility"]?), 1);
//! # Ok(())
//! # }
//! ```

mod config;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use config::{QueryConfig, QueryOptions};

use crate::error::QueryError;
use crate::fetch::FetchExecutor;
use crate::key::QueryKey;
use crate::mutation::{MutationEngine, MutationOptions};
use crate::store::{EntryStore, QueryEntry};
use crate::subscription::{Notification, NotifyCause, SubscriptionHandle, SubscriptionHub};

/// A client for querying, mutating and observing cached data.
#[derive(Debug, Clone)]
pub struct QueryClient {
    store: Arc<EntryStore>,
    hub: Arc<SubscriptionHub>,
    executor: FetchExecutor,
    mutations: MutationEngine,
    config: Arc<QueryConfig>,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        let store = Arc::new(EntryStore::new());
        let hub = Arc::new(SubscriptionHub::new());
        Self {
            executor: FetchExecutor::new(Arc::clone(&store), Arc::clone(&hub)),
            mutations: MutationEngine::new(Arc::clone(&store), Arc::clone(&hub)),
            store,
            hub,
            config: Arc::new(config),
        }
    }

    /// Gets the query configuration.
    #[must_use]
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Returns the data for `key`, calling `fetcher` only if the cached entry
    /// is missing, stale, invalidated or failed. Concurrent queries for the
    /// same key share one fetch.
    ///
    /// # Errors
    ///
    /// See [`QueryClient::query_with`].
    pub async fn query<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        self.query_with(key, fetcher, QueryOptions::default()).await
    }

    /// Like [`QueryClient::query`], with per-call overrides.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's last error once retries are exhausted,
    /// [`QueryError::Cancelled`] if the options' token fires,
    /// [`QueryError::TypeMismatch`] if the cached value is not a `T`, and
    /// [`QueryError::Poisoned`] after a failed rollback.
    pub async fn query_with<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: QueryOptions,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let options = options.resolve(&self.config);
        self.executor.run(key, fetcher, &options).await
    }

    /// Runs `mutator` with optional optimistic updates and declared
    /// invalidations.
    ///
    /// # Errors
    ///
    /// See [`MutationEngine::mutate`].
    pub async fn mutate<T, F, Fut>(
        &self,
        mutator: F,
        options: MutationOptions,
    ) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        self.mutations.mutate(mutator, options).await
    }

    /// Invalidates every entry under `pattern`. In-flight fetches for those
    /// keys are discarded and the next query refetches. Returns the number
    /// of invalidated entries.
    pub fn invalidate(&self, pattern: &QueryKey) -> usize {
        let keys = self.store.invalidate_prefix(pattern);
        debug!(pattern = %pattern, count = keys.len(), "invalidated queries");
        self.hub.notify_all(&keys, NotifyCause::Invalidated);
        keys.len()
    }

    /// Calls `callback` after every write to a key under `pattern`.
    pub fn subscribe<F>(&self, pattern: &QueryKey, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.hub.subscribe(pattern.clone(), callback)
    }

    /// Returns a stream of writes to keys under `pattern`.
    pub fn watch(&self, pattern: &QueryKey) -> BoxStream<'static, Notification> {
        self.hub.watch(pattern.clone())
    }

    /// Returns the cached data for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the cached value is not a `T`.
    pub fn get_query_data<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Result<Option<Arc<T>>, QueryError> {
        self.store
            .get(key)
            .and_then(|entry| entry.data)
            .map(|data| {
                data.downcast::<T>().map_err(|_| QueryError::TypeMismatch {
                    key: key.to_string(),
                })
            })
            .transpose()
    }

    /// Returns a copy of the entry for `key`.
    #[must_use]
    pub fn entry(&self, key: &QueryKey) -> Option<QueryEntry> {
        self.store.get(key)
    }

    /// Writes `value` as fresh data for `key`. A fetch in flight for the key
    /// will not overwrite it.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        self.store.with_entries(|entries| {
            let generation = entries.bump_generation(key);
            let base = entries
                .get(key)
                .cloned()
                .unwrap_or_else(|| QueryEntry::new(key.clone()));
            entries.set(base.succeeded(Arc::new(value), generation));
        });
        self.hub
            .notify(&Notification::new(key.clone(), NotifyCause::Set));
    }

    /// Removes every entry under `pattern`. Results of fetches in flight for
    /// them are dropped. Returns the number of removed entries.
    pub fn evict(&self, pattern: &QueryKey) -> usize {
        let keys = self.store.evict_prefix(pattern);
        debug!(pattern = %pattern, count = keys.len(), "evicted queries");
        self.hub.notify_all(&keys, NotifyCause::Evicted);
        keys.len()
    }

    /// Removes settled entries not updated for `cache_time` whose keys no
    /// subscriber watches. Returns the number of removed entries.
    pub fn collect_garbage(&self) -> usize {
        collect_garbage(&self.store, &self.hub, self.config.cache_time)
    }

    /// Spawns a task that calls [`QueryClient::collect_garbage`] every
    /// `period`. The task ends once every clone of the client is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero or if called outside a tokio runtime.
    pub fn spawn_garbage_collector(&self, period: Duration) -> JoinHandle<()> {
        let store: Weak<EntryStore> = Arc::downgrade(&self.store);
        let hub: Weak<SubscriptionHub> = Arc::downgrade(&self.hub);
        let cache_time = self.config.cache_time;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;
                let (Some(store), Some(hub)) = (store.upgrade(), hub.upgrade()) else {
                    debug!("query client dropped, stopping garbage collector");
                    break;
                };
                collect_garbage(&store, &hub, cache_time);
            }
        })
    }

    /// Cancels every in-flight fetch and removes every entry.
    pub fn clear(&self) {
        self.executor.cancel_all();
        let keys = self.store.clear();
        debug!(count = keys.len(), "cleared query cache");
        self.hub.notify_all(&keys, NotifyCause::Evicted);
    }

    /// Returns `true` if a fetch for `key` is in flight.
    #[must_use]
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.executor.is_fetching(key)
    }

    /// Returns `true` once a failed rollback has left the cache untrustworthy.
    /// A poisoned client refuses every query and mutation and must be
    /// rebuilt.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.store.is_poisoned()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_garbage(store: &EntryStore, hub: &SubscriptionHub, cache_time: Duration) -> usize {
    let now = Instant::now();
    let removed = store.retain(|entry| !entry.should_gc(now, cache_time) || hub.has_subscriber(&entry.key));
    if !removed.is_empty() {
        debug!(count = removed.len(), "garbage collected queries");
    }
    hub.notify_all(&removed, NotifyCause::Evicted);
    removed.len()
}
