//! Fetch execution with deduplication, retry and stale-result protection.
//!
//! The [`FetchExecutor`] is the only component that runs fetchers. For every
//! key it guarantees:
//!
//! 1. **Deduplication**: while a fetch for the key's current generation is in
//!    flight, further queries join it instead of calling the fetcher again.
//! 2. **Generation guard**: each dispatch bumps the key's generation and
//!    remembers it. When the fetch completes, its result is written only if
//!    the generation is unchanged. Invalidation, eviction and optimistic
//!    patches bump the generation too, so a response that arrives after any
//!    of them is dropped instead of overwriting newer state.
//! 3. **Cancellation**: a fetch whose token was cancelled never writes its
//!    result; the entry is put back to what it was before the dispatch.
//!
//! Fetches run on spawned tokio tasks, so they complete (and settle the
//! store) even if every caller stopped waiting. A fetcher that panics fails
//! its fetch with [`QueryError::FetchError`].

mod retry;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use retry::RetryPolicy;
pub(crate) use retry::fetch_with_retry;

use crate::error::QueryError;
use crate::key::{KeyToken, QueryKey};
use crate::store::{EntryStore, QueryData, QueryEntry, QueryStatus};
use crate::subscription::{Notification, NotifyCause, SubscriptionHub};

type SharedFetch = Shared<BoxFuture<'static, Result<QueryData, QueryError>>>;

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
    signal: CancellationToken,
}

/// Resolved per-call fetch settings.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cached data younger than this is served without fetching.
    pub stale_time: Duration,
    pub retry: RetryPolicy,
    /// Cancels this call. The fetcher receives a child of this token.
    pub signal: Option<CancellationToken>,
}

enum Plan {
    Hit(QueryData),
    Join(SharedFetch),
    Dispatched(SharedFetch),
}

/// Runs fetchers against the entry store.
#[derive(Clone)]
pub struct FetchExecutor {
    store: Arc<EntryStore>,
    hub: Arc<SubscriptionHub>,
    in_flight: Arc<DashMap<KeyToken, InFlight>>,
}

impl FetchExecutor {
    #[must_use]
    pub fn new(store: Arc<EntryStore>, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            store,
            hub,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Returns the data for `key`, fetching it if the cached entry is
    /// missing, stale, invalidated or failed.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's last error once retries are exhausted,
    /// [`QueryError::Cancelled`] if the caller's token fires,
    /// [`QueryError::TypeMismatch`] if the cached value is not a `T`, and
    /// [`QueryError::Poisoned`] if the store is poisoned.
    pub async fn run<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &FetchOptions,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        if self.store.is_poisoned() {
            return Err(QueryError::Poisoned);
        }

        let data = match self.plan(key, fetcher, options) {
            Plan::Hit(data) => {
                debug!(key = %key, "cache hit");
                data
            }
            Plan::Join(fetch) => {
                debug!(key = %key, "joining in-flight fetch");
                wait(fetch, options.signal.as_ref()).await?
            }
            Plan::Dispatched(fetch) => wait(fetch, options.signal.as_ref()).await?,
        };

        data.downcast::<T>()
            .map_err(|_| QueryError::TypeMismatch {
                key: key.to_string(),
            })
    }

    /// Cancels every in-flight fetch. Their results will not be written.
    pub fn cancel_all(&self) {
        for flight in self.in_flight.iter() {
            flight.signal.cancel();
        }
    }

    /// Returns `true` if a fetch for `key` is in flight.
    #[must_use]
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.in_flight.contains_key(key.token())
    }

    /// Returns the number of in-flight fetches.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn plan<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: &FetchOptions) -> Plan
    where
        T: Send + Sync + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let now = Instant::now();
        let fresh = self.store.with_entries(|entries| {
            entries
                .get(key)
                .filter(|entry| entry.is_fresh(now, options.stale_time))
                .and_then(|entry| entry.data.clone())
        });
        if let Some(data) = fresh {
            return Plan::Hit(data);
        }

        // The shard lock taken by `entry` makes the join-or-dispatch decision
        // atomic per key. Notifications wait until it is released.
        let fetch = match self.in_flight.entry(key.token().clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation == self.store.generation(key) {
                    return Plan::Join(occupied.get().fetch.clone());
                }
                let flight = self.dispatch(key, fetcher, options);
                let fetch = flight.fetch.clone();
                occupied.insert(flight);
                fetch
            }
            Entry::Vacant(vacant) => {
                let flight = self.dispatch(key, fetcher, options);
                let fetch = flight.fetch.clone();
                vacant.insert(flight);
                fetch
            }
        };

        self.hub
            .notify(&Notification::new(key.clone(), NotifyCause::Loading));
        Plan::Dispatched(fetch)
    }

    fn dispatch<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: &FetchOptions) -> InFlight
    where
        T: Send + Sync + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let signal = options
            .signal
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        let (generation, previous) = self.store.with_entries(|entries| {
            let generation = entries.bump_generation(key);
            let previous = entries.get(key).cloned();
            let base = previous
                .clone()
                .unwrap_or_else(|| QueryEntry::new(key.clone()));
            entries.restore(base.loading(generation, options.stale_time));
            (generation, previous)
        });
        debug!(key = %key, generation, "dispatching fetch");

        let executor = self.clone();
        let task_key = key.clone();
        let task_signal = signal.clone();
        let retry = options.retry;
        let handle = tokio::spawn(async move {
            let attempt = fetch_with_retry(&task_key, &fetcher, retry, &task_signal);
            let outcome = AssertUnwindSafe(attempt)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(QueryError::FetchError(format!(
                        "fetcher panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                })
                .map(|value| Arc::new(value) as QueryData);
            executor.settle(&task_key, generation, previous, &outcome, &task_signal);

            if task_signal.is_cancelled() {
                Err(QueryError::Cancelled)
            } else {
                outcome
            }
        });

        let fetch = async move {
            handle.await.unwrap_or_else(|e| {
                Err(QueryError::FetchError(format!("fetch task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        InFlight {
            generation,
            fetch,
            signal,
        }
    }

    /// Writes a finished fetch to the store if its generation is still
    /// current.
    ///
    /// A superseded fetch writes nothing, except that an entry it left in
    /// `Loading` is settled again when no newer fetch for the key is in
    /// flight.
    fn settle(
        &self,
        key: &QueryKey,
        generation: u64,
        previous: Option<QueryEntry>,
        outcome: &Result<QueryData, QueryError>,
        signal: &CancellationToken,
    ) {
        // Holding the in-flight shard orders this after the dispatch that
        // registered the fetch, and before any dispatch that replaces it.
        let flight = self.in_flight.entry(key.token().clone());
        let superseded =
            matches!(&flight, Entry::Occupied(occupied) if occupied.get().generation != generation);

        let (current, cause) = self.store.with_entries(|entries| {
            if entries.generation(key) != generation {
                if superseded {
                    return (false, None);
                }
                let stranded = entries
                    .get(key)
                    .filter(|entry| entry.status == QueryStatus::Loading)
                    .cloned();
                return match stranded {
                    Some(entry) => {
                        entries.restore(entry.settled());
                        (false, Some(NotifyCause::Settled))
                    }
                    None => (false, None),
                };
            }

            if signal.is_cancelled() {
                match previous {
                    Some(entry) => entries.restore(entry),
                    None => {
                        entries.delete(key);
                    }
                }
                return (true, Some(NotifyCause::Cancelled));
            }

            let base = entries
                .get(key)
                .cloned()
                .unwrap_or_else(|| QueryEntry::new(key.clone()));
            match outcome {
                Ok(data) => {
                    entries.set(base.succeeded(Arc::clone(data), generation));
                    (true, Some(NotifyCause::Fetched))
                }
                Err(error) => {
                    entries.set(base.failed(error.clone(), generation));
                    (true, Some(NotifyCause::Failed))
                }
            }
        });

        // Releases the shard before subscribers run.
        match flight {
            Entry::Occupied(occupied) if !superseded => {
                occupied.remove();
            }
            other => drop(other),
        }

        if current {
            debug!(key = %key, generation, ?cause, "fetch settled");
        } else {
            warn!(key = %key, generation, "discarding result of superseded fetch");
        }
        if let Some(cause) = cause {
            self.hub.notify(&Notification::new(key.clone(), cause));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn wait(
    fetch: SharedFetch,
    signal: Option<&CancellationToken>,
) -> Result<QueryData, QueryError> {
    match signal {
        Some(signal) => tokio::select! {
            biased;
            () = signal.cancelled() => Err(QueryError::Cancelled),
            result = fetch => result,
        },
        None => fetch.await,
    }
}

impl fmt::Debug for FetchExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchExecutor")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
