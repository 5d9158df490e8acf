use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchOptions, RetryPolicy};

/// Configuration for query behavior.
///
/// This controls how queries cache data, when they consider it stale and how
/// failed fetches are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    pub stale_time: Duration,

    /// How long settled entries are retained before garbage collection may
    /// remove them.
    pub cache_time: Duration,

    /// Retry behavior for failed fetches.
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0),      // immediately stale
            cache_time: Duration::from_secs(5 * 60), // 5 minutes
            retry: RetryPolicy::DEFAULT,
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and cache times
    /// and the default retry policy.
    #[must_use]
    pub const fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
            retry: RetryPolicy::DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-call overrides for a single query.
///
/// Unset fields fall back to the client's [`QueryConfig`].
///
/// ```
/// use std::time::Duration;
/// use cachet::QueryOptions;
///
/// let options = QueryOptions::new()
///     .stale_time(Duration::from_secs(30))
///     .no_retry();
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    stale_time: Option<Duration>,
    retry: Option<RetryPolicy>,
    signal: Option<CancellationToken>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub const fn no_retry(self) -> Self {
        self.retry(RetryPolicy::none())
    }

    /// Cancels the query when `signal` fires. The fetcher receives a child
    /// token.
    #[must_use]
    pub fn cancel_token(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub(crate) fn resolve(&self, config: &QueryConfig) -> FetchOptions {
        FetchOptions {
            stale_time: self.stale_time.unwrap_or(config.stale_time),
            retry: self.retry.unwrap_or(config.retry),
            signal: self.signal.clone(),
        }
    }
}
