use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueryError;
use crate::key::QueryKey;

/// Type-erased cached value. Typed reads go through [`QueryEntry::data`].
pub type QueryData = Arc<dyn Any + Send + Sync>;

/// The fetch state of a cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing has been fetched yet.
    Idle,
    /// A fetch is in flight. Previous data, if any, is still available.
    Loading,
    /// The last fetch or write succeeded.
    Success,
    /// The last fetch failed after exhausting its retries.
    Error,
}

/// A cached entry with its status, timestamps and generation stamp.
///
/// Entries are values: the store replaces them wholesale on every write, so
/// a clone taken before a write stays valid and can be restored verbatim.
#[derive(Clone)]
pub struct QueryEntry {
    pub key: QueryKey,
    pub status: QueryStatus,
    pub data: Option<QueryData>,
    pub error: Option<QueryError>,
    /// When data or an error last landed in this entry.
    pub last_updated: Option<Instant>,
    /// The key's generation at the time this entry was written.
    pub generation: u64,
    /// The stale time requested by the query that produced this entry.
    pub stale_time: Duration,
    /// Set by invalidation; forces the next query to refetch.
    pub is_invalidated: bool,
}

impl QueryEntry {
    /// Creates an idle entry with no data.
    #[must_use]
    pub const fn new(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            last_updated: None,
            generation: 0,
            stale_time: Duration::ZERO,
            is_invalidated: false,
        }
    }

    /// Returns the cached value if it holds a `T`.
    #[must_use]
    pub fn data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data
            .as_ref()
            .and_then(|data| Arc::clone(data).downcast::<T>().ok())
    }

    /// Checks if this entry can be served without refetching.
    #[must_use]
    pub fn is_fresh(&self, now: Instant, stale_time: Duration) -> bool {
        self.status == QueryStatus::Success
            && !self.is_invalidated
            && self
                .last_updated
                .is_some_and(|at| now.saturating_duration_since(at) < stale_time)
    }

    /// Checks if this entry should be garbage collected based on cache time.
    #[must_use]
    pub fn should_gc(&self, now: Instant, cache_time: Duration) -> bool {
        if self.status == QueryStatus::Loading {
            return false;
        }
        self.last_updated
            .is_none_or(|at| now.saturating_duration_since(at) >= cache_time)
    }

    /// Returns this entry in the loading state, keeping its previous data.
    #[must_use]
    pub fn loading(self, generation: u64, stale_time: Duration) -> Self {
        Self {
            status: QueryStatus::Loading,
            generation,
            stale_time,
            ..self
        }
    }

    /// Returns this entry holding freshly fetched or written data.
    #[must_use]
    pub fn succeeded(self, data: QueryData, generation: u64) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            error: None,
            generation,
            is_invalidated: false,
            ..self
        }
    }

    /// Returns this entry holding a fetch error. Previous data is kept.
    #[must_use]
    pub fn failed(self, error: QueryError, generation: u64) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            generation,
            ..self
        }
    }

    /// Returns this entry with a `Loading` status replaced by the status its
    /// fields describe. Other statuses are kept.
    #[must_use]
    pub fn settled(self) -> Self {
        if self.status != QueryStatus::Loading {
            return self;
        }
        let status = if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Idle
        };
        Self { status, ..self }
    }

    /// Returns this entry marked as invalidated at `generation`.
    #[must_use]
    pub fn invalidated(self, generation: u64) -> Self {
        Self {
            generation,
            is_invalidated: true,
            ..self
        }
    }
}

impl PartialEq for QueryEntry {
    fn eq(&self, other: &Self) -> bool {
        let same_data = match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };

        same_data
            && self.key == other.key
            && self.status == other.status
            && self.error == other.error
            && self.last_updated == other.last_updated
            && self.generation == other.generation
            && self.stale_time == other.stale_time
            && self.is_invalidated == other.is_invalidated
    }
}

impl fmt::Debug for QueryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEntry")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("data", &self.data.as_ref().map(|_| "<any>"))
            .field("error", &self.error)
            .field("last_updated", &self.last_updated)
            .field("generation", &self.generation)
            .field("stale_time", &self.stale_time)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}
