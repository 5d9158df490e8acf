//! # Cachet - keyed query and mutation cache
//!
//! Cachet is a client-side cache for data fetched from a backend. Reads go
//! through [`QueryClient::query`], which serves fresh cached data, joins an
//! in-flight fetch for the same key, or fetches with retry and backoff.
//! Writes go through [`QueryClient::mutate`], which can apply an optimistic
//! patch to the cache, roll it back if the backend rejects the write, and
//! invalidate related queries when it succeeds.
//!
//! ## Core Components
//!
//! - [`QueryKey`](key::QueryKey): A structured, canonically encoded cache key
//! - [`EntryStore`](store::EntryStore): The keyed entries and their generation counters
//! - [`FetchExecutor`](fetch::FetchExecutor): Deduplicated, cancellable fetches with retry
//! - [`MutationEngine`](mutation::MutationEngine): Optimistic updates with rollback
//! - [`SubscriptionHub`](subscription::SubscriptionHub): Callbacks and streams for cache writes
//! - [`QueryClient`](client::QueryClient): The facade tying them together
//!
//! ## Example
//!
//! ```
//! use cachet::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! let facility = query_key!["facility", "F1"]?;
//!
//! client.subscribe(&query_key!["facility"]?, |n| println!("{} {:?}", n.key, n.cause));
//!
//! let name = client
//!     .query(&facility, |_signal| async { Ok("Sunny Hills".to_string()) })
//!     .await?;
//! assert_eq!(name.as_str(), "Sunny Hills");
//!
//! client
//!     .mutate(
//!         || async { Ok(()) },
//!         MutationOptions::new()
//!             .optimistic(OptimisticPatch::new().set(facility.clone(), "Sunnier Hills".to_string()))
//!             .invalidates(facility.clone()),
//!     )
//!     .await?;
//! assert!(client.entry(&facility).is_some_and(|e| e.is_invalidated));
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Cachet logs through [`tracing`] and installs no subscriber of its own.

pub mod client;
pub mod error;
pub mod fetch;
pub mod key;
pub mod mock;
pub mod mutation;
pub mod prelude;
pub mod store;
pub mod subscription;

pub use client::{QueryClient, QueryConfig, QueryOptions};
pub use error::QueryError;
pub use fetch::RetryPolicy;
pub use key::{KeyToken, QueryKey};
pub use mutation::{MutationOptions, OptimisticPatch};
pub use store::{QueryEntry, QueryStatus};
pub use subscription::{Notification, NotifyCause, SubscriptionHandle};
