//! Prelude module for convenient imports.
//!
//! ```
//! use cachet::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`], [`QueryConfig`] and [`QueryOptions`] - Querying the cache
//! - [`MutationOptions`] and [`OptimisticPatch`] - Mutations
//! - [`QueryKey`] and [`query_key!`] - Cache keys
//! - [`QueryError`] - The error type
//! - [`Notification`] and [`NotifyCause`] - Subscriber payloads

pub use crate::client::{QueryClient, QueryConfig, QueryOptions};
pub use crate::error::QueryError;
pub use crate::fetch::RetryPolicy;
pub use crate::key::QueryKey;
pub use crate::mutation::{MutationOptions, OptimisticPatch};
pub use crate::query_key;
pub use crate::store::{QueryEntry, QueryStatus};
pub use crate::subscription::{Notification, NotifyCause, SubscriptionHandle};
