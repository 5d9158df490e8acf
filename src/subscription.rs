//! Observers for cache writes.
//!
//! The [`SubscriptionHub`] maps key patterns to callbacks. Whenever the store
//! is written (by a fetch, a mutation, an invalidation or an eviction) the
//! hub is notified with the written key and every subscriber whose pattern is
//! a prefix of that key is called, in subscription order.
//!
//! Callbacks run after the triggering store write has completed and outside
//! every lock, so a callback may read the cache, subscribe or unsubscribe.
//!
//! For async consumers, [`SubscriptionHub::watch`] returns a stream of the same
//! notifications backed by a broadcast channel. A slow stream consumer skips
//! notifications it lagged behind on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::key::QueryKey;

/// Why a key was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyCause {
    /// A fetch was dispatched and the entry is now loading.
    Loading,
    /// A fetch succeeded and its data was stored.
    Fetched,
    /// A fetch failed after exhausting its retries.
    Failed,
    /// A cancelled fetch settled and the previous entry was put back.
    Cancelled,
    /// An optimistic patch was applied.
    Optimistic,
    /// A failed mutation restored the pre-mutation entry.
    RolledBack,
    /// A superseded fetch finished and the entry it left loading was
    /// returned to a settled status.
    Settled,
    Invalidated,
    Evicted,
    /// Data was written directly with `set_query_data`.
    Set,
}

/// A single store write delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: QueryKey,
    pub cause: NotifyCause,
}

impl Notification {
    #[must_use]
    pub const fn new(key: QueryKey, cause: NotifyCause) -> Self {
        Self { key, cause }
    }
}

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Identifies a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    pattern: QueryKey,
    callback: Callback,
}

/// Registry of key-pattern observers.
pub struct SubscriptionHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    events: broadcast::Sender<Notification>,
}

impl SubscriptionHub {
    /// Creates a hub whose watch streams buffer up to 256 notifications.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Creates a hub whose watch streams buffer up to `capacity`
    /// notifications.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Registers `callback` for every write to a key under `pattern`.
    ///
    /// The subscription lasts until [`SubscriptionHandle::unsubscribe`] is
    /// called or the hub is dropped; dropping the handle does not
    /// unsubscribe.
    pub fn subscribe<F>(self: &Arc<Self>, pattern: QueryKey, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscriber {
            id,
            pattern,
            callback: Arc::new(callback),
        });

        SubscriptionHandle {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Removes a subscriber. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    /// Delivers `notification` to every subscriber whose pattern matches its
    /// key, then to watch streams.
    pub fn notify(&self, notification: &Notification) {
        let callbacks: Vec<Callback> = self
            .lock()
            .iter()
            .filter(|subscriber| subscriber.pattern.is_prefix_of(&notification.key))
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect();

        trace!(
            key = %notification.key,
            cause = ?notification.cause,
            subscribers = callbacks.len(),
            "notifying subscribers"
        );

        for callback in callbacks {
            callback(notification);
        }

        // No watch stream is listening.
        let _ = self.events.send(notification.clone());
    }

    /// Notifies every key in `keys` with the same cause.
    pub fn notify_all<'a>(&self, keys: impl IntoIterator<Item = &'a QueryKey>, cause: NotifyCause) {
        for key in keys {
            self.notify(&Notification::new(key.clone(), cause));
        }
    }

    /// Returns a stream of notifications for keys under `pattern`.
    ///
    /// Only notifications sent after this call are observed.
    pub fn watch(&self, pattern: QueryKey) -> BoxStream<'static, Notification> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |received| {
                let matched = received
                    .ok()
                    .filter(|notification| pattern.is_prefix_of(&notification.key));
                async move { matched }
            })
            .boxed()
    }

    /// Returns `true` if any subscriber's pattern covers `key`.
    #[must_use]
    pub fn has_subscriber(&self, key: &QueryKey) -> bool {
        self.lock()
            .iter()
            .any(|subscriber| subscriber.pattern.is_prefix_of(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("subscribers", &self.len())
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

/// Handle returned by `subscribe`, used to unsubscribe explicitly.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    hub: Weak<SubscriptionHub>,
}

impl SubscriptionHandle {
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Removes the subscription. Returns `false` if it was already removed or
    /// the hub no longer exists.
    pub fn unsubscribe(self) -> bool {
        self.hub
            .upgrade()
            .is_some_and(|hub| hub.unsubscribe(self.id))
    }
}
