use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::key::{KeyToken, QueryKey};

/// Per-key FIFO locks that serialize mutations touching the same keys.
///
/// Locks are created on demand and removed once nobody holds or waits on
/// them.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: DashMap<KeyToken, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Acquires the lock of every key in token order.
    ///
    /// Every caller takes its locks in the same global order, so two
    /// mutations with overlapping keys cannot deadlock.
    pub(crate) async fn acquire(self: &Arc<Self>, keys: &[QueryKey]) -> KeyGuards {
        let mut tokens: Vec<KeyToken> = keys.iter().map(|key| key.token().clone()).collect();
        tokens.sort();
        tokens.dedup();

        let mut held = KeyGuards {
            locks: Arc::clone(self),
            guards: Vec::with_capacity(tokens.len()),
        };
        for token in tokens {
            let lock = Arc::clone(self.locks.entry(token.clone()).or_default().value());
            let guard = Waiting {
                locks: self,
                token: token.clone(),
                pending: Some(lock.lock_owned().boxed()),
            }
            .await;
            held.guards.push((token, guard));
        }
        held
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// A queued lock request. Dropping it before the lock is granted leaves the
/// queue and removes the lock if nobody else holds or waits on it.
struct Waiting<'a> {
    locks: &'a KeyLocks,
    token: KeyToken,
    pending: Option<BoxFuture<'static, OwnedMutexGuard<()>>>,
}

impl Future for Waiting<'_> {
    type Output = OwnedMutexGuard<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(pending) = this.pending.as_mut() else {
            return Poll::Pending;
        };
        let guard = ready!(pending.poll_unpin(cx));
        this.pending = None;
        Poll::Ready(guard)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            drop(pending);
            self.locks
                .locks
                .remove_if(&self.token, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// Held locks. Dropping releases them in acquisition order.
pub(crate) struct KeyGuards {
    locks: Arc<KeyLocks>,
    guards: Vec<(KeyToken, OwnedMutexGuard<()>)>,
}

impl Drop for KeyGuards {
    fn drop(&mut self) {
        for (token, guard) in self.guards.drain(..) {
            drop(guard);
            self.locks
                .locks
                .remove_if(&token, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlapping_acquire_waits() {
        let locks = Arc::new(KeyLocks::default());
        let a = QueryKey::from("a");
        let b = QueryKey::from("b");

        let first = locks.acquire(&[b.clone(), a.clone()]).await;
        let second_keys = [a.clone()];
        let mut second = Box::pin(locks.acquire(&second_keys));
        assert!(futures::poll!(&mut second).is_pending());

        drop(first);
        let second = second.await;
        assert_eq!(locks.len(), 1);

        drop(second);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_idle_lock() {
        let locks = Arc::new(KeyLocks::default());
        let a = QueryKey::from("a");

        let holder = locks.acquire(&[a.clone()]).await;
        let waiter_keys = [a.clone()];
        let mut waiter = Box::pin(locks.acquire(&waiter_keys));
        assert!(futures::poll!(&mut waiter).is_pending());

        drop(holder);
        assert_eq!(locks.len(), 1);

        drop(waiter);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_block() {
        let locks = Arc::new(KeyLocks::default());
        let _first = locks.acquire(&[QueryKey::from("a")]).await;
        let second_keys = [QueryKey::from("b")];
        let mut second = Box::pin(locks.acquire(&second_keys));
        assert!(futures::poll!(&mut second).is_ready());
    }

    #[tokio::test]
    async fn test_duplicate_keys_lock_once() {
        let locks = Arc::new(KeyLocks::default());
        let key = QueryKey::from("a");
        let guards = locks.acquire(&[key.clone(), key]).await;
        assert_eq!(guards.guards.len(), 1);
    }
}
