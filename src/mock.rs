//! Mock fetcher for testing.
//!
//! This module provides a controllable fetcher that returns queued responses,
//! enabling deterministic tests of code built on the cache without a real
//! backend.
//!
//! # Basic Usage
//!
//! ```
//! use cachet::mock::MockFetcher;
//! use cachet::{QueryClient, QueryKey};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = QueryClient::new();
//! let key = QueryKey::from("facilities");
//!
//! let mock = MockFetcher::new();
//! mock.push_ok(vec!["Sunny Hills"]);
//!
//! let facilities = client.query(&key, mock.fetcher()).await.unwrap();
//! assert_eq!(*facilities, vec!["Sunny Hills"]);
//! assert_eq!(mock.calls(), 1);
//! # }
//! ```
//!
//! # Gated Responses
//!
//! [`MockFetcher::gate`] queues a response that stays pending until the test
//! resolves it, which makes in-flight states observable:
//!
//! ```
//! use cachet::mock::MockFetcher;
//!
//! let mock = MockFetcher::<u32>::new();
//! let gate = mock.gate();
//! // ... start a query that calls the fetcher ...
//! gate.ok(42);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

enum Response<T> {
    Ready(Result<T, QueryError>),
    Gated(oneshot::Receiver<Result<T, QueryError>>),
}

struct MockState<T> {
    responses: VecDeque<Response<T>>,
    calls: usize,
}

/// A fetcher that replays queued responses and counts its calls.
///
/// Clones share the same queue and counter, so one clone can be handed to
/// the code under test while the test keeps another.
pub struct MockFetcher<T> {
    state: Arc<Mutex<MockState<T>>>,
}

impl<T: Send + 'static> MockFetcher<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responses: VecDeque::new(),
                calls: 0,
            })),
        }
    }

    /// Queues a successful response.
    pub fn push_ok(&self, value: T) -> &Self {
        self.push(Response::Ready(Ok(value)))
    }

    /// Queues a failed response.
    pub fn push_err(&self, error: QueryError) -> &Self {
        self.push(Response::Ready(Err(error)))
    }

    /// Queues a response that stays pending until the returned gate is
    /// resolved. Dropping the gate fails the fetch.
    #[must_use]
    pub fn gate(&self) -> MockGate<T> {
        let (sender, receiver) = oneshot::channel();
        self.push(Response::Gated(receiver));
        MockGate { sender }
    }

    /// Returns how many times the fetcher has been called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    /// Returns how many queued responses have not been consumed yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().responses.len()
    }

    /// Returns a fetcher closure to pass to `query`.
    ///
    /// Each call consumes the next queued response. A call with nothing
    /// queued fails with [`QueryError::FetchError`].
    pub fn fetcher(
        &self,
    ) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + use<T>
    {
        let state = Arc::clone(&self.state);
        move |_signal| {
            let response = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.calls += 1;
                state.responses.pop_front()
            };

            async move {
                match response {
                    Some(Response::Ready(result)) => result,
                    Some(Response::Gated(receiver)) => receiver.await.unwrap_or_else(|_| {
                        Err(QueryError::FetchError("mock gate dropped".to_string()))
                    }),
                    None => Err(QueryError::FetchError(
                        "no mock response queued".to_string(),
                    )),
                }
            }
            .boxed()
        }
    }

    fn push(&self, response: Response<T>) -> &Self {
        self.lock().responses.push_back(response);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for MockFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Default for MockFetcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MockFetcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MockFetcher")
            .field("calls", &state.calls)
            .field("pending", &state.responses.len())
            .finish()
    }
}

/// Releases a gated mock response.
#[derive(Debug)]
pub struct MockGate<T> {
    sender: oneshot::Sender<Result<T, QueryError>>,
}

impl<T> MockGate<T> {
    /// Completes the gated fetch with `result`. Returns `false` if the fetch
    /// future was already dropped.
    pub fn resolve(self, result: Result<T, QueryError>) -> bool {
        self.sender.send(result).is_ok()
    }

    pub fn ok(self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn err(self, error: QueryError) -> bool {
        self.resolve(Err(error))
    }
}
