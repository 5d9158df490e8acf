use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::QueryError;
use crate::key::QueryKey;

/// Retry behavior for failed fetches.
///
/// A failed attempt is retried while fewer than `max_retries` retries have
/// been made and the error is [retryable](QueryError::is_retryable). The
/// delay before retry `n` (starting at zero) is `base_delay * 2^n`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Three retries starting at one second, capped at thirty seconds.
    pub const DEFAULT: Self = Self::new(3, Duration::from_secs(1), Duration::from_secs(30));

    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Returns the backoff before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Returns `true` if a failure after `retries_made` retries should be
    /// retried.
    #[must_use]
    pub const fn should_retry(&self, retries_made: u32, error: &QueryError) -> bool {
        retries_made < self.max_retries && error.is_retryable()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Runs `fetcher` until it succeeds, fails with a non-retryable error, runs
/// out of retries, or `signal` is cancelled during a backoff.
pub(crate) async fn fetch_with_retry<T, F, Fut>(
    key: &QueryKey,
    fetcher: &F,
    policy: RetryPolicy,
    signal: &CancellationToken,
) -> Result<T, QueryError>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let mut retries = 0;
    loop {
        let error = match fetcher(signal.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if signal.is_cancelled() || !policy.should_retry(retries, &error) {
            return Err(error);
        }

        let delay = policy.delay_for(retries);
        warn!(key = %key, attempt = retries + 1, ?delay, %error, "fetch failed, retrying");

        tokio::select! {
            biased;
            () = signal.cancelled() => return Err(QueryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFetcher;

    fn key() -> QueryKey {
        QueryKey::from("facilities")
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        let server = QueryError::http(502, "bad gateway");
        let client = QueryError::http(422, "unprocessable");

        assert!(policy.should_retry(0, &server));
        assert!(policy.should_retry(1, &server));
        assert!(!policy.should_retry(2, &server));
        assert!(!policy.should_retry(0, &client));
        assert!(!RetryPolicy::none().should_retry(0, &server));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let mock = MockFetcher::new();
        mock.push_err(QueryError::NetworkError("reset".into()))
            .push_err(QueryError::http(503, "unavailable"))
            .push_ok(7);

        let started = tokio::time::Instant::now();
        let result = fetch_with_retry(
            &key(),
            &mock.fetcher(),
            RetryPolicy::DEFAULT,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(mock.calls(), 3);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let mock = MockFetcher::<i32>::new();
        for _ in 0..5 {
            mock.push_err(QueryError::http(500, "boom"));
        }

        let result = fetch_with_retry(
            &key(),
            &mock.fetcher(),
            RetryPolicy::DEFAULT,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result, Err(QueryError::http(500, "boom")));
        assert_eq!(mock.calls(), 4);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mock = MockFetcher::<i32>::new();
        mock.push_err(QueryError::http(404, "missing")).push_ok(1);

        let result = fetch_with_retry(
            &key(),
            &mock.fetcher(),
            RetryPolicy::DEFAULT,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result, Err(QueryError::http(404, "missing")));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let mock = MockFetcher::<i32>::new();
        mock.push_err(QueryError::FetchError("flaky".into())).push_ok(1);
        let signal = CancellationToken::new();

        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = fetch_with_retry(&key(), &mock.fetcher(), RetryPolicy::DEFAULT, &signal).await;

        assert_eq!(result, Err(QueryError::Cancelled));
        assert_eq!(mock.calls(), 1);
    }
}
