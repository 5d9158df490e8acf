use thiserror::Error;

/// Error type for every cache operation.
///
/// Errors are `Clone` so that a failed fetch can be stored in its
/// [`QueryEntry`](crate::store::QueryEntry) and handed to every caller that
/// joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A key segment could not be represented as JSON.
    #[error("Invalid query key: {0}")]
    InvalidKeyError(String),

    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The backend answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    HttpStatusError { status: u16, message: String },

    /// The mutator passed to `mutate` failed. Any optimistic patch has already
    /// been rolled back when this is returned.
    #[error("Mutation failed: {0}")]
    MutationError(Box<QueryError>),

    /// Restoring a mutation snapshot failed. The cache that produced this
    /// error is poisoned and must be rebuilt.
    #[error("Rollback failed: {0}")]
    RollbackError(String),

    #[error("Query was cancelled")]
    Cancelled,

    /// The cached value for the key has a different type than requested.
    #[error("Cached data for {key} has a different type")]
    TypeMismatch { key: String },

    #[error("Query cache is poisoned after a failed rollback")]
    Poisoned,
}

impl QueryError {
    /// Creates an HTTP status error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::HttpStatusError {
            status,
            message: message.into(),
        }
    }

    /// Returns `true` if a failed fetch with this error may be retried.
    ///
    /// Transport failures and 5xx responses are retryable. Client errors
    /// (4xx), key errors, cancellation and everything raised by the cache
    /// itself are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::FetchError(_) | Self::NetworkError(_) => true,
            Self::HttpStatusError { status, .. } => *status >= 500,
            Self::InvalidKeyError(_)
            | Self::MutationError(_)
            | Self::RollbackError(_)
            | Self::Cancelled
            | Self::TypeMismatch { .. }
            | Self::Poisoned => false,
        }
    }

    /// Returns `true` if the cache instance can no longer be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackError(_) | Self::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::FetchError("test error".to_string());
        assert_eq!(err.to_string(), "Fetch failed: test error");

        let err = QueryError::NetworkError("network error".to_string());
        assert_eq!(err.to_string(), "Network error: network error");

        let err = QueryError::http(404, "not found");
        assert_eq!(err.to_string(), "HTTP 404: not found");

        let err = QueryError::MutationError(Box::new(QueryError::http(409, "conflict")));
        assert_eq!(err.to_string(), "Mutation failed: HTTP 409: conflict");
    }

    #[test]
    fn test_retry_classification() {
        assert!(QueryError::FetchError("reset".into()).is_retryable());
        assert!(QueryError::NetworkError("timeout".into()).is_retryable());
        assert!(QueryError::http(500, "boom").is_retryable());
        assert!(QueryError::http(503, "unavailable").is_retryable());

        assert!(!QueryError::http(400, "bad request").is_retryable());
        assert!(!QueryError::http(404, "missing").is_retryable());
        assert!(!QueryError::InvalidKeyError("bad".into()).is_retryable());
        assert!(!QueryError::Cancelled.is_retryable());
        assert!(
            !QueryError::MutationError(Box::new(QueryError::FetchError("x".into())))
                .is_retryable()
        );
    }

    #[test]
    fn test_fatal_errors() {
        assert!(QueryError::RollbackError("mismatch".into()).is_fatal());
        assert!(QueryError::Poisoned.is_fatal());
        assert!(!QueryError::FetchError("x".into()).is_fatal());
    }
}
