use std::time::Duration;

use thiserror::Error;

/// A query key that cannot be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid query key: {reason}")]
pub struct InvalidKeyError {
    reason: String,
}

impl InvalidKeyError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why the key was rejected.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Error type for query operations.
///
/// Fetchers return this type, and it is what subscribers observe once retries are
/// exhausted. It is `Clone` so every subscriber of a key sees the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),

    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch was cancelled")]
    Cancelled,

    #[error("Cached data for {key} has a different type than requested")]
    TypeMismatch { key: String },

    #[error("Query client has been shut down")]
    Shutdown,
}

impl QueryError {
    /// Returns `true` for 4xx responses, which are usually not worth retrying.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status >= 400 && *status < 500)
    }
}

/// A failed mutation function, as handed to `on_error` and `on_settled`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Mutation failed: {0}")]
pub struct MutationError(#[source] pub QueryError);

impl From<QueryError> for MutationError {
    fn from(err: QueryError) -> Self {
        Self(err)
    }
}

/// Failure inside a persistent storage bridge.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored payload could not be encoded or decoded: {0}")]
    Serde(#[from] serde_json::Error),
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

        let err = QueryError::Status {
            status: 404,
            message: "not found".to_string(),
        };
        assert_eq!(err.to_string(), "Request failed with status 404: not found");
    }

    #[test]
    fn test_is_client_error() {
        let not_found = QueryError::Status {
            status: 404,
            message: String::new(),
        };
        let unavailable = QueryError::Status {
            status: 503,
            message: String::new(),
        };
        assert!(not_found.is_client_error());
        assert!(!unavailable.is_client_error());
        assert!(!QueryError::Timeout(Duration::from_secs(1)).is_client_error());
    }

    #[test]
    fn test_invalid_key_converts() {
        let err: QueryError = InvalidKeyError::new("empty").into();
        assert_eq!(err.to_string(), "Invalid query key: empty");
    }

    #[test]
    fn test_mutation_error_wraps_source() {
        let err = MutationError::from(QueryError::NetworkError("offline".into()));
        assert_eq!(err.to_string(), "Mutation failed: Network error: offline");
        assert_eq!(err.0, QueryError::NetworkError("offline".into()));
    }
}
