//! Error types for the query cache.

use serde_json::Value;
use std::fmt;

/// Result type for query cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query cache.
///
/// Fetch outcomes never cross the subscription boundary as `Err`: a failed
/// transport call or an undecodable payload is stored in the entry and shows
/// up as `QueryStatus::Error` in the observer's snapshot. The remaining
/// variants are returned directly by API calls and indicate misuse.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The transport adapter failed.
    ///
    /// Carries whatever detail the adapter chose to report, for example
    /// `{"code": 500}` or a status/body pair.
    Transport(Value),

    /// The payload could not be interpreted.
    ///
    /// Raised when the response body is not JSON or when an endpoint's
    /// `transform_response` rejects it. The cache state machine treats it
    /// exactly like `Transport`.
    Decode(String),

    /// A response arrived for a request that has since been superseded.
    ///
    /// Internal only. Observers never see it; it is handed to
    /// `QueryMetrics::record_discarded` and logged.
    StaleResponseDiscarded {
        /// Cache key the response belonged to
        key: String,
        /// Request id of the discarded response
        request_id: u64,
    },

    /// No endpoint with this name is registered.
    UnknownEndpoint(String),

    /// Call arguments could not be serialized or did not match the endpoint.
    InvalidArguments(String),

    /// The key has no cache entry.
    ///
    /// Returned by `refetch` for keys that were never subscribed or have
    /// already been collected.
    NotCached(String),

    /// Configuration error while building a registry or client.
    ///
    /// Common causes:
    /// - Duplicate endpoint names
    /// - Building a client outside a tokio runtime without a runtime handle
    ConfigError(String),

    /// Generic error with custom message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(detail) => write!(f, "Transport error: {}", detail),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::StaleResponseDiscarded { key, request_id } => write!(
                f,
                "Stale response discarded for {} (request {})",
                key, request_id
            ),
            Error::UnknownEndpoint(name) => write!(f, "Unknown endpoint: {}", name),
            Error::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            Error::NotCached(key) => write!(f, "Not cached: {}", key),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// True for the failures that end up in a snapshot's `error` field.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Decode(_))
    }
}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Other(e.to_string())
        } else {
            Error::Decode(e.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = Error::Transport(json!({"code": 500}));
        assert_eq!(err.to_string(), "Transport error: {\"code\":500}");

        let err = Error::StaleResponseDiscarded {
            key: "getProduct(\"iphone\")".to_string(),
            request_id: 3,
        };
        assert_eq!(
            err.to_string(),
            "Stale response discarded for getProduct(\"iphone\") (request 3)"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_error_from_serde_json_is_decode() {
        let parse = serde_json::from_slice::<Value>(b"{not json").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.is_fetch_failure());
    }

    #[test]
    fn test_misuse_errors_are_not_fetch_failures() {
        assert!(!Error::UnknownEndpoint("x".to_string()).is_fetch_failure());
        assert!(!Error::NotCached("x".to_string()).is_fetch_failure());
    }
}
