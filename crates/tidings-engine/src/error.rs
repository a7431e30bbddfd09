//! Error types for delivery-engine operations.
//!
//! Defines all error conditions that can occur while planning, sweeping,
//! and delivering notifications. The `is_retryable` classification here
//! is the single source of truth for the worker's retry decisions.

use thiserror::Error;
use tidings_core::CoreError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for planning, sweeping, and delivery operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level connectivity failure reaching the endpoint.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Milliseconds before the request timed out
        timeout_ms: u64,
    },

    /// Endpoint responded with a client error (4xx). Permanent.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Endpoint responded with a server error (5xx). Retriable.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Circuit breaker is open; the call was not attempted.
    #[error("circuit breaker open for delivery endpoint")]
    CircuitOpen,

    /// A storage operation failed beneath the engine.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// Invalid engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal engine error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl EngineError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this failure should be retried with backoff.
    ///
    /// Server errors, timeouts, network failures, an open circuit, and
    /// storage blips are temporary. Client errors are permanent: the
    /// request will not get better by repeating it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::CircuitOpen
            | Self::Storage(_) => true,

            Self::ClientError { .. } | Self::Configuration { .. } | Self::Internal { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified() {
        assert!(EngineError::network("connection refused").is_retryable());
        assert!(EngineError::timeout(10_000).is_retryable());
        assert!(EngineError::server_error(500, "boom").is_retryable());
        assert!(EngineError::CircuitOpen.is_retryable());
        assert!(EngineError::Storage(CoreError::database("pool exhausted")).is_retryable());

        assert!(!EngineError::client_error(400, "bad request").is_retryable());
        assert!(!EngineError::configuration("bad url").is_retryable());
        assert!(!EngineError::internal("bug").is_retryable());
    }

    #[test]
    fn error_display_format() {
        assert_eq!(EngineError::timeout(10_000).to_string(), "request timeout after 10000ms");
        assert_eq!(
            EngineError::server_error(503, "unavailable").to_string(),
            "server error: HTTP 503"
        );
    }
}
