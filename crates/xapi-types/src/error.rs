//! Error types for the xAPI transport

use std::time::Duration;
use thiserror::Error;

/// Main error type for transport operations
///
/// Every public `send`/`subscribe` future settles with exactly one of these
/// or with response data. The enum is `Clone` so a single outcome can be
/// handed to every waiter of an idempotent operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XapiError {
    // === Admission Errors ===
    /// Serialized request exceeds the protocol payload cap; never sent
    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// No connection in the pool could take the call
    #[error("No connection available")]
    ConnectionUnavailable,

    /// Caller supplied a transaction id that is already pending
    #[error("Transaction {transaction_id} is already pending")]
    DuplicateTransaction { transaction_id: String },

    // === Lifecycle Errors ===
    /// Bound connection went to DISCONNECTED while the call was pending
    #[error("Connection {connection_id} closed")]
    ConnectionClosed { connection_id: String },

    /// Item sat in the pacing queue past the overload ceiling
    #[error("Queue overloaded: request waited {waited:?} without being sent")]
    QueueOverloaded { waited: Duration },

    /// Connect did not complete before its deadline
    #[error("Connect timeout after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    /// Close did not complete before its deadline
    #[error("Close timeout after {timeout:?}")]
    CloseTimeout { timeout: Duration },

    /// Transmitted call received no matching frame before its deadline
    #[error("Transaction {transaction_id} timed out after {timeout:?}")]
    RequestTimeout {
        transaction_id: String,
        timeout: Duration,
    },

    // === Protocol Errors ===
    /// Unparseable frame or missing/invalid correlation tag
    #[error("Protocol error: {message}")]
    Protocol { message: String, raw: Option<String> },

    /// Explicit application-level rejection from the broker
    #[error("Server error {code}: {}", .description.as_deref().unwrap_or("no description"))]
    ServerError {
        code: String,
        description: Option<String>,
    },

    /// Failed to serialize an outbound frame
    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },

    // === Physical Layer Errors ===
    /// Failure reported by the underlying WebSocket transport
    #[error("Transport error: {0}")]
    Transport(String),

    // === Internal Errors ===
    /// Internal channel was closed unexpectedly
    #[error("Internal channel closed unexpectedly")]
    ChannelClosed,

    /// Invalid state for the requested operation
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl XapiError {
    /// Create a connection closed error
    pub fn connection_closed(connection_id: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            connection_id: connection_id.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>, raw: Option<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            raw,
        }
    }

    /// Create a server error from the `errorCode`/`errorDescr` pair
    pub fn server(code: impl Into<String>, description: Option<String>) -> Self {
        Self::ServerError {
            code: code.into(),
            description,
        }
    }

    /// Returns true if this error is potentially recoverable via retry
    ///
    /// The transport never retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable
                | Self::ConnectionClosed { .. }
                | Self::QueueOverloaded { .. }
                | Self::ConnectTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::Transport(_)
        )
    }

    /// Returns suggested retry delay, if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QueueOverloaded { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionClosed { .. } | Self::Transport(_) => Some(Duration::from_secs(3)),
            Self::ConnectTimeout { .. } | Self::ConnectionUnavailable => {
                Some(Duration::from_millis(500))
            }
            _ => None,
        }
    }

    /// Returns true if this error concerns the link rather than the call
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable
                | Self::ConnectionClosed { .. }
                | Self::ConnectTimeout { .. }
                | Self::CloseTimeout { .. }
                | Self::Transport(_)
        )
    }

    /// Returns true if a deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::CloseTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Get the broker error code if this is a server error
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Self::ServerError { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for XapiError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidJson {
            message: err.to_string(),
        }
    }
}

/// Result type alias for transport operations
pub type XapiResult<T> = Result<T, XapiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = XapiError::QueueOverloaded {
            waited: Duration::from_millis(9000),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        let err = XapiError::PayloadTooLarge {
            size: 1001,
            limit: 1000,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_server_error_display() {
        let err = XapiError::server("BE005", Some("userPasswordCheck: Invalid login".into()));
        assert_eq!(
            err.to_string(),
            "Server error BE005: userPasswordCheck: Invalid login"
        );
        assert_eq!(err.server_code(), Some("BE005"));

        let bare = XapiError::server("EX001", None);
        assert_eq!(bare.to_string(), "Server error EX001: no description");
    }

    #[test]
    fn test_connection_predicates() {
        assert!(XapiError::connection_closed("c1").is_connection_error());
        assert!(XapiError::ConnectionUnavailable.is_connection_error());
        assert!(!XapiError::server("BE1", None).is_connection_error());

        assert!(XapiError::ConnectTimeout {
            timeout: Duration::from_secs(5)
        }
        .is_timeout());
        assert!(!XapiError::ChannelClosed.is_timeout());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: XapiError = json_err.into();
        assert!(matches!(err, XapiError::InvalidJson { .. }));
    }
}
