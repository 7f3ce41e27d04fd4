//! Error types for transport operations.
//!
//! Transport failures are reported to the session as text inside a
//! [`TransportEvent`](blescard_session::TransportEvent); the typed error
//! is what [`Transport`](crate::Transport) implementations and the
//! [`SessionHandle`](crate::SessionHandle) return.

use std::time::Duration;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while talking to a reader.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link to the reader is down.
    #[error("Device disconnected: {device}")]
    Disconnected { device: String },

    /// Operation timed out after specified duration.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A GATT operation was rejected by the reader or the stack.
    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    /// Operation is not supported by this transport.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// The session driver task is gone.
    #[error("Session channel closed")]
    ChannelClosed,

    /// A command is already in flight on this session.
    #[error("Session busy: a command is already in flight")]
    Busy,

    /// Protocol-level error, such as an invalid session configuration.
    #[error(transparent)]
    Protocol(#[from] blescard_core::Error),

    /// Generic error with custom message.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a new disconnected error.
    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a timeout error from a [`Duration`], saturating at `u64::MAX` ms.
    pub fn timeout_after(duration: Duration) -> Self {
        Self::timeout(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Create a new operation failed error.
    pub fn operation_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new unsupported operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a new channel closed error.
    pub fn channel_closed() -> Self {
        Self::ChannelClosed
    }

    /// Create a new busy error.
    pub fn busy() -> Self {
        Self::Busy
    }

    /// Create a generic error with custom message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// The link is gone and the operation cannot be retried on it.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_error() {
        let err = TransportError::disconnected("BR-2 reader");
        assert_eq!(err.to_string(), "Device disconnected: BR-2 reader");
        assert!(err.is_link_lost());
    }

    #[test]
    fn test_timeout_error() {
        let err = TransportError::timeout(5000);
        assert_eq!(err.to_string(), "Operation timeout after 5000ms");
        assert!(!err.is_link_lost());
    }

    #[test]
    fn test_timeout_after_duration() {
        let err = TransportError::timeout_after(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Operation timeout after 1500ms");

        let err = TransportError::timeout_after(Duration::MAX);
        assert!(matches!(err, TransportError::Timeout { duration_ms: u64::MAX }));
    }

    #[test]
    fn test_operation_failed_error() {
        let err = TransportError::operation_failed("Write", "GATT write error");
        assert_eq!(err.to_string(), "Write failed: GATT write error");
    }

    #[test]
    fn test_unsupported_error() {
        let err = TransportError::unsupported("secured pairing");
        assert_eq!(err.to_string(), "Unsupported operation: secured pairing");
    }

    #[test]
    fn test_busy_and_closed_errors() {
        assert_eq!(
            TransportError::busy().to_string(),
            "Session busy: a command is already in flight"
        );
        assert_eq!(TransportError::channel_closed().to_string(), "Session channel closed");
        assert!(TransportError::channel_closed().is_link_lost());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: TransportError = blescard_core::Error::Config("chunk size is zero".into()).into();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(err.to_string(), "Configuration error: chunk size is zero");
    }

    #[test]
    fn test_other_error() {
        let err = TransportError::other("custom message");
        assert_eq!(err.to_string(), "custom message");
    }
}
