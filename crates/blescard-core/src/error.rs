//! Error types shared by every crate of the stack.
//!
//! Two families live here:
//!
//! - [`Error`]: low-level failures raised while decoding frames, parsing
//!   status bytes or validating configuration.
//! - [`SCardError`]: the user-facing fault delivered through session
//!   callbacks, tagged with a closed [`ErrorCode`] and a fatal flag.
//!
//! Every [`Error`] reaching the session is reported as a fatal
//! [`ErrorCode::ProtocolError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Framing errors
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Frame overrun: received {received} bytes, declared {declared}")]
    FrameOverrun { received: usize, declared: usize },

    #[error("Slot {slot} out of range ({slot_count} slots)")]
    SlotOutOfRange { slot: u8, slot_count: u8 },

    // Status bitmap errors
    #[error("Status bitmap declares {declared} slots but carries codes for {available}")]
    SlotCountOverflow { declared: u8, available: usize },

    #[error("Status bitmap declares {declared} slots, session holds {expected}")]
    SlotCountMismatch { declared: u8, expected: u8 },

    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Session-level view of a protocol error. Always a fatal PROTOCOL_ERROR.
    pub fn to_scard_error(&self) -> SCardError {
        SCardError::fatal(ErrorCode::ProtocolError, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of fault classes reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or inconsistent frame. Always fatal.
    ProtocolError,

    /// The card did not answer.
    CardMute,

    /// Any other card or reader level failure.
    CardCommunicationError,

    /// The reader answered with something the session did not ask for.
    DialogError,

    /// A GATT attribute read failed.
    ReadAttributeFailed,

    /// A GATT attribute write failed.
    WriteAttributeFailed,

    /// Subscribing to a GATT attribute failed.
    EnableNotificationFailed,

    /// The peer exposes the CCID service but declares no slot.
    DummyDevice,
}

impl ErrorCode {
    /// Whether a fault of this class ends the session unless overridden.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CardMute | Self::CardCommunicationError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::CardMute => "CARD_MUTE",
            Self::CardCommunicationError => "CARD_COMMUNICATION_ERROR",
            Self::DialogError => "DIALOG_ERROR",
            Self::ReadAttributeFailed => "READ_ATTRIBUTE_FAILED",
            Self::WriteAttributeFailed => "WRITE_ATTRIBUTE_FAILED",
            Self::EnableNotificationFailed => "ENABLE_NOTIFICATION_FAILED",
            Self::DummyDevice => "DUMMY_DEVICE",
        };
        write!(f, "{}", s)
    }
}

/// A classified fault.
///
/// # Examples
///
/// ```
/// use blescard_core::{ErrorCode, SCardError};
///
/// let err = SCardError::new(ErrorCode::CardMute, "no answer from card");
/// assert!(!err.fatal);
///
/// let err = SCardError::new(ErrorCode::DialogError, "unexpected opcode");
/// assert!(err.fatal);
/// assert_eq!(err.to_string(), "DIALOG_ERROR: unexpected opcode");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {detail}")]
pub struct SCardError {
    pub code: ErrorCode,
    pub detail: String,
    pub fatal: bool,
}

impl SCardError {
    /// Create an error whose fatality follows [`ErrorCode::is_fatal`].
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            fatal: code.is_fatal(),
        }
    }

    /// Create an error that ends the session.
    pub fn fatal(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            fatal: true,
        }
    }

    /// Create an error that leaves the session running.
    pub fn recoverable(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            fatal: false,
        }
    }
}

impl From<Error> for SCardError {
    fn from(err: Error) -> Self {
        err.to_scard_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorCode::ProtocolError, true)]
    #[case(ErrorCode::CardMute, false)]
    #[case(ErrorCode::CardCommunicationError, false)]
    #[case(ErrorCode::DialogError, true)]
    #[case(ErrorCode::ReadAttributeFailed, true)]
    #[case(ErrorCode::WriteAttributeFailed, true)]
    #[case(ErrorCode::EnableNotificationFailed, true)]
    #[case(ErrorCode::DummyDevice, true)]
    fn test_default_fatality(#[case] code: ErrorCode, #[case] fatal: bool) {
        assert_eq!(SCardError::new(code, "x").fatal, fatal);
    }

    #[test]
    fn test_protocol_error_conversion_is_fatal() {
        let err: SCardError = Error::FrameOverrun {
            received: 12,
            declared: 10,
        }
        .into();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert!(err.fatal);
        assert!(err.detail.contains("12"));
    }

    #[test]
    fn test_error_code_serializes_screaming_case() {
        let json = serde_json::to_string(&ErrorCode::EnableNotificationFailed).unwrap();
        assert_eq!(json, "\"ENABLE_NOTIFICATION_FAILED\"");
    }

    #[test]
    fn test_overrides_ignore_default() {
        assert!(SCardError::fatal(ErrorCode::CardMute, "").fatal);
        assert!(!SCardError::recoverable(ErrorCode::DialogError, "").fatal);
    }
}
