//! Protocol error types and wire error codes.

use crate::frame::FrameType;
use std::fmt;
use thiserror::Error;

/// Errors produced while encoding or decoding frames.
///
/// Every variant is fatal to the connection that produced the bytes; a
/// malformed frame means the two sides no longer agree on framing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame: need at least {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown frame type {code:#04x}")]
    UnknownType { code: u8 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("{frame_type:?} frame with invalid stream id {stream_id}")]
    InvalidStreamId { frame_type: FrameType, stream_id: u32 },

    #[error("request-n must be positive")]
    ZeroRequestN,

    #[error("mime type longer than 255 bytes")]
    MimeTypeTooLong,

    #[error("resume token longer than 65535 bytes")]
    ResumeTokenTooLong,

    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("ignored frame cannot be encoded")]
    NotEncodable,
}

/// Wire error code carried by Error frames.
///
/// Codes below 0x0200 are connection-level and only valid on stream 0;
/// codes from 0x0201 are stream-level. Applications may use any code at or
/// above [`ErrorCode::CUSTOM_MIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Setup frame was malformed or unacceptable.
    pub const INVALID_SETUP: ErrorCode = ErrorCode(0x0001);
    /// Setup requested a capability the responder does not support.
    pub const UNSUPPORTED_SETUP: ErrorCode = ErrorCode(0x0002);
    /// Responder declined the connection.
    pub const REJECTED_SETUP: ErrorCode = ErrorCode(0x0003);
    /// Resume token unknown or session no longer resumable.
    pub const REJECTED_RESUME: ErrorCode = ErrorCode(0x0004);
    /// Connection-level failure; all streams are dead.
    pub const CONNECTION_ERROR: ErrorCode = ErrorCode(0x0101);
    /// Orderly connection shutdown.
    pub const CONNECTION_CLOSE: ErrorCode = ErrorCode(0x0102);
    /// Application-level stream failure.
    pub const APPLICATION_ERROR: ErrorCode = ErrorCode(0x0201);
    /// Valid request that the responder chose not to serve.
    pub const REJECTED: ErrorCode = ErrorCode(0x0202);
    /// Stream was canceled before completion.
    pub const CANCELED: ErrorCode = ErrorCode(0x0203);
    /// Request violated the protocol or responder contract.
    pub const INVALID: ErrorCode = ErrorCode(0x0204);
    /// First code of the application-defined range.
    pub const CUSTOM_MIN: ErrorCode = ErrorCode(0x0301);

    pub fn new(code: u32) -> Self {
        Self(code)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Returns whether this code is only meaningful on stream 0.
    pub fn is_connection_level(self) -> bool {
        self.0 < Self::APPLICATION_ERROR.0
    }

    /// Returns whether this code is in the application-defined range.
    pub fn is_custom(self) -> bool {
        self.0 >= Self::CUSTOM_MIN.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::INVALID_SETUP => "INVALID_SETUP",
            Self::UNSUPPORTED_SETUP => "UNSUPPORTED_SETUP",
            Self::REJECTED_SETUP => "REJECTED_SETUP",
            Self::REJECTED_RESUME => "REJECTED_RESUME",
            Self::CONNECTION_ERROR => "CONNECTION_ERROR",
            Self::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            Self::APPLICATION_ERROR => "APPLICATION_ERROR",
            Self::REJECTED => "REJECTED",
            Self::CANCELED => "CANCELED",
            Self::INVALID => "INVALID",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_levels() {
        assert!(ErrorCode::INVALID_SETUP.is_connection_level());
        assert!(ErrorCode::REJECTED_RESUME.is_connection_level());
        assert!(ErrorCode::CONNECTION_ERROR.is_connection_level());
        assert!(ErrorCode::CONNECTION_CLOSE.is_connection_level());

        assert!(!ErrorCode::APPLICATION_ERROR.is_connection_level());
        assert!(!ErrorCode::CANCELED.is_connection_level());
        assert!(!ErrorCode::new(0x0501).is_connection_level());
    }

    #[test]
    fn test_error_code_custom_range() {
        assert!(!ErrorCode::INVALID.is_custom());
        assert!(ErrorCode::CUSTOM_MIN.is_custom());
        assert!(ErrorCode::new(0x0501).is_custom());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::APPLICATION_ERROR.to_string(), "APPLICATION_ERROR");
        assert_eq!(ErrorCode::REJECTED_RESUME.to_string(), "REJECTED_RESUME");
        assert_eq!(ErrorCode::new(0x0501).to_string(), "0x00000501");
    }

    #[test]
    fn test_error_code_roundtrip_value() {
        let code = ErrorCode::new(0x0501);
        assert_eq!(ErrorCode::from(code.value()), code);
    }
}
