//! Connection-level and stream-level error types.

use crate::transport::TransportError;
use rsock_protocol::{ErrorCode, FrameError, Version};
use std::time::Duration;
use thiserror::Error;

/// Fatal connection failures.
///
/// Any of these terminates the connection and every active stream on it;
/// the streams observe it as [`StreamError::Connection`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("keepalive timeout: no frame received within {0:?}")]
    KeepAliveTimeout(Duration),

    #[error("unsupported protocol version {actual} (expected {expected})")]
    UnsupportedVersion { expected: Version, actual: Version },

    #[error("setup rejected: [{code}] {message}")]
    SetupRejected { code: ErrorCode, message: String },

    #[error("timed out waiting for setup frame")]
    SetupTimeout,

    #[error("peer closed connection: [{code}] {message}")]
    PeerError { code: ErrorCode, message: String },

    #[error("resume rejected: {0}")]
    ResumeRejected(String),

    #[error("resume grace period elapsed")]
    ResumeTimeout,

    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for ConnectionError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ResumeTimeout => ConnectionError::ResumeTimeout,
            TransportError::ResumeRejected(message) => ConnectionError::ResumeRejected(message),
            other => ConnectionError::Transport(other),
        }
    }
}

/// Per-stream failures.
///
/// A stream error terminates only its own stream; sibling streams and the
/// connection are unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Application-level error, local or decoded from a peer Error frame.
    #[error("[{code}] {message}")]
    Application { code: ErrorCode, message: String },

    #[error("stream canceled")]
    Canceled,

    #[error("stream terminated before completion")]
    TerminatedPrematurely,

    #[error("stream id space exhausted")]
    IdsExhausted,

    #[error("connection error: {0}")]
    Connection(String),
}

impl StreamError {
    /// An application error with the default APPLICATION_ERROR code.
    pub fn application(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::APPLICATION_ERROR, message)
    }

    /// An application error with an explicit wire code.
    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        StreamError::Application {
            code,
            message: message.into(),
        }
    }

    /// A REJECTED error (valid request the responder declined to serve).
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::REJECTED, message)
    }

    /// The wire code this error is sent with in an Error frame.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            StreamError::Application { code, .. } => *code,
            StreamError::Canceled => ErrorCode::CANCELED,
            StreamError::TerminatedPrematurely => ErrorCode::INVALID,
            StreamError::IdsExhausted => ErrorCode::REJECTED,
            StreamError::Connection(_) => ErrorCode::CONNECTION_ERROR,
        }
    }

    /// The message carried in an Error frame for this error.
    pub fn wire_message(&self) -> String {
        match self {
            StreamError::Application { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuilds a stream error from a decoded Error frame.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        StreamError::Application { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_wire_roundtrip() {
        let error = StreamError::with_code(ErrorCode::new(0x0501), "stub");
        let rebuilt = StreamError::from_wire(error.wire_code(), error.wire_message());
        assert_eq!(error, rebuilt);
        assert_eq!(rebuilt.wire_code().value(), 0x0501);
        assert_eq!(rebuilt.wire_message(), "stub");
    }

    #[test]
    fn test_stream_error_codes() {
        assert_eq!(
            StreamError::application("x").wire_code(),
            ErrorCode::APPLICATION_ERROR
        );
        assert_eq!(StreamError::Canceled.wire_code(), ErrorCode::CANCELED);
        assert_eq!(
            StreamError::Connection("dead".into()).wire_code(),
            ErrorCode::CONNECTION_ERROR
        );
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            ConnectionError::from(TransportError::ResumeTimeout),
            ConnectionError::ResumeTimeout
        ));
        assert!(matches!(
            ConnectionError::from(TransportError::ResumeRejected("expired".into())),
            ConnectionError::ResumeRejected(_)
        ));
        assert!(matches!(
            ConnectionError::from(TransportError::Closed),
            ConnectionError::Transport(TransportError::Closed)
        ));
    }
}
