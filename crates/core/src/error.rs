//! Centralized error types for the broadcaster core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps every variant to a stable, machine-readable error code
//! - Distinguishes session-fatal errors from errors returned to a single caller

use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths (wire protocol, stream control, session teardown).
pub trait ErrorCode {
    /// Returns a machine-readable error code, stable across releases.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the broadcaster core.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SnapError {
    /// Unknown message type, oversize payload, truncated read, malformed body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket/read/write/accept failure, or EOF on a stream.
    #[error("io error: {0}")]
    Io(String),

    /// A pending request's deadline elapsed before a matching response arrived.
    #[error("operation timed out")]
    TimedOut,

    /// Malformed URI, unsupported sample rate/bits, or similar caller mistake.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A control command was issued but the corresponding `can_*` flag is false.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// `can_control` is false.
    #[error("stream does not accept control commands")]
    CanControlIsFalse,

    /// `can_seek` is false.
    #[error("stream is not seekable")]
    CanSeekIsFalse,

    /// `can_play` is false.
    #[error("stream cannot be played")]
    CanPlayIsFalse,

    /// `can_pause` is false.
    #[error("stream cannot be paused")]
    CanPauseIsFalse,

    /// `can_go_next` is false.
    #[error("stream has no next track")]
    CanGoNextIsFalse,

    /// `can_go_previous` is false.
    #[error("stream has no previous track")]
    CanGoPreviousIsFalse,

    /// Reader observed EOF or extended silence; non-fatal, drives state transitions.
    #[error("source starved: {0}")]
    SourceStarved(String),

    /// The kernel declined zero-copy; the caller silently falls back to the async path.
    #[error("zero-copy unavailable: {0}")]
    ZeroCopyUnavailable(String),

    /// A pending operation was cancelled by session/connection shutdown.
    #[error("operation aborted")]
    OperationAborted,
}

impl ErrorCode for SnapError {
    fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) => "io_error",
            Self::TimedOut => "timed_out",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::CapabilityDenied(_) => "capability_denied",
            Self::CanControlIsFalse => "can_control_is_false",
            Self::CanSeekIsFalse => "can_seek_is_false",
            Self::CanPlayIsFalse => "can_play_is_false",
            Self::CanPauseIsFalse => "can_pause_is_false",
            Self::CanGoNextIsFalse => "can_go_next_is_false",
            Self::CanGoPreviousIsFalse => "can_go_previous_is_false",
            Self::SourceStarved(_) => "source_starved",
            Self::ZeroCopyUnavailable(_) => "zero_copy_unavailable",
            Self::OperationAborted => "operation_aborted",
        }
    }
}

impl SnapError {
    /// True if this error, seen inside a session's receive loop, must terminate
    /// the session rather than being returned to a single caller.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for SnapError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenient Result alias for core operations.
pub type SnapResult<T> = Result<T, SnapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_errors_map_to_stable_codes() {
        assert_eq!(SnapError::CanSeekIsFalse.code(), "can_seek_is_false");
        assert_eq!(SnapError::CanPlayIsFalse.code(), "can_play_is_false");
        assert_eq!(SnapError::CanPauseIsFalse.code(), "can_pause_is_false");
        assert_eq!(SnapError::CanGoNextIsFalse.code(), "can_go_next_is_false");
        assert_eq!(SnapError::CanGoPreviousIsFalse.code(), "can_go_previous_is_false");
        assert_eq!(SnapError::CanControlIsFalse.code(), "can_control_is_false");
    }

    #[test]
    fn protocol_and_io_errors_are_session_fatal() {
        assert!(SnapError::Protocol("bad type".into()).is_session_fatal());
        assert!(SnapError::Io("broken pipe".into()).is_session_fatal());
        assert!(!SnapError::TimedOut.is_session_fatal());
        assert!(!SnapError::CapabilityDenied("x".into()).is_session_fatal());
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let err: SnapError = io_err.into();
        assert_eq!(err.code(), "io_error");
    }
}
