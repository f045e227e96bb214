//! Domain-specific error types for the streaming pipeline.
//!
//! Only setup-time operations (configuration, codec creation, session
//! start) return `Result<T, StreamError>`. Failures on worker threads are
//! converted into [`StreamEvent`](crate::events::StreamEvent)s or silent
//! drops and never cross a thread boundary as an error value.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming pipeline.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A pixel/sample format is not supported by this operation.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    // ── Codec Errors ─────────────────────────────────────────────
    /// The codec session could not be created or configured.
    #[error("codec creation failed: {0}")]
    CodecCreation(String),

    /// A running codec session rejected a call.
    #[error("codec error: {0}")]
    Codec(String),

    /// An encoder was started twice. Encoders are single-use.
    #[error("encoder already started")]
    AlreadyStarted,

    /// The component has been torn down and cannot be used again.
    #[error("component released")]
    Released,

    // ── Buffer Errors ────────────────────────────────────────────
    /// A buffer index is outside the allocated pool.
    #[error("buffer index {index} out of range (pool size {len})")]
    BadIndex { index: usize, len: usize },

    /// A frame does not match the buffer size negotiated at prepare time.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    // ── Runtime Errors ───────────────────────────────────────────
    /// A state transition was requested from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidState(&'static str),

    /// A worker channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A worker thread could not be spawned.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── MuxerError ───────────────────────────────────────────────────

/// Failure reported by a [`Muxer`](crate::sender::Muxer).
///
/// The numeric `code` is forwarded untouched to listeners through
/// [`StreamEvent::WriteError`](crate::events::StreamEvent::WriteError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("muxer error code {code}")]
pub struct MuxerError {
    pub code: i32,
}

impl MuxerError {
    pub const fn new(code: i32) -> Self {
        Self { code }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for StreamError {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = StreamError::InvalidConfig("fps must be non-zero");
        assert!(e.to_string().contains("fps"));

        let e = StreamError::FrameSize {
            expected: 1000,
            actual: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: StreamError = "something broke".into();
        assert!(matches!(e, StreamError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: StreamError = io_err.into();
        assert!(matches!(e, StreamError::Io(_)));
    }

    #[test]
    fn muxer_error_carries_code() {
        let e = MuxerError::new(-3);
        assert_eq!(e.code, -3);
        assert!(e.to_string().contains("-3"));
    }
}
