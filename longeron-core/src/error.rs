//! Longeron error types
//!
//! One taxonomy for everything the engine can surface: channel lifecycle
//! violations, connect failures, buffer discipline violations, and codec
//! errors funneled through the pipeline.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for longeron operations.
///
/// The type is `Clone` because a single failure cause fans out to every
/// listener of the promise it failed; `io::Error` is wrapped in an `Arc`
/// for that reason.
#[derive(Error, Debug, Clone)]
pub enum LongeronError {
    /// IO error from the socket or the selector
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Operation is not legal in the channel's current state
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// A connect was issued while another connect is outstanding
    #[error("connection attempt already pending")]
    ConnectionPending,

    /// The connect deadline elapsed before the peer answered
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The peer refused the connection
    #[error("connection refused by {0}")]
    ConnectRefused(std::net::SocketAddr),

    /// The remote name did not resolve to an address
    #[error("unresolved address: {0}")]
    UnresolvedAddress(String),

    /// Operation on a closed channel, or outbound drain aborted by close
    #[error("channel closed")]
    ClosedChannel,

    /// The promise was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// Buffer retain/release drove the reference count out of range
    #[error("illegal buffer refcount: {count}, adjustment: {adjustment}")]
    IllegalRefCount { count: i32, adjustment: i32 },

    /// Access to a buffer whose reference count already reached zero
    #[error("buffer was already released")]
    BufferReleased,

    /// Buffer growth past its maximum capacity
    #[error("buffer capacity {requested} exceeds maximum {max}")]
    BufferTooLarge { requested: usize, max: usize },

    /// An encoder in the pipeline failed
    #[error("encoder error: {0}")]
    Encoder(String),

    /// A decoder in the pipeline failed
    #[error("decoder error: {0}")]
    Decoder(String),

    /// A handler callback panicked; the payload is preserved as text
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

/// Result type alias for longeron operations
pub type Result<T> = std::result::Result<T, LongeronError>;

impl From<io::Error> for LongeronError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl LongeronError {
    /// Create an encoder error with a message
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Create a decoder error with a message
    pub fn decoder(msg: impl Into<String>) -> Self {
        Self::Decoder(msg.into())
    }

    /// Check if this error ends the connection
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ClosedChannel | Self::ConnectTimeout(_) | Self::ConnectRefused(_)
        )
    }

    /// Check if this error is a buffer discipline violation
    #[must_use]
    pub const fn is_buffer_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalRefCount { .. } | Self::BufferReleased | Self::BufferTooLarge { .. }
        )
    }

    /// Check if the underlying IO error is transient (retry-friendly)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_preserves_io_cause() {
        let err = LongeronError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let cloned = err.clone();
        match (err, cloned) {
            (LongeronError::Io(a), LongeronError::Io(b)) => {
                assert_eq!(a.kind(), b.kind());
            }
            _ => panic!("expected Io variants"),
        }
    }

    #[test]
    fn test_predicates() {
        assert!(LongeronError::ClosedChannel.is_connection_error());
        assert!(LongeronError::BufferReleased.is_buffer_error());
        assert!(!LongeronError::Cancelled.is_connection_error());

        let would_block = LongeronError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(would_block.is_recoverable());
    }
}
