//! Error types for the streaming core

use thiserror::Error;

use crate::types::Direction;

/// Errors that can occur on the streaming data path
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A blocking wait elapsed without progress (routine, caller decides)
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The cancellation token fired while blocked
    #[error("Operation cancelled")]
    Cancelled,

    /// Requested sample format (or format pair) has no kernel
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// Channel mask selects more channels than the stream may carry
    #[error("Too many channels requested: {requested} (max {max})")]
    TooManyChannels { requested: usize, max: usize },

    /// Hardware or transport failure reported by a backend
    #[error("Backend failure (code {code}): {context}")]
    Backend { code: i32, context: String },

    /// Buffer allocation could not be satisfied
    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// Programmer error: wrong slot index, wrong role, short buffer
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Operation not valid in the stream's current state
    #[error("Cannot {op} a {direction} stream in state {state}")]
    InvalidState {
        op: &'static str,
        direction: Direction,
        state: &'static str,
    },

    /// Malformed argument (empty mask, zero packet size, bad device string)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The owning device was closed or dropped
    #[error("Device is closed")]
    DeviceClosed,

    /// Device close requested while streams are still registered
    #[error("Device still has {0} open stream(s)")]
    StreamsOpen(usize),

    /// The peer role of a ring buffer went away
    #[error("Ring buffer peer disconnected")]
    Disconnected,
}

impl Error {
    /// Backend error helper
    pub fn backend(code: i32, context: impl Into<String>) -> Self {
        Error::Backend {
            code,
            context: context.into(),
        }
    }

    /// Whether the caller may simply retry the same call
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Result type for streaming operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_transient() {
        assert!(Error::Timeout("free slot").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Disconnected.is_transient());
        assert!(!Error::backend(-5, "io").is_transient());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = Error::InvalidState {
            op: "recv",
            direction: Direction::Tx,
            state: "running",
        };
        assert_eq!(err.to_string(), "Cannot recv a TX stream in state running");
        assert_eq!(
            Error::backend(-110, "TX timestamp @0 is late").to_string(),
            "Backend failure (code -110): TX timestamp @0 is late"
        );
    }
}
