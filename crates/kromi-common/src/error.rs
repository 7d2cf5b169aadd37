//! Common error types for Kromi signaling.

use thiserror::Error;

use crate::protocol::SessionState;

/// Result type alias using Kromi's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for signaling and session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or out-of-order protocol message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Start requested for a device that is unknown or offline
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Message addressed to a participant that is not registered
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    /// Message addressed to a pair with no live session
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A non-terminal session already exists for the pair
    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    /// State machine refused the transition
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// The external media transport reported a failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Rate limit exceeded
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
