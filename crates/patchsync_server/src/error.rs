//! Error types for the synchronizer.

use crate::history::HistoryError;
use crate::queue::QueueError;
use crate::rollback::StateError;
use patchsync_protocol::{ChannelError, ProtocolError, TransportError, TreeDigest};
use thiserror::Error;
use uuid::Uuid;

/// Result type for synchronizer operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the synchronizer.
#[derive(Error, Debug)]
pub enum ServerError {
    /// History could not be read.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// Connection-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed or out-of-order traffic.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The agent's tree does not match what it claims to hold.
    #[error("tree drift: expected {expected}, agent has {actual}")]
    Drift {
        /// Digest the synchronizer expected.
        expected: TreeDigest,
        /// Digest the agent reported.
        actual: TreeDigest,
    },

    /// Patch queue invariant violated.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The state directory could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),

    /// Token missing or invalid.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No session with this id.
    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    /// Too many sessions.
    #[error("session limit of {0} reached")]
    TooManySessions(usize),

    /// The synchronizer is shutting down.
    #[error("synchronizer is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for ServerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transport(err) => ServerError::Transport(err),
            ChannelError::Protocol(err) => ServerError::Protocol(err),
        }
    }
}

impl ServerError {
    /// Returns true if the agent may resume the session by reconnecting.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::Transport(err) => err.is_retryable(),
            ServerError::Io(_) => true,
            _ => false,
        }
    }

    /// Returns true if the agent caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::Drift { .. }
                | ServerError::TooManySessions(_)
        )
    }
}
