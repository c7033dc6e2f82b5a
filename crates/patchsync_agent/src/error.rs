//! Error types for the agent.

use patchsync_protocol::{
    ChannelError, ContentHash, DeltaError, ProtocolError, TransportError, TreeDigest,
};
use std::io;
use thiserror::Error;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that end an agent session or stop the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Connection-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed or out-of-order traffic, or a refused handshake.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The synchronizer ended the session.
    #[error("synchronizer closed the session: {0}")]
    ServerClosed(String),

    /// The local tree no longer matches the last applied revision.
    #[error("local tree drifted: expected {expected}, found {actual}")]
    Drift {
        /// Digest recorded after the last successful apply.
        expected: TreeDigest,
        /// Digest of the tree on disk.
        actual: TreeDigest,
    },

    /// Persisted agent state is unreadable.
    #[error("state error: {0}")]
    State(String),

    /// Local I/O error outside of a single patch operation.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The reconnect policy ran out of attempts.
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

impl From<ChannelError> for AgentError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transport(err) => AgentError::Transport(err),
            ChannelError::Protocol(err) => AgentError::Protocol(err),
        }
    }
}

impl AgentError {
    /// Returns true if reconnecting may help.
    ///
    /// A protocol violation restarts the session with a fresh `Hello`; a
    /// refused handshake does not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Transport(err) => err.is_retryable(),
            AgentError::Protocol(ProtocolError::Rejected(_)) => false,
            AgentError::Protocol(ProtocolError::VersionMismatch { .. }) => false,
            AgentError::Protocol(_) => true,
            AgentError::ServerClosed(_) | AgentError::Drift { .. } | AgentError::Io(_) => true,
            AgentError::State(_) | AgentError::Config(_) | AgentError::RetriesExhausted { .. } => {
                false
            }
        }
    }
}

/// Failure of a single patch operation.
///
/// Never aborts a patch set; it is reported as the path's outcome.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The content a delta applies to is missing or different.
    #[error("delta base mismatch: expected {expected}, found {}", describe(.actual))]
    BaseMismatch {
        /// Base the delta was computed against.
        expected: ContentHash,
        /// Hash of the existing content, `None` when absent.
        actual: Option<ContentHash>,
    },

    /// The delta could not be applied.
    #[error(transparent)]
    Delta(#[from] DeltaError),

    /// Rebuilt or transmitted content does not hash to the announced checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Announced checksum.
        expected: ContentHash,
        /// Hash of the content produced.
        actual: ContentHash,
    },

    /// The operation names a path the agent refuses to touch.
    #[error("invalid path {0:?}")]
    InvalidPath(String),

    /// The operation's payload does not fit its kind.
    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

impl ApplyError {
    /// True when the existing content is not what the patch was computed
    /// against. Resending the same patch cannot succeed.
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            ApplyError::BaseMismatch { .. } | ApplyError::Delta(DeltaError::BaseMismatch { .. })
        )
    }
}

fn describe(hash: &Option<ContentHash>) -> String {
    match hash {
        Some(hash) => hash.to_string(),
        None => "nothing".to_string(),
    }
}
