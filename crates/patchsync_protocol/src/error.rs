//! Error types for the protocol layer.

use std::io;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Malformed or out-of-order traffic.
///
/// A protocol error is fatal to the session that produced it: the
/// connection is dropped and the agent starts over with a fresh `Hello`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a message.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Failed to decode a message.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// A message arrived that is not valid in the current state.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// What actually arrived.
        actual: &'static str,
    },

    /// A patch operation index did not follow its predecessor.
    #[error("out of order patch operation: expected index {expected}, got {actual}")]
    OutOfOrder {
        /// Expected index.
        expected: u32,
        /// Received index.
        actual: u32,
    },

    /// Invalid channel state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Protocol version mismatch.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// The peer refused the handshake.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// Frame exceeds the maximum allowed length.
    #[error("frame of {0} bytes exceeds maximum frame length")]
    FrameTooLarge(usize),

    /// A structurally valid message that violates an invariant.
    #[error("invalid message: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Creates an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Connection-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A deadline elapsed.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl TransportError {
    /// Returns true if reconnecting may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
            ),
            TransportError::ConnectionClosed | TransportError::Timeout(_) => true,
        }
    }
}

/// Any error raised while reading or writing a framed channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Connection-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        ChannelError::Transport(TransportError::Io(err))
    }
}

impl ChannelError {
    /// Returns true if this error is a transport failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport(err) => err.is_retryable(),
            ChannelError::Protocol(_) => false,
        }
    }
}
