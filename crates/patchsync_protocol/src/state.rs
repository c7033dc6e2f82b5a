//! Per-connection channel state machine.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a sync channel, as seen by either end.
///
/// ```text
/// Connecting -> Handshaking -> Syncing -> Closing -> Closed
///                    ^            |
///                    +-- Reconnecting
/// ```
///
/// Any state may move straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Transport is being established.
    Connecting,
    /// Waiting for Hello/Welcome.
    Handshaking,
    /// Patch sets are flowing.
    Syncing,
    /// Connection lost; the session is kept and a new connection is awaited.
    Reconnecting,
    /// Goodbye sent or received.
    Closing,
    /// Terminal.
    Closed,
}

impl ChannelState {
    /// Returns true if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Syncing)
                | (Syncing, Closing)
                | (Syncing, Reconnecting)
                | (Handshaking, Reconnecting)
                | (Reconnecting, Handshaking)
                | (Closing, Closed)
                | (_, Closed)
        )
    }

    /// Moves to `next`, or fails with `InvalidTransition`.
    pub fn transition(&mut self, next: ChannelState) -> ProtocolResult<()> {
        if !self.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// True while the channel may carry patch traffic.
    pub fn is_live(self) -> bool {
        matches!(self, ChannelState::Handshaking | ChannelState::Syncing)
    }

    /// True once the channel can no longer be used.
    pub fn is_terminal(self) -> bool {
        self == ChannelState::Closed
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Handshaking => "handshaking",
            ChannelState::Syncing => "syncing",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}
