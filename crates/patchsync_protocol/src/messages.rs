//! Protocol messages exchanged over a sync channel.

use crate::change::{PatchOp, SyncMode};
use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::TreeDigest;
use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Agent → synchronizer, first message on every connection.
    Hello(Hello),
    /// Synchronizer → agent, handshake accepted.
    Welcome(Welcome),
    /// Synchronizer → agent, handshake refused; the connection closes.
    Reject(Reject),
    /// Synchronizer → agent, announces the next patch set.
    SyncPlan(SyncPlan),
    /// Synchronizer → agent, one per change.
    PatchOp(PatchOp),
    /// Synchronizer → agent, closes a patch set.
    PatchSetEnd(PatchSetEnd),
    /// Agent → synchronizer, result of applying a patch set.
    Ack(Ack),
    /// Either direction, liveness.
    Heartbeat(Heartbeat),
    /// Either direction, explicit close.
    Goodbye(Goodbye),
}

impl Message {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Hello(_) => 1,
            Message::Welcome(_) => 2,
            Message::Reject(_) => 3,
            Message::SyncPlan(_) => 4,
            Message::PatchOp(_) => 5,
            Message::PatchSetEnd(_) => 6,
            Message::Ack(_) => 7,
            Message::Heartbeat(_) => 8,
            Message::Goodbye(_) => 9,
        }
    }

    /// Returns the message name, for errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::Welcome(_) => "Welcome",
            Message::Reject(_) => "Reject",
            Message::SyncPlan(_) => "SyncPlan",
            Message::PatchOp(_) => "PatchOp",
            Message::PatchSetEnd(_) => "PatchSetEnd",
            Message::Ack(_) => "Ack",
            Message::Heartbeat(_) => "Heartbeat",
            Message::Goodbye(_) => "Goodbye",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Builds the error for receiving this message while waiting for `expected`.
    pub fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            expected,
            actual: self.name(),
        }
    }
}

/// Handshake from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version.
    pub protocol_version: u16,
    /// Stable agent identity; reconnects with the same id resume the session.
    pub agent_id: Uuid,
    /// Revision the agent believes its tree is at, `None` on first run.
    pub reported_revision: Option<Revision>,
    /// Digest of the agent's actual tree.
    pub tree_digest: TreeDigest,
    /// Authentication token, when the synchronizer requires one.
    pub auth_token: Option<Vec<u8>>,
}

impl Hello {
    /// Creates a hello for the current protocol version.
    pub fn new(agent_id: Uuid, reported_revision: Option<Revision>, tree_digest: TreeDigest) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            agent_id,
            reported_revision,
            tree_digest,
            auth_token: None,
        }
    }

    /// Attaches an authentication token.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = Some(token);
        self
    }
}

/// Handshake accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Session id assigned (or resumed) by the synchronizer.
    pub session_id: Uuid,
    /// Protocol version spoken by the synchronizer.
    pub protocol_version: u16,
    /// Latest revision the synchronizer knows.
    pub head: Revision,
}

/// Handshake refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    /// Human-readable reason.
    pub reason: String,
}

/// Announces the patch set that follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Full or incremental.
    pub mode: SyncMode,
    /// Base revision.
    pub from: Revision,
    /// Target revision.
    pub to: Revision,
    /// Number of `PatchOp` messages that follow.
    pub op_count: u32,
}

/// Marks the end of a patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSetEnd {
    /// Target revision.
    pub to: Revision,
    /// Digest the agent's tree must have after applying.
    pub expected_digest: TreeDigest,
    /// Number of operations sent.
    pub op_count: u32,
}

/// Per-path result of an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathOutcome {
    /// The path was written, removed or moved.
    Applied,
    /// The path was already in the requested state.
    Unchanged,
    /// The operation failed; the rest of the patch set still ran.
    Failed {
        /// Why.
        reason: String,
    },
    /// The path's content no longer matched the patch base, so the
    /// operation was not applied. Retrying the same patch set cannot help.
    Diverged {
        /// Why.
        reason: String,
    },
}

impl PathOutcome {
    /// True unless the operation failed or diverged.
    pub fn is_success(&self) -> bool {
        matches!(self, PathOutcome::Applied | PathOutcome::Unchanged)
    }
}

/// Result of applying one patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Target revision of the acknowledged patch set.
    pub to: Revision,
    /// Outcome per touched path.
    pub results: BTreeMap<String, PathOutcome>,
    /// Digest of the agent's tree after applying.
    pub actual_digest: TreeDigest,
    /// Revision the agent is at after applying (unchanged on failure).
    pub current_revision: Option<Revision>,
}

impl Ack {
    /// True when no path failed.
    pub fn is_clean(&self) -> bool {
        self.results.values().all(PathOutcome::is_success)
    }

    /// Failed and diverged paths with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|(path, outcome)| match outcome {
            PathOutcome::Failed { reason } | PathOutcome::Diverged { reason } => {
                Some((path.as_str(), reason.as_str()))
            }
            _ => None,
        })
    }

    /// Paths whose content did not match the patch base, with reasons.
    pub fn diverged(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|(path, outcome)| match outcome {
            PathOutcome::Diverged { reason } => Some((path.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

/// Liveness ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender wall clock, Unix millis.
    pub timestamp_ms: u64,
}

impl Heartbeat {
    /// A heartbeat stamped with the current time.
    pub fn now() -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self { timestamp_ms }
    }
}

/// Explicit close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Why the sender is closing.
    pub reason: String,
}
