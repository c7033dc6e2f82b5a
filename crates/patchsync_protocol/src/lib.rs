//! # PatchSync Protocol
//!
//! Data model, wire messages and framing shared by the PatchSync
//! synchronizer and its remote agents.
//!
//! This crate provides:
//! - `Revision`, `ContentHash` and `TreeDigest` identifiers
//! - `PathChange`, `PatchOp` and `PatchSet` describing tree deltas
//! - `Delta` for transmitting modified blobs against a known base
//! - Protocol messages (Hello, SyncPlan, PatchOp, PatchSetEnd, Ack, Heartbeat)
//! - Length-prefixed CBOR framing over any tokio byte stream
//! - The per-connection `ChannelState` machine
//! - `RetryConfig` backoff shared by both ends
//!
//! Apart from the framed reader/writer, nothing here performs I/O.
//!
//! ## Wire format
//!
//! Every frame is a 4-byte big-endian length followed by one CBOR-encoded
//! [`Message`]. Frames larger than [`MAX_FRAME_LEN`] are rejected.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod delta;
mod error;
mod frame;
mod hash;
mod messages;
mod retry;
mod revision;
mod state;

pub use change::{validate_path, ChangeKind, PatchOp, PatchSet, PathChange, Payload, SyncMode};
pub use delta::{Delta, DeltaError, DeltaOp};
pub use error::{ChannelError, ProtocolError, ProtocolResult, TransportError};
pub use frame::{encode_frame, FrameReader, FrameWriter, Inbox, MAX_FRAME_LEN};
pub use hash::{ContentHash, TreeDigest};
pub use messages::{
    Ack, Goodbye, Heartbeat, Hello, Message, PatchSetEnd, PathOutcome, Reject, SyncPlan, Welcome,
    PROTOCOL_VERSION,
};
pub use retry::{duration_ms, RetryConfig};
pub use revision::Revision;
pub use state::ChannelState;
