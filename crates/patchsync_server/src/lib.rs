//! # PatchSync Server
//!
//! The synchronizer: follows a reference in version-control history and
//! keeps any number of remote agents' trees identical to its head.
//!
//! This crate provides:
//! - Read-only history access (`RevisionReader`) over git or memory
//! - The diff engine turning changed paths into ordered patch sets
//! - Per-session patch queues with a shared patch set pool
//! - Session management: watermarks, full vs incremental decisions, drift
//! - A TCP service running one worker per agent connection
//! - HMAC-SHA256 agent tokens
//! - A delivery log and rollback pin kept in an optional state directory
//!
//! # Architecture
//!
//! A producer task polls the watched reference. When the head moves it
//! computes a patch set per distinct session watermark and appends it to
//! each session's queue. Session workers drain their own queue one patch
//! set at a time and wait for the agent's acknowledgment before advancing
//! the watermark. Diffs are computed off the async runtime.
//!
//! # Authentication
//!
//! ```rust,ignore
//! use patchsync_server::{ServerConfig, TokenValidator};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let config = ServerConfig::default().with_auth(secret.clone());
//! let token = TokenValidator::new(secret).create_token(agent_id)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod diff;
mod error;
pub mod history;
mod producer;
mod queue;
mod rollback;
mod server;
mod session;
mod worker;

pub use auth::TokenValidator;
pub use config::{DiffOptions, ServerConfig};
pub use diff::{order_changes, DiffEngine};
pub use error::{ServerError, ServerResult};
pub use history::{GitHistory, HistoryError, HistoryResult, MemoryHistory, RevisionReader};
pub use producer::{poll_once, PollReport};
pub use queue::{PatchQueue, QueueError, QueueStats, QueuedPatch};
pub use rollback::{
    read_entries, read_pin, write_pin, Delivery, DeliveryLog, Pin, RetentionConfig, StateError,
    StateResult,
};
pub use server::{SyncStatus, Synchronizer};
pub use session::{
    Acknowledgment, Attachment, FullReason, SessionHandle, SessionHealth, SessionManager,
    SessionSummary, SyncDecision, SyncEvent, WatchRange,
};
pub use worker::{serve_connection, ConnectionEnd};
