//! # PatchSync Agent
//!
//! The remote end of PatchSync: keeps a target tree identical to the
//! revision the synchronizer streams to it.
//!
//! This crate provides:
//! - `TargetFs`, the filesystem seam, with directory and in-memory targets
//! - `RemoteApplier`, applying patch sets with per-path outcomes and drift
//!   detection
//! - `StateStore`, persisting the agent's current revision
//! - `Agent`, the connection loop with heartbeats and reconnect backoff
//!
//! ## Key Invariants
//!
//! - Patch sets apply strictly in order, one at a time
//! - The current revision advances only after a clean apply whose digest
//!   matches the synchronizer's
//! - Re-applying a patch set is harmless
//!
//! ## Example
//!
//! ```rust,no_run
//! use patchsync_agent::{Agent, AgentConfig};
//! use tokio::sync::broadcast;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::open(AgentConfig::new("sync.internal:7420", "/srv/www"))?;
//! let (_shutdown, rx) = broadcast::channel(1);
//! agent.run(rx).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod applier;
mod config;
mod error;
mod state;
mod target;

pub use agent::{Agent, AgentStatus, SessionEnd};
pub use applier::RemoteApplier;
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult, ApplyError};
pub use state::{AgentState, StateStore};
pub use target::{DirectoryTarget, MemoryTarget, TargetFs, METADATA_DIR};
