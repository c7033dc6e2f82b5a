//! # PatchSync Testkit
//!
//! Test utilities for PatchSync.
//!
//! This crate provides:
//! - Fixtures: fast local configurations and seeded histories
//! - Property-based generators for trees and edits using proptest
//! - `SyncHarness`, a synchronizer over in-memory history with real agents
//!   syncing temporary directories
//! - `ScriptedAgent`, a raw protocol client for observing exactly what the
//!   synchronizer sends
//! - `FlakyProxy`, a TCP relay that can sever a connection mid-stream
//!
//! ## Usage
//!
//! ```rust,ignore
//! use patchsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn agent_catches_up() {
//!     let harness = SyncHarness::start([("index.html", "v1")]).await;
//!     let agent = harness.spawn_agent();
//!     agent.wait_for_revision(&harness.head()).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod proxy;
pub mod scripted;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::proxy::*;
    pub use crate::scripted::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
pub use proxy::*;
pub use scripted::*;
