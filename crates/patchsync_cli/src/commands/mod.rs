//! CLI command implementations.

pub mod agent;
pub mod config;
pub mod diff;
pub mod digest;
pub mod rollback;
pub mod serve;
pub mod token;
