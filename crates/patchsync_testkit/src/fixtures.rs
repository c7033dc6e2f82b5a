//! Test fixtures.
//!
//! Configurations tuned for loopback tests and helpers for seeding
//! in-memory history.

use patchsync_agent::AgentConfig;
use patchsync_protocol::{Revision, RetryConfig};
use patchsync_server::{MemoryHistory, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Reference the fixtures commit to.
pub const REFERENCE: &str = "main";

/// Synchronizer settings for tests: ephemeral loopback port, fast polling
/// and short heartbeats.
pub fn local_server_config() -> ServerConfig {
    ServerConfig::default()
        .with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_poll_interval(Duration::from_millis(20))
        .with_heartbeat(Duration::from_millis(100), Duration::from_secs(5))
}

/// Agent settings for tests: short heartbeats and near-immediate
/// reconnects without jitter.
pub fn fast_agent_config(server: SocketAddr, root: &Path) -> AgentConfig {
    AgentConfig::new(server.to_string(), root)
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_heartbeat_timeout(Duration::from_secs(5))
        .with_retry(
            RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(20))
                .with_jitter(false),
        )
}

/// Commits text files to [`REFERENCE`].
///
/// A `None` content deletes the path.
pub fn commit_text<'a, I>(history: &MemoryHistory, files: I) -> Revision
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    history.commit_changes(
        REFERENCE,
        files
            .into_iter()
            .map(|(path, content)| (path, content.map(str::as_bytes))),
    )
}

/// A history whose [`REFERENCE`] holds `files`.
pub fn seeded_history<'a, I>(files: I) -> (Arc<MemoryHistory>, Revision)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let history = Arc::new(MemoryHistory::new());
    let head = commit_text(&history, files.into_iter().map(|(p, c)| (p, Some(c))));
    (history, head)
}

/// A small static site used across scenarios.
pub fn sample_site() -> Vec<(&'static str, &'static str)> {
    vec![
        ("index.html", "<h1>home</h1>"),
        ("about/index.html", "<h1>about</h1>"),
        ("css/site.css", "body { margin: 0 }"),
        ("js/app.js", "console.log('v1');"),
        ("robots.txt", "User-agent: *"),
    ]
}
