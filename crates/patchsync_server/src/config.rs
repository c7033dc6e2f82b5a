//! Synchronizer configuration.

use crate::error::{ServerError, ServerResult};
use crate::rollback::RetentionConfig;
use patchsync_protocol::{duration_ms, RetryConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Maximum concurrently connected agents.
    pub max_sessions: usize,
    /// Time allowed for an agent to send `Hello`.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Interval between outbound heartbeats.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered lost.
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Time allowed for an agent to acknowledge a patch set.
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,
    /// How often history is polled for a new head.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Queue length past which a session is switched to full resync.
    pub max_queued_patch_sets: usize,
    /// Age of the oldest queued patch set past which a session is switched
    /// to full resync.
    #[serde(with = "duration_ms")]
    pub max_queue_age: Duration,
    /// How long a disconnected session is kept for the same agent to resume.
    #[serde(with = "duration_ms")]
    pub reconnect_grace: Duration,
    /// Consecutive errors after which a session is reported degraded.
    pub degraded_after_errors: u32,
    /// Consecutive failed applies of one patch set after which the session
    /// is switched to full resync.
    pub max_apply_retries: u32,
    /// Shared secret for agent tokens; `None` disables authentication.
    #[serde(skip)]
    pub auth_secret: Option<Vec<u8>>,
    /// Diff engine options.
    pub diff: DiffOptions,
    /// Backoff for history read failures.
    pub retry: RetryConfig,
    /// Directory for the delivery log and rollback pin; `None` keeps the
    /// log in memory and disables the pin file.
    pub state_dir: Option<PathBuf>,
    /// How many deliveries are kept.
    pub deliveries: RetentionConfig,
}

impl ServerConfig {
    /// Creates a configuration listening on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_sessions: 256,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(20),
            ack_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            max_queued_patch_sets: 64,
            max_queue_age: Duration::from_secs(300),
            reconnect_grace: Duration::from_secs(600),
            degraded_after_errors: 3,
            max_apply_retries: 3,
            auth_secret: None,
            diff: DiffOptions::default(),
            retry: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(60)),
            state_dir: None,
            deliveries: RetentionConfig::default(),
        }
    }

    /// Sets the listen address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the maximum number of sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval and liveness timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the acknowledgment timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the history poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the backlog limits.
    pub fn with_backlog_limits(mut self, max_len: usize, max_age: Duration) -> Self {
        self.max_queued_patch_sets = max_len;
        self.max_queue_age = max_age;
        self
    }

    /// Sets how long disconnected sessions are preserved.
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Sets how many failed applies of a patch set are retried before the
    /// session falls back to full resync.
    pub fn with_max_apply_retries(mut self, retries: u32) -> Self {
        self.max_apply_retries = retries;
        self
    }

    /// Requires agents to present a token signed with `secret`.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the diff options.
    pub fn with_diff(mut self, diff: DiffOptions) -> Self {
        self.diff = diff;
        self
    }

    /// Sets the history retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Persists the delivery log and rollback pin in `dir`.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Sets delivery log retention.
    pub fn with_deliveries(mut self, retention: RetentionConfig) -> Self {
        self.deliveries = retention;
        self
    }

    /// Checks settings that would make the synchronizer misbehave.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_sessions == 0 {
            return Err(ServerError::Config("max_sessions must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(ServerError::Config(
                "heartbeat_interval and poll_interval must be positive".into(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ServerError::Config(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        if !(self.diff.max_delta_ratio > 0.0 && self.diff.max_delta_ratio <= 1.0) {
            return Err(ServerError::Config("diff.max_delta_ratio must be in (0, 1]".into()));
        }
        if matches!(&self.auth_secret, Some(secret) if secret.is_empty()) {
            return Err(ServerError::Config("auth secret is empty".into()));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7420)))
    }
}

/// Options for turning changed paths into patch operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Collapse a delete and an add of byte-identical content into a rename.
    pub coalesce_renames: bool,
    /// Modified files at least this large are considered for delta encoding.
    pub delta_threshold: usize,
    /// A delta is used only if its size is below this fraction of the full
    /// content.
    pub max_delta_ratio: f64,
    /// Time budget for computing a single delta.
    #[serde(with = "duration_ms")]
    pub delta_deadline: Duration,
}

impl DiffOptions {
    /// Disables rename coalescing.
    pub fn without_renames(mut self) -> Self {
        self.coalesce_renames = false;
        self
    }

    /// Disables delta encoding.
    pub fn without_deltas(mut self) -> Self {
        self.delta_threshold = usize::MAX;
        self
    }

    /// Sets the delta size threshold.
    pub fn with_delta_threshold(mut self, bytes: usize) -> Self {
        self.delta_threshold = bytes;
        self
    }
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            coalesce_renames: true,
            delta_threshold: 4 * 1024,
            max_delta_ratio: 0.75,
            delta_deadline: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(ServerConfig::default().validate().is_ok());
        let config = ServerConfig::default()
            .with_heartbeat(Duration::from_secs(5), Duration::from_secs(5));
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
        assert!(ServerConfig::default().with_max_sessions(0).validate().is_err());
        assert!(ServerConfig::default().with_auth(Vec::new()).validate().is_err());
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_sessions, 256);
        assert_eq!(config.max_apply_retries, 3);
        assert!(config.auth_secret.is_none());
        assert!(config.heartbeat_interval < config.heartbeat_timeout);
        assert!(config.diff.coalesce_renames);
        assert!(config.state_dir.is_none());
        assert_eq!(config.deliveries.max_entries, 50);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_sessions(8)
            .with_heartbeat(Duration::from_millis(100), Duration::from_millis(400))
            .with_backlog_limits(4, Duration::from_secs(1))
            .with_auth(vec![1, 2, 3])
            .with_diff(DiffOptions::default().without_renames())
            .with_state_dir("/var/lib/patchsync");

        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(400));
        assert_eq!(config.max_queued_patch_sets, 4);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3]));
        assert!(!config.diff.coalesce_renames);
        assert_eq!(config.state_dir, Some(std::path::PathBuf::from("/var/lib/patchsync")));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"bind_addr": "127.0.0.1:9999", "poll_interval": 250}"#).unwrap();
        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_sessions, 256);
        assert_eq!(config.diff, DiffOptions::default());
    }
}
