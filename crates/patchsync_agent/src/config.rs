//! Agent configuration.

use crate::error::{AgentError, AgentResult};
use crate::target::METADATA_DIR;
use patchsync_protocol::{duration_ms, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Stable identity. When unset, the id stored in the agent state is
    /// reused, or a new one is generated and stored.
    pub agent_id: Option<Uuid>,
    /// Synchronizer address, `host:port`.
    pub server_addr: String,
    /// Root of the tree kept in sync.
    pub target_root: PathBuf,
    /// Where agent state lives; defaults to `.patchsync` under the target.
    pub state_dir: Option<PathBuf>,
    /// Time allowed for the synchronizer to answer `Hello`.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Interval between outbound heartbeats.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered lost.
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff.
    pub retry: RetryConfig,
    /// Token presented in `Hello`.
    #[serde(skip)]
    pub auth_token: Option<Vec<u8>>,
}

impl AgentConfig {
    /// Creates a configuration syncing `target_root` from `server_addr`.
    pub fn new(server_addr: impl Into<String>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: None,
            server_addr: server_addr.into(),
            target_root: target_root.into(),
            state_dir: None,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(20),
            retry: RetryConfig::unbounded(),
            auth_token: None,
        }
    }

    /// Sets the agent id.
    pub fn with_agent_id(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Stores agent state outside the target tree.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the authentication token.
    pub fn with_auth_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Directory holding agent state.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.target_root.join(METADATA_DIR))
    }

    /// Checks settings that would make the agent misbehave.
    pub fn validate(&self) -> AgentResult<()> {
        if self.server_addr.trim().is_empty() {
            return Err(AgentError::Config("server_addr is empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(AgentError::Config("heartbeat_interval must be positive".into()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(AgentError::Config(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:7420", ".")
    }
}
