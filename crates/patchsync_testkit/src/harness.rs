//! End-to-end harness.
//!
//! A synchronizer over in-memory history plus any number of real agents,
//! each syncing its own temporary directory over loopback TCP.

use crate::fixtures::{commit_text, fast_agent_config, local_server_config, seeded_history, REFERENCE};
use patchsync_agent::{Agent, AgentConfig, AgentResult, DirectoryTarget, TargetFs};
use patchsync_protocol::{Revision, TreeDigest};
use patchsync_server::{MemoryHistory, RevisionReader, ServerConfig, SyncEvent, Synchronizer, WatchRange};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

/// How long `wait_*` helpers poll before failing the test.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Polls `done` until it holds or [`WAIT_LIMIT`] passes.
///
/// # Panics
///
/// Panics with `what` when the condition is not reached.
pub async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = time::Instant::now() + WAIT_LIMIT;
    while time::Instant::now() < deadline {
        if done() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Awaits `future` for at most [`WAIT_LIMIT`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    time::timeout(WAIT_LIMIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// A synchronizer following [`REFERENCE`] in an in-memory history.
pub struct SyncHarness {
    /// History the synchronizer reads.
    pub history: Arc<MemoryHistory>,
    /// The running synchronizer.
    pub server: Synchronizer,
}

impl SyncHarness {
    /// Starts a synchronizer whose history holds `files`.
    pub async fn start<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::start_with(files, local_server_config()).await
    }

    /// Starts with a custom configuration.
    pub async fn start_with<'a, I>(files: I, config: ServerConfig) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let (history, _) = seeded_history(files);
        let server = Synchronizer::start(history.clone(), WatchRange::new(REFERENCE), config)
            .await
            .expect("Failed to start synchronizer");
        Self { history, server }
    }

    /// Address agents connect to.
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Current head of the watched reference.
    pub fn head(&self) -> Revision {
        self.history.resolve(REFERENCE).expect("Reference should exist")
    }

    /// Digest of the tree at `revision`.
    pub fn digest(&self, revision: &Revision) -> TreeDigest {
        self.history.tree_digest(revision).expect("Revision should exist")
    }

    /// Commits text files; `None` deletes.
    pub fn commit<'a, I>(&self, files: I) -> Revision
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        commit_text(&self.history, files)
    }

    /// Subscribes to synchronizer events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.server.subscribe()
    }

    /// Spawns an agent syncing a fresh temporary directory.
    pub fn spawn_agent(&self) -> TestAgent {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = fast_agent_config(self.addr(), dir.path());
        TestAgent::spawn(dir, config)
    }

    /// Spawns an agent connecting through `addr` (for example a proxy).
    pub fn spawn_agent_via(&self, addr: SocketAddr) -> TestAgent {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = fast_agent_config(addr, dir.path());
        TestAgent::spawn(dir, config)
    }

    /// Waits until the synchronizer recorded `revision` as acknowledged by
    /// `agent`.
    pub async fn wait_for_ack(&self, agent: &TestAgent, revision: &Revision) {
        let agent_id = agent.agent.agent_id();
        wait_until("server-side acknowledgment", || {
            self.server.status().sessions.iter().any(|s| {
                s.agent_id == agent_id && s.last_acknowledged.as_ref() == Some(revision)
            })
        })
        .await;
    }

    /// Stops the synchronizer.
    pub async fn shutdown(self) {
        self.server.shutdown().await.expect("Failed to shut down synchronizer");
    }
}

/// An agent running in the background against a temporary directory.
pub struct TestAgent {
    /// The agent.
    pub agent: Arc<Agent<DirectoryTarget>>,
    /// Directory being synced; removed on drop.
    pub dir: TempDir,
    config: AgentConfig,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<AgentResult<()>>>,
}

impl TestAgent {
    /// Opens and starts an agent for `config`, keeping `dir` alive.
    pub fn spawn(dir: TempDir, config: AgentConfig) -> Self {
        let agent = Arc::new(Agent::open(config.clone()).expect("Failed to open agent"));
        let (shutdown, rx) = broadcast::channel(1);
        let task = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(rx).await })
        };
        Self {
            agent,
            dir,
            config,
            shutdown,
            task: Some(task),
        }
    }

    /// Root of the synced tree.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Reads a synced file, `None` when absent.
    pub fn read(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(path)).ok()
    }

    /// Digest of the synced tree as the agent computes it.
    pub fn digest(&self) -> TreeDigest {
        self.agent
            .with_applier(|applier| applier.target().digest())
            .expect("Failed to digest target")
    }

    /// Revision the agent reports.
    pub fn revision(&self) -> Option<Revision> {
        self.agent.status().current_revision
    }

    /// Waits until the agent is at `revision`.
    pub async fn wait_for_revision(&self, revision: &Revision) {
        wait_until(&format!("agent at {}", revision.short()), || {
            self.revision().as_ref() == Some(revision)
        })
        .await;
    }

    /// Stops the agent and returns how its run loop ended.
    pub async fn stop(&mut self) -> AgentResult<()> {
        let _ = self.shutdown.send(());
        match self.task.take() {
            Some(task) => within("agent shutdown", task)
                .await
                .expect("Agent task panicked"),
            None => Ok(()),
        }
    }

    /// Starts a new agent on the same directory and state, as a process
    /// restart would. Call after [`TestAgent::stop`].
    pub fn respawn(self) -> Self {
        let Self { dir, config, .. } = self;
        Self::spawn(dir, config)
    }

    /// Stops the agent and respawns it.
    pub async fn restart(mut self) -> Self {
        self.stop().await.expect("Agent stopped with an error");
        self.respawn()
    }
}
