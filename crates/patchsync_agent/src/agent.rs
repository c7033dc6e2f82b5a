//! The agent's connection loop.
//!
//! An [`Agent`] connects to the synchronizer, says `Hello` with its current
//! revision and tree digest, then receives patch sets one at a time and
//! answers each with an `Ack`. Applying runs on a blocking thread so
//! heartbeats keep flowing during long applies. A patch set that is only
//! partially received when the connection drops is discarded; the next
//! `Hello` reports the unchanged revision and the synchronizer resends.

use crate::applier::RemoteApplier;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::state::StateStore;
use crate::target::{DirectoryTarget, TargetFs};
use parking_lot::{Mutex, RwLock};
use patchsync_protocol::{
    Ack, ChannelState, FrameWriter, Goodbye, Heartbeat, Inbox, Message, PatchOp, PatchSet,
    PatchSetEnd, ProtocolError, ProtocolResult, Revision, SyncPlan, TransportError,
    PROTOCOL_VERSION,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const INBOX_CAPACITY: usize = 64;

/// Point-in-time view of an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    /// Connection state.
    pub state: ChannelState,
    /// Session assigned by the synchronizer while connected.
    pub session_id: Option<Uuid>,
    /// Revision the tree is at.
    pub current_revision: Option<Revision>,
    /// Sessions established since start.
    pub sessions: u64,
    /// Patch sets acknowledged as applied.
    pub applied: u64,
    /// Patch sets acknowledged with failures or a digest mismatch.
    pub failed: u64,
    /// Most recent error.
    pub last_error: Option<String>,
}

/// How a session ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown was requested; `Goodbye` was sent.
    Shutdown,
    /// The synchronizer sent `Goodbye`.
    ServerClosed(String),
}

/// A remote agent keeping one target tree in sync.
pub struct Agent<T: TargetFs + 'static> {
    config: AgentConfig,
    agent_id: Uuid,
    applier: Arc<Mutex<RemoteApplier<T>>>,
    status: RwLock<AgentStatus>,
}

impl Agent<DirectoryTarget> {
    /// Opens the target directory and state store named by `config`.
    pub fn open(config: AgentConfig) -> AgentResult<Self> {
        let target = DirectoryTarget::open(&config.target_root)?;
        let store = StateStore::new(config.state_dir());
        let applier = RemoteApplier::with_store(target, store)?;
        Self::new(config, applier)
    }
}

impl<T: TargetFs + 'static> Agent<T> {
    /// Creates an agent around `applier`.
    ///
    /// The agent id comes from the configuration, then from the stored
    /// state, and is generated otherwise; it is recorded in the state so
    /// restarts resume the same session.
    pub fn new(config: AgentConfig, mut applier: RemoteApplier<T>) -> AgentResult<Self> {
        config.validate()?;
        let agent_id = config
            .agent_id
            .or(applier.state().agent_id)
            .unwrap_or_else(Uuid::new_v4);
        applier.set_agent_id(agent_id)?;

        let status = AgentStatus {
            state: ChannelState::Connecting,
            session_id: None,
            current_revision: applier.current_revision().cloned(),
            sessions: 0,
            applied: 0,
            failed: 0,
            last_error: None,
        };
        Ok(Self {
            config,
            agent_id,
            applier: Arc::new(Mutex::new(applier)),
            status: RwLock::new(status),
        })
    }

    /// Identity presented to the synchronizer.
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Current status.
    pub fn status(&self) -> AgentStatus {
        self.status.read().clone()
    }

    /// Runs `f` against the applier. Blocks while a patch set is applying.
    pub fn with_applier<R>(&self, f: impl FnOnce(&RemoteApplier<T>) -> R) -> R {
        f(&self.applier.lock())
    }

    /// Connects, syncs and reconnects with backoff until `shutdown` fires
    /// or an error that reconnecting cannot fix.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> AgentResult<()> {
        let retry = self.config.retry.clone();
        let mut attempt = 0u32;
        loop {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::select! {
                    _ = shutdown.recv() => return Ok(self.stopped()),
                    _ = time::sleep(delay) => {}
                }
            }

            let sessions_before = self.status.read().sessions;
            let connected = tokio::select! {
                _ = shutdown.recv() => return Ok(self.stopped()),
                connected = TcpStream::connect(self.config.server_addr.as_str()) => connected,
            };
            let result = match connected {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let span = info_span!("session", server = %self.config.server_addr);
                    self.run_session(stream, &mut shutdown).instrument(span).await
                }
                Err(err) => Err(TransportError::Io(err).into()),
            };
            if self.status.read().sessions > sessions_before {
                attempt = 0;
            }

            match result {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::ServerClosed(reason)) => {
                    info!(%reason, "synchronizer closed the session");
                    self.status.write().last_error = Some(reason);
                }
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, attempt, "session failed");
                    self.status.write().last_error = Some(err.to_string());
                }
                Err(err) => {
                    error!(error = %err, "session failed permanently");
                    self.status.write().last_error = Some(err.to_string());
                    self.enter(ChannelState::Closed);
                    return Err(err);
                }
            }

            attempt += 1;
            if retry.exhausted(attempt) {
                self.enter(ChannelState::Closed);
                return Err(AgentError::RetriesExhausted { attempts: attempt });
            }
        }
    }

    /// Runs one session over an established connection.
    pub async fn run_session<S>(
        &self,
        stream: S,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> AgentResult<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(write_half);
        let mut inbox = Inbox::spawn(read_half, INBOX_CAPACITY);
        self.enter(ChannelState::Handshaking);

        let result = self.session(&mut writer, &mut inbox, shutdown).await;
        match &result {
            Ok(SessionEnd::Shutdown) => {
                self.enter(ChannelState::Closing);
                self.enter(ChannelState::Closed);
            }
            Ok(SessionEnd::ServerClosed(_)) | Err(_) => self.enter(ChannelState::Reconnecting),
        }
        self.status.write().session_id = None;
        let _ = writer.shutdown().await;
        result
    }

    async fn session<W>(
        &self,
        writer: &mut FrameWriter<W>,
        inbox: &mut Inbox,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> AgentResult<SessionEnd>
    where
        W: AsyncWrite + Unpin,
    {
        let agent_id = self.agent_id;
        let mut hello = self.blocking(move |applier| applier.hello(agent_id)).await?;
        if let Some(token) = &self.config.auth_token {
            hello = hello.with_token(token.clone());
        }
        debug!(
            revision = hello.reported_revision.as_ref().map(Revision::short).unwrap_or("none"),
            digest = %hello.tree_digest,
            "sending hello"
        );
        writer.send(&Message::Hello(hello)).await?;

        let reply = tokio::select! {
            _ = shutdown.recv() => return Ok(SessionEnd::Shutdown),
            reply = time::timeout(self.config.handshake_timeout, inbox.recv()) => reply,
        };
        let welcome = match reply.map_err(|_| TransportError::Timeout("handshake"))?? {
            Some(Message::Welcome(welcome)) => welcome,
            Some(Message::Reject(reject)) => return Err(ProtocolError::Rejected(reject.reason).into()),
            Some(Message::Goodbye(bye)) => return Ok(SessionEnd::ServerClosed(bye.reason)),
            Some(other) => return Err(other.unexpected("Welcome").into()),
            None => return Err(TransportError::ConnectionClosed.into()),
        };
        if welcome.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: welcome.protocol_version,
            }
            .into());
        }
        {
            let mut status = self.status.write();
            status.session_id = Some(welcome.session_id);
            status.sessions += 1;
        }
        self.enter(ChannelState::Syncing);
        info!(session = %welcome.session_id, head = %welcome.head.short(), "connected");

        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();
        let mut incoming: Option<Incoming> = None;
        let mut applying: Option<JoinHandle<AgentResult<Ack>>> = None;

        loop {
            let liveness_deadline = last_seen + self.config.heartbeat_timeout;
            tokio::select! {
                _ = shutdown.recv() => {
                    let bye = Goodbye { reason: "agent shutting down".into() };
                    let _ = writer.send(&Message::Goodbye(bye)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    writer.send(&Message::Heartbeat(Heartbeat::now())).await?;
                }
                _ = time::sleep_until(liveness_deadline) => {
                    warn!("synchronizer missed heartbeats");
                    return Err(TransportError::Timeout("heartbeat").into());
                }
                joined = finished(&mut applying), if applying.is_some() => {
                    applying = None;
                    let ack = joined.map_err(|e| AgentError::State(format!("apply task failed: {e}")))??;
                    self.record_ack(&ack);
                    writer.send(&Message::Ack(ack)).await?;
                }
                inbound = inbox.recv() => {
                    last_seen = Instant::now();
                    let Some(message) = inbound? else {
                        return Err(TransportError::ConnectionClosed.into());
                    };
                    match message {
                        Message::Heartbeat(_) => {}
                        Message::Goodbye(bye) => return Ok(SessionEnd::ServerClosed(bye.reason)),
                        Message::SyncPlan(plan) if incoming.is_none() && applying.is_none() => {
                            debug!(
                                mode = ?plan.mode,
                                from = %plan.from.short(),
                                to = %plan.to.short(),
                                ops = plan.op_count,
                                "receiving patch set"
                            );
                            incoming = Some(Incoming::new(plan));
                        }
                        Message::PatchOp(op) => {
                            let set = incoming.as_mut().ok_or(ProtocolError::UnexpectedMessage {
                                expected: "SyncPlan",
                                actual: "PatchOp",
                            })?;
                            set.push(op)?;
                        }
                        Message::PatchSetEnd(end) => {
                            let set = incoming.take().ok_or(ProtocolError::UnexpectedMessage {
                                expected: "SyncPlan",
                                actual: "PatchSetEnd",
                            })?;
                            let set = set.finish(end)?;
                            let applier = self.applier.clone();
                            applying = Some(tokio::task::spawn_blocking(move || {
                                applier.lock().apply(&set)
                            }));
                        }
                        other => return Err(other.unexpected("SyncPlan or Heartbeat").into()),
                    }
                }
            }
        }
    }

    async fn blocking<R, F>(&self, f: F) -> AgentResult<R>
    where
        F: FnOnce(&mut RemoteApplier<T>) -> AgentResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let applier = self.applier.clone();
        tokio::task::spawn_blocking(move || f(&mut applier.lock()))
            .await
            .map_err(|e| AgentError::State(format!("blocking task failed: {e}")))?
    }

    fn record_ack(&self, ack: &Ack) {
        let mut status = self.status.write();
        status.current_revision = ack.current_revision.clone();
        if ack.is_clean() && ack.current_revision.as_ref() == Some(&ack.to) {
            status.applied += 1;
        } else {
            status.failed += 1;
        }
    }

    fn enter(&self, next: ChannelState) {
        let mut status = self.status.write();
        if let Err(err) = status.state.transition(next) {
            debug!(error = %err, "state unchanged");
        }
    }

    fn stopped(&self) {
        self.enter(ChannelState::Closed);
        info!("agent stopped");
    }
}

async fn finished(
    task: &mut Option<JoinHandle<AgentResult<Ack>>>,
) -> Result<AgentResult<Ack>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// A patch set being received.
struct Incoming {
    plan: SyncPlan,
    ops: Vec<PatchOp>,
}

impl Incoming {
    fn new(plan: SyncPlan) -> Self {
        Self {
            ops: Vec::with_capacity(plan.op_count.min(1024) as usize),
            plan,
        }
    }

    fn push(&mut self, op: PatchOp) -> ProtocolResult<()> {
        let expected = self.ops.len() as u32;
        if op.index != expected {
            return Err(ProtocolError::OutOfOrder {
                expected,
                actual: op.index,
            });
        }
        if expected >= self.plan.op_count {
            return Err(ProtocolError::invalid(format!(
                "more than the {} announced operations",
                self.plan.op_count
            )));
        }
        self.ops.push(op);
        Ok(())
    }

    fn finish(self, end: PatchSetEnd) -> ProtocolResult<PatchSet> {
        if end.to != self.plan.to {
            return Err(ProtocolError::invalid(format!(
                "patch set end for {} does not match plan for {}",
                end.to, self.plan.to
            )));
        }
        if end.op_count != self.plan.op_count || self.ops.len() != self.plan.op_count as usize {
            return Err(ProtocolError::invalid(format!(
                "received {} of {} operations",
                self.ops.len(),
                self.plan.op_count
            )));
        }
        Ok(PatchSet {
            mode: self.plan.mode,
            from: self.plan.from,
            to: self.plan.to,
            ops: self.ops,
            expected_digest: end.expected_digest,
        })
    }
}
