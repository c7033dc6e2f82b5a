//! Session table and sync decisions.
//!
//! The [`SessionManager`] owns every session, its watermark and its
//! health. It decides between full and incremental sync at handshake time,
//! interprets acknowledgments, and extends queues when history advances.
//! Methods that read history block; async callers run them on a blocking
//! thread.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::diff::DiffEngine;
use crate::error::{ServerError, ServerResult};
use crate::history::{HistoryError, HistoryResult};
use crate::queue::{PatchQueue, QueueError, QueueStats};
use crate::rollback::{Delivery, DeliveryLog, Pin};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use patchsync_protocol::{
    Ack, ChannelState, Hello, PatchSet, ProtocolError, Revision, SyncMode, TreeDigest,
    PROTOCOL_VERSION,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The part of history the synchronizer follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRange {
    /// Reference whose head is delivered (branch, tag or revision).
    pub reference: String,
    /// Oldest revision an incremental sync may start from. Agents reporting
    /// a revision that does not descend from it receive a full resync.
    pub floor: Option<Revision>,
}

impl WatchRange {
    /// Follows `reference` with no floor.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            floor: None,
        }
    }

    /// Sets the floor.
    pub fn with_floor(mut self, floor: Revision) -> Self {
        self.floor = Some(floor);
        self
    }
}

/// Coarse session condition for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    /// Syncing normally.
    Healthy,
    /// Repeated apply, protocol or history failures.
    Degraded,
    /// No live connection; the session is kept for a reconnect.
    Disconnected,
}

/// Why a full resync was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullReason {
    /// The agent reported no revision.
    FirstRun,
    /// The reported revision is not in history.
    UnknownRevision,
    /// The reported revision does not descend from the watch floor.
    OutsideFloor,
    /// The head does not descend from the reported revision.
    Unreachable,
    /// The agent's tree does not match the reported revision.
    DigestMismatch,
    /// Drift or backlog marked the session earlier.
    Forced,
}

impl fmt::Display for FullReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FullReason::FirstRun => "first run",
            FullReason::UnknownRevision => "unknown revision",
            FullReason::OutsideFloor => "outside watch floor",
            FullReason::Unreachable => "head not reachable",
            FullReason::DigestMismatch => "tree digest mismatch",
            FullReason::Forced => "forced",
        };
        f.write_str(text)
    }
}

/// Outcome of planning a session at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    /// Rebuild from the empty tree.
    Full {
        /// Why.
        reason: FullReason,
        /// Target revision.
        to: Revision,
    },
    /// Continue from the agent's revision.
    Incremental {
        /// Agent's verified revision.
        from: Revision,
        /// Target revision.
        to: Revision,
    },
    /// The agent already holds the head.
    UpToDate {
        /// Current revision.
        at: Revision,
    },
}

/// How the synchronizer interpreted an `Ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Applied cleanly; the watermark moved.
    Advanced {
        /// New watermark.
        to: Revision,
    },
    /// Some paths failed; the agent stays at `from` and the same patch set
    /// is retried.
    Retry {
        /// Revision the agent remains at.
        from: Revision,
        /// Number of failed paths.
        failures: usize,
    },
    /// Applied cleanly but the tree digest is wrong; a full resync follows.
    Drift {
        /// Digest the patch set promised.
        expected: TreeDigest,
        /// Digest the agent reported.
        actual: TreeDigest,
    },
    /// The same patch set failed more often than `max_apply_retries`; a
    /// full resync follows.
    Escalated {
        /// Number of failed paths in the last attempt.
        failures: usize,
    },
    /// The patch set was dropped for a full resync while in flight; the
    /// acknowledgment is ignored.
    Superseded,
}

/// Observable session and history events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A handshake completed.
    SessionOpened {
        /// Session id.
        session_id: Uuid,
        /// Agent id.
        agent_id: Uuid,
        /// True if an existing session was resumed.
        resumed: bool,
    },
    /// A patch set was scheduled after a handshake.
    PlanIssued {
        /// Session id.
        session_id: Uuid,
        /// Full or incremental.
        mode: SyncMode,
        /// Base revision.
        from: Revision,
        /// Target revision.
        to: Revision,
    },
    /// The agent acknowledged a patch set.
    Acknowledged {
        /// Session id.
        session_id: Uuid,
        /// New watermark.
        revision: Revision,
    },
    /// The agent reported per-path failures.
    ApplyFailed {
        /// Session id.
        session_id: Uuid,
        /// Target of the failed patch set.
        to: Revision,
        /// Number of failed paths.
        failures: usize,
    },
    /// The agent's tree drifted from the expected digest.
    DriftDetected {
        /// Session id.
        session_id: Uuid,
        /// Expected digest.
        expected: TreeDigest,
        /// Reported digest.
        actual: TreeDigest,
    },
    /// The session was switched to full resync (backlog or drift).
    ResyncScheduled {
        /// Session id.
        session_id: Uuid,
        /// Why.
        reason: String,
    },
    /// The connection was lost; the session is kept.
    SessionSuspended {
        /// Session id.
        session_id: Uuid,
        /// Why.
        reason: String,
    },
    /// The session was removed.
    SessionClosed {
        /// Session id.
        session_id: Uuid,
        /// Why.
        reason: String,
    },
    /// History could not be read.
    HistoryFailed {
        /// Error text.
        error: String,
    },
    /// Delivery was pinned to an earlier revision.
    RolledBack {
        /// Pinned revision.
        revision: Revision,
        /// Why.
        reason: String,
    },
    /// The pin was removed; the watched reference is followed again.
    RollbackCleared {
        /// Revision that was pinned.
        revision: Revision,
    },
}

/// Serializable view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub session_id: Uuid,
    /// Agent id.
    pub agent_id: Uuid,
    /// Channel state.
    pub state: ChannelState,
    /// Health.
    pub health: SessionHealth,
    /// Last acknowledged revision.
    pub last_acknowledged: Option<Revision>,
    /// Patch sets waiting to be sent or acknowledged.
    pub queued: usize,
    /// True if the next contact triggers a full resync.
    pub resync_pending: bool,
    /// When the current connection was established.
    pub connected_at: DateTime<Utc>,
    /// When the last clean acknowledgment arrived.
    pub last_ack_at: Option<DateTime<Utc>>,
    /// Acknowledgments received.
    pub acks: u64,
    /// Drift detections.
    pub drifts: u64,
    /// Most recent error.
    pub last_error: Option<String>,
}

/// Identifies one attachment of a connection to a session.
///
/// A reconnect creates a new generation; calls carrying an older
/// generation come from a superseded connection and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session id.
    pub id: Uuid,
    /// Attachment generation.
    pub generation: u64,
}

/// What a connection needs after a successful handshake.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Session handle.
    pub handle: SessionHandle,
    /// True if an existing session was resumed.
    pub resumed: bool,
    /// Woken when the session's queue grows or the session is re-planned.
    pub wake: Arc<Notify>,
    /// Woken when the session is closed or taken over by a new connection.
    pub close: Arc<Notify>,
}

struct Session {
    agent_id: Uuid,
    generation: u64,
    state: ChannelState,
    health: SessionHealth,
    watermark: Option<Revision>,
    position: Option<Revision>,
    force_full: bool,
    connected_at: DateTime<Utc>,
    disconnected_at: Option<Instant>,
    last_ack_at: Option<DateTime<Utc>>,
    consecutive_errors: u32,
    apply_retries: u32,
    resync_epoch: u64,
    last_error: Option<String>,
    acks: u64,
    drifts: u64,
    close: Arc<Notify>,
    plan_lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct Table {
    sessions: HashMap<Uuid, Session>,
    by_agent: HashMap<Uuid, Uuid>,
}

/// Owns sessions, watermarks and the sync decisions made for them.
pub struct SessionManager {
    engine: DiffEngine,
    queue: Arc<PatchQueue>,
    watch: WatchRange,
    config: ServerConfig,
    validator: Option<TokenValidator>,
    table: RwLock<Table>,
    head: RwLock<Option<Revision>>,
    pin: RwLock<Option<Pin>>,
    pin_rejected: Mutex<Option<Revision>>,
    deliveries: DeliveryLog,
    events: broadcast::Sender<SyncEvent>,
}

impl SessionManager {
    /// Creates a manager.
    pub fn new(engine: DiffEngine, watch: WatchRange, config: ServerConfig) -> Self {
        let validator = config.auth_secret.clone().map(TokenValidator::new);
        let (events, _) = broadcast::channel(256);
        let deliveries = DeliveryLog::in_memory(config.deliveries.clone());
        Self {
            engine,
            queue: Arc::new(PatchQueue::new()),
            watch,
            config,
            validator,
            table: RwLock::new(Table::default()),
            head: RwLock::new(None),
            pin: RwLock::new(None),
            pin_rejected: Mutex::new(None),
            deliveries,
            events,
        }
    }

    /// Replaces the in-memory delivery log, typically with one opened in
    /// the state directory.
    pub fn with_delivery_log(mut self, deliveries: DeliveryLog) -> Self {
        self.deliveries = deliveries;
        self
    }

    /// Recently delivered heads, newest first.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.entries()
    }

    /// Active rollback pin.
    pub fn pin(&self) -> Option<Pin> {
        self.pin.read().clone()
    }

    /// The shared patch queue.
    pub fn queue(&self) -> &Arc<PatchQueue> {
        &self.queue
    }

    /// The diff engine.
    pub fn engine(&self) -> &DiffEngine {
        &self.engine
    }

    /// The watched range.
    pub fn watch(&self) -> &WatchRange {
        &self.watch
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Latest known head, if history has been read.
    pub fn head(&self) -> Option<Revision> {
        self.head.read().clone()
    }

    /// Resolves the watched reference and records it as head. While a
    /// rollback pin is set the pinned revision is the head. Blocks.
    pub fn refresh_head(&self) -> HistoryResult<Revision> {
        // Held across the lookup so a concurrent rollback cannot be
        // overwritten by the reference's head.
        let pin = self.pin.read();
        let head = match pin.as_ref() {
            Some(pin) => pin.revision.clone(),
            None => self.engine.reader().resolve(&self.watch.reference)?,
        };
        *self.head.write() = Some(head.clone());
        Ok(head)
    }

    /// Records `head` in the delivery log. Failures are logged, delivery
    /// goes on.
    pub fn record_delivery(&self, head: &Revision) {
        if let Err(err) = self.deliveries.record(head, None) {
            warn!(head = %head.short(), error = %err, "cannot record delivery");
        }
    }

    /// Pins delivery to `pin.revision` and forces every session to a full
    /// resync to it. The pin is stored in the state directory if one is
    /// configured. Blocks.
    pub fn rollback(&self, pin: Pin) -> ServerResult<()> {
        if !self.engine.reader().contains(&pin.revision)? {
            return Err(HistoryError::UnknownRevision(pin.revision.to_string()).into());
        }
        self.deliveries.store_pin(Some(&pin))?;
        self.apply_pin(pin)
    }

    /// Removes the rollback pin. The next poll resumes following the
    /// watched reference.
    pub fn resume_following(&self) -> ServerResult<Option<Pin>> {
        self.deliveries.store_pin(None)?;
        Ok(self.clear_pin())
    }

    /// Applies changes to the stored pin made outside this process, such
    /// as by `patchsync rollback`. A pin naming a revision missing from
    /// history is logged once and ignored. Blocks.
    pub fn sync_pin(&self) -> ServerResult<()> {
        if self.deliveries.dir().is_none() {
            return Ok(());
        }
        let stored = self.deliveries.stored_pin()?;
        let current = self.pin();
        match stored {
            Some(pin) if current.as_ref().map(|c| &c.revision) != Some(&pin.revision) => {
                if !self.engine.reader().contains(&pin.revision)? {
                    let mut rejected = self.pin_rejected.lock();
                    if rejected.as_ref() != Some(&pin.revision) {
                        warn!(revision = %pin.revision, "ignoring pin to unknown revision");
                        *rejected = Some(pin.revision.clone());
                    }
                    return Ok(());
                }
                self.apply_pin(pin)
            }
            None if current.is_some() => {
                self.clear_pin();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn apply_pin(&self, pin: Pin) -> ServerResult<()> {
        let revision = pin.revision.clone();
        let reason = pin.reason.clone();
        {
            let mut slot = self.pin.write();
            *slot = Some(pin);
            self.set_head(revision.clone());
        }
        *self.pin_rejected.lock() = None;
        if let Err(err) = self.deliveries.record(&revision, Some(&reason)) {
            warn!(revision = %revision.short(), error = %err, "cannot record rollback");
        }
        info!(revision = %revision.short(), %reason, "rolled back");
        self.emit(SyncEvent::RolledBack {
            revision: revision.clone(),
            reason,
        });

        // History cannot be diffed backwards.
        let ids: Vec<Uuid> = self.table.read().sessions.keys().copied().collect();
        let why = format!("rollback to {}", revision.short());
        for id in ids {
            self.force_resync(&id, &why);
        }
        Ok(())
    }

    fn clear_pin(&self) -> Option<Pin> {
        let cleared = self.pin.write().take();
        if let Some(pin) = &cleared {
            info!(revision = %pin.revision.short(), "rollback cleared, following reference again");
            self.emit(SyncEvent::RollbackCleared {
                revision: pin.revision.clone(),
            });
        }
        cleared
    }

    fn current_head(&self) -> HistoryResult<Revision> {
        match self.head() {
            Some(head) => Ok(head),
            None => self.refresh_head(),
        }
    }

    /// Records a new head. Returns false if it was already current.
    pub fn set_head(&self, head: Revision) -> bool {
        let mut current = self.head.write();
        if current.as_ref() == Some(&head) {
            return false;
        }
        *current = Some(head);
        true
    }

    /// Validates a `Hello` and attaches the connection to a new or
    /// resumed session.
    pub fn attach(&self, hello: &Hello) -> ServerResult<Attachment> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: hello.protocol_version,
            }
            .into());
        }
        if let Some(validator) = &self.validator {
            let token = hello
                .auth_token
                .as_deref()
                .ok_or_else(|| ServerError::AuthenticationFailed("token required".into()))?;
            validator.validate(token, hello.agent_id)?;
        }

        let mut table = self.table.write();
        let existing = table.by_agent.get(&hello.agent_id).copied();
        if let Some(id) = existing {
            if let Some(session) = table.sessions.get_mut(&id) {
                // Supersede any connection still attached.
                session.close.notify_one();
                session.close = Arc::new(Notify::new());
                session.generation += 1;
                session.state = ChannelState::Handshaking;
                session.health = SessionHealth::Healthy;
                session.connected_at = Utc::now();
                session.disconnected_at = None;
                let attachment = Attachment {
                    handle: SessionHandle {
                        id,
                        generation: session.generation,
                    },
                    resumed: true,
                    wake: self.queue.register(id),
                    close: session.close.clone(),
                };
                drop(table);
                info!(session = %id, agent = %hello.agent_id, "session resumed");
                self.emit(SyncEvent::SessionOpened {
                    session_id: id,
                    agent_id: hello.agent_id,
                    resumed: true,
                });
                return Ok(attachment);
            }
        }

        let live = table
            .sessions
            .values()
            .filter(|s| s.state != ChannelState::Closed)
            .count();
        if live >= self.config.max_sessions {
            return Err(ServerError::TooManySessions(self.config.max_sessions));
        }

        let id = Uuid::new_v4();
        let close = Arc::new(Notify::new());
        table.sessions.insert(
            id,
            Session {
                agent_id: hello.agent_id,
                generation: 0,
                state: ChannelState::Handshaking,
                health: SessionHealth::Healthy,
                watermark: None,
                position: None,
                force_full: false,
                connected_at: Utc::now(),
                disconnected_at: None,
                last_ack_at: None,
                consecutive_errors: 0,
                apply_retries: 0,
                resync_epoch: 0,
                last_error: None,
                acks: 0,
                drifts: 0,
                close: close.clone(),
                plan_lock: Arc::new(Mutex::new(())),
            },
        );
        table.by_agent.insert(hello.agent_id, id);
        drop(table);

        let wake = self.queue.register(id);
        info!(session = %id, agent = %hello.agent_id, "session opened");
        self.emit(SyncEvent::SessionOpened {
            session_id: id,
            agent_id: hello.agent_id,
            resumed: false,
        });
        Ok(Attachment {
            handle: SessionHandle { id, generation: 0 },
            resumed: false,
            wake,
            close,
        })
    }

    fn plan_lock(&self, id: &Uuid) -> ServerResult<Arc<Mutex<()>>> {
        self.table
            .read()
            .sessions
            .get(id)
            .map(|s| s.plan_lock.clone())
            .ok_or(ServerError::UnknownSession(*id))
    }

    fn with_session<T>(&self, id: &Uuid, f: impl FnOnce(&mut Session) -> T) -> ServerResult<T> {
        let mut table = self.table.write();
        let session = table
            .sessions
            .get_mut(id)
            .ok_or(ServerError::UnknownSession(*id))?;
        Ok(f(session))
    }

    /// Decides between full and incremental sync for a freshly attached
    /// session.
    ///
    /// An incremental decision queues the patch sets taking the agent to
    /// head. A full decision only marks the session; the full patch set is
    /// computed by the next [`next_patch`](Self::next_patch). Blocks on
    /// history, never while holding the session's plan lock.
    pub fn plan(&self, handle: SessionHandle, hello: &Hello) -> ServerResult<SyncDecision> {
        let head = self.current_head()?;
        let forced = self.with_session(&handle.id, |s| s.force_full)?;
        let reason = self.full_reason(hello, &head, forced)?;

        let decision = {
            let lock = self.plan_lock(&handle.id)?;
            let _guard = lock.lock();
            match reason {
                Some(reason) => {
                    self.queue.clear(&handle.id);
                    self.with_session(&handle.id, |s| {
                        s.force_full = true;
                        s.position = None;
                    })?;
                    SyncDecision::Full { reason, to: head }
                }
                None => {
                    // Checked by full_reason.
                    let reported = hello
                        .reported_revision
                        .clone()
                        .ok_or_else(|| ServerError::Internal("missing reported revision".into()))?;
                    self.with_session(&handle.id, |s| {
                        s.position = Some(reported.clone());
                        if s.watermark.is_none() {
                            s.watermark = Some(reported.clone());
                        }
                    })?;
                    let dropped = self.queue.rebase(&handle.id, &reported);
                    if dropped > 0 {
                        debug!(session = %handle.id, dropped, "dropped already-applied patch sets");
                    }
                    if reported == head {
                        SyncDecision::UpToDate { at: head }
                    } else {
                        SyncDecision::Incremental { from: reported, to: head }
                    }
                }
            }
        };

        match &decision {
            SyncDecision::Full { reason, to } => {
                info!(session = %handle.id, %reason, to = %to.short(), "full resync planned");
            }
            SyncDecision::Incremental { from, to } => {
                self.extend(&handle.id)?;
                info!(session = %handle.id, from = %from.short(), to = %to.short(), "incremental sync planned");
                self.emit(SyncEvent::PlanIssued {
                    session_id: handle.id,
                    mode: SyncMode::Incremental,
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            SyncDecision::UpToDate { at } => {
                self.extend(&handle.id)?;
                debug!(session = %handle.id, at = %at.short(), "agent up to date");
            }
        }
        Ok(decision)
    }

    fn full_reason(&self, hello: &Hello, head: &Revision, forced: bool) -> ServerResult<Option<FullReason>> {
        let reader = self.engine.reader();
        let Some(reported) = &hello.reported_revision else {
            return Ok(Some(FullReason::FirstRun));
        };
        if reported.is_empty_tree() {
            return Ok(Some(FullReason::FirstRun));
        }
        if forced {
            return Ok(Some(FullReason::Forced));
        }
        if !reader.contains(reported)? {
            return Ok(Some(FullReason::UnknownRevision));
        }
        if let Some(floor) = &self.watch.floor {
            if !revision_check(reader.is_reachable(floor, reported))? {
                return Ok(Some(FullReason::OutsideFloor));
            }
        }
        if !revision_check(reader.is_reachable(reported, head))? {
            return Ok(Some(FullReason::Unreachable));
        }
        if self.engine.digest(reported)? != hello.tree_digest {
            return Ok(Some(FullReason::DigestMismatch));
        }
        Ok(None)
    }

    /// Replaces the session's queue with a full patch set to head if a full
    /// resync is pending. Returns the target when it scheduled one.
    ///
    /// The set is computed without the plan lock. A resync requested while
    /// computing restarts the computation against the then current head.
    fn schedule_full(&self, id: &Uuid) -> ServerResult<Option<Revision>> {
        loop {
            let (pending, epoch) = self.with_session(id, |s| (s.force_full, s.resync_epoch))?;
            if !pending {
                return Ok(None);
            }
            let head = self.current_head()?;
            let empty = Revision::empty_tree();
            let set = self
                .queue
                .get_or_compute(&empty, &head, || self.engine.full(&head))?;

            let lock = self.plan_lock(id)?;
            let _guard = lock.lock();
            let (pending, current) = self.with_session(id, |s| (s.force_full, s.resync_epoch))?;
            if !pending {
                return Ok(None);
            }
            if current != epoch {
                continue;
            }
            self.queue.clear(id);
            self.queue.enqueue(id, set)?;
            self.with_session(id, |s| {
                s.force_full = false;
                s.position = None;
                s.apply_retries = 0;
            })?;
            return Ok(Some(head));
        }
    }

    /// Revision the session's queue ends at. `None` while a full resync is
    /// pending or before the session has a position.
    fn queue_end(&self, id: &Uuid) -> ServerResult<Option<Revision>> {
        let position = self.with_session(id, |s| (!s.force_full).then(|| s.position.clone()))?;
        Ok(position.and_then(|position| self.queue.tail(id).or(position)))
    }

    /// Extends the session's queue up to the current head. Returns true if
    /// the queue grew.
    ///
    /// Diffs are computed without the plan lock. The queue end is checked
    /// again under the lock and the diff recomputed if it moved meanwhile.
    fn extend(&self, id: &Uuid) -> ServerResult<bool> {
        let mut extended = false;
        loop {
            let head = self.current_head()?;
            let Some(base) = self.queue_end(id)? else {
                return Ok(extended);
            };
            if base == head {
                return Ok(extended);
            }
            let set = self
                .queue
                .get_or_compute(&base, &head, || self.engine.diff(&base, &head))?;

            let lock = self.plan_lock(id)?;
            let _guard = lock.lock();
            if self.queue_end(id)?.as_ref() != Some(&base) {
                continue;
            }
            self.queue.enqueue(id, set)?;
            extended = true;
        }
    }

    /// Records `head` and queues the patch sets taking every live session
    /// to it, switching backlogged sessions to full resync. Called by the
    /// producer; blocks.
    ///
    /// Backend failures abort and are returned for backoff. Revision errors
    /// (for example history rewritten under a session) force a full resync
    /// of the affected session only.
    pub fn advance_all(&self, head: &Revision) -> ServerResult<usize> {
        self.set_head(head.clone());
        let ids: Vec<Uuid> = {
            let table = self.table.read();
            table
                .sessions
                .iter()
                .filter(|(_, s)| s.state != ChannelState::Closed)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut extended = 0;
        for id in ids {
            match self.extend(&id) {
                Ok(true) => extended += 1,
                Ok(false) => {}
                // Closed meanwhile.
                Err(ServerError::UnknownSession(_) | ServerError::Queue(QueueError::UnknownSession(_))) => {
                    continue
                }
                Err(ServerError::History(err)) if err.is_revision_error() => {
                    warn!(session = %id, error = %err, "cannot extend queue, scheduling full resync");
                    self.force_resync(&id, "history rewritten");
                }
                Err(err) => return Err(err),
            }
            if self.queue.is_backlogged(
                &id,
                self.config.max_queued_patch_sets,
                self.config.max_queue_age,
            ) {
                warn!(session = %id, queued = self.queue.len(&id), "session backlogged, scheduling full resync");
                self.force_resync(&id, "backlog limit reached");
            }
        }
        Ok(extended)
    }

    /// Drops the session's queue and marks it for full resync on its next
    /// contact.
    pub fn force_resync(&self, id: &Uuid, reason: &str) {
        let Ok(lock) = self.plan_lock(id) else {
            return;
        };
        let marked = {
            let _guard = lock.lock();
            self.queue.clear(id);
            self.with_session(id, |s| {
                s.force_full = true;
                s.position = None;
                s.resync_epoch += 1;
            })
            .is_ok()
        };
        if marked {
            info!(session = %id, reason, "full resync scheduled");
            self.emit(SyncEvent::ResyncScheduled {
                session_id: *id,
                reason: reason.to_string(),
            });
            if let Some(wake) = self.wake_handle(id) {
                wake.notify_one();
            }
        }
    }

    fn wake_handle(&self, id: &Uuid) -> Option<Arc<Notify>> {
        if self.table.read().sessions.contains_key(id) {
            Some(self.queue.register(*id))
        } else {
            None
        }
    }

    /// Returns the next patch set to send, first computing the full patch
    /// set if a full resync is pending. Blocks on history when it computes.
    pub fn next_patch(&self, handle: SessionHandle) -> ServerResult<Option<Arc<PatchSet>>> {
        if let Some(to) = self.schedule_full(&handle.id)? {
            info!(session = %handle.id, to = %to.short(), "full patch set queued");
            self.emit(SyncEvent::PlanIssued {
                session_id: handle.id,
                mode: SyncMode::Full,
                from: Revision::empty_tree(),
                to,
            });
            // The producer skips sessions waiting for a full set.
            self.extend(&handle.id)?;
        }
        Ok(self.queue.front(&handle.id))
    }

    /// Interprets an `Ack` for the patch set at the front of the session's
    /// queue. Blocks on history when checking watermark monotonicity.
    ///
    /// Per-path failures are retried until `max_apply_retries` is exceeded,
    /// then the session falls back to a full resync. Paths whose on-disk
    /// content no longer matched the patch base mean the tree drifted and
    /// trigger a full resync immediately.
    pub fn acknowledge(&self, handle: SessionHandle, ack: &Ack) -> ServerResult<Acknowledgment> {
        let id = handle.id;
        if self.with_session(&id, |s| s.force_full)? {
            debug!(session = %id, to = %ack.to.short(), "acknowledgment superseded by full resync");
            return Ok(Acknowledgment::Superseded);
        }
        let front = self
            .queue
            .front(&id)
            .ok_or_else(|| ProtocolError::invalid(format!("ack for {} with nothing in flight", ack.to)))?;
        if front.to != ack.to {
            return Err(ProtocolError::invalid(format!(
                "ack for {} while {} is in flight",
                ack.to, front.to
            ))
            .into());
        }

        let diverged = ack.diverged().count();
        if diverged > 0 {
            for (path, reason) in ack.diverged() {
                warn!(session = %id, path, reason, "path diverged from patch base");
            }
            return self.drifted(&id, front.expected_digest, ack.actual_digest);
        }

        let failures = ack.failures().count();
        if failures > 0 {
            for (path, reason) in ack.failures() {
                warn!(session = %id, path, reason, "agent failed to apply path");
            }
            let threshold = self.config.degraded_after_errors;
            let retries = self.with_session(&id, |s| {
                s.consecutive_errors += 1;
                s.apply_retries += 1;
                s.last_error = Some(format!("{failures} path(s) failed applying {}", ack.to));
                if s.consecutive_errors >= threshold {
                    s.health = SessionHealth::Degraded;
                }
                s.apply_retries
            })?;
            self.emit(SyncEvent::ApplyFailed {
                session_id: id,
                to: ack.to.clone(),
                failures,
            });
            if retries > self.config.max_apply_retries {
                warn!(session = %id, retries, "apply retries exhausted");
                self.force_resync(&id, "apply retries exhausted");
                return Ok(Acknowledgment::Escalated { failures });
            }
            return Ok(Acknowledgment::Retry {
                from: front.from.clone(),
                failures,
            });
        }

        if ack.actual_digest != front.expected_digest {
            return self.drifted(&id, front.expected_digest, ack.actual_digest);
        }

        self.queue.pop_acknowledged(&id, &ack.to);
        let previous = self.with_session(&id, |s| s.watermark.clone())?;
        let advance = match (&front.mode, &previous) {
            (SyncMode::Full, _) | (_, None) => true,
            (SyncMode::Incremental, Some(watermark)) => self
                .engine
                .reader()
                .is_reachable(watermark, &ack.to)
                .unwrap_or(false),
        };
        self.with_session(&id, |s| {
            if advance {
                s.watermark = Some(ack.to.clone());
            }
            s.position = Some(ack.to.clone());
            s.last_ack_at = Some(Utc::now());
            s.acks += 1;
            s.consecutive_errors = 0;
            s.apply_retries = 0;
            s.health = SessionHealth::Healthy;
            s.last_error = None;
        })?;
        info!(session = %id, revision = %ack.to.short(), "acknowledged");
        self.emit(SyncEvent::Acknowledged {
            session_id: id,
            revision: ack.to.clone(),
        });
        Ok(Acknowledgment::Advanced { to: ack.to.clone() })
    }

    fn drifted(&self, id: &Uuid, expected: TreeDigest, actual: TreeDigest) -> ServerResult<Acknowledgment> {
        warn!(session = %id, %expected, %actual, "tree drift detected");
        let drift = ServerError::Drift { expected, actual };
        self.with_session(id, |s| {
            s.drifts += 1;
            s.last_error = Some(drift.to_string());
        })?;
        self.emit(SyncEvent::DriftDetected {
            session_id: *id,
            expected,
            actual,
        });
        self.force_resync(id, "tree drift");
        Ok(Acknowledgment::Drift { expected, actual })
    }

    /// Records the channel state reported by a connection.
    pub fn set_state(&self, handle: SessionHandle, state: ChannelState) {
        let mut table = self.table.write();
        if let Some(session) = table.sessions.get_mut(&handle.id) {
            if session.generation == handle.generation {
                session.state = state;
            }
        }
    }

    /// Records an error against the session, degrading it after repeated
    /// failures.
    pub fn record_error(&self, handle: SessionHandle, error: &ServerError) {
        let threshold = self.config.degraded_after_errors;
        let _ = self.with_session(&handle.id, |s| {
            s.consecutive_errors += 1;
            s.last_error = Some(error.to_string());
            if s.consecutive_errors >= threshold && s.health == SessionHealth::Healthy {
                s.health = SessionHealth::Degraded;
            }
        });
    }

    /// Records a history failure that is not tied to one session.
    pub fn history_failed(&self, error: &HistoryError) {
        self.emit(SyncEvent::HistoryFailed {
            error: error.to_string(),
        });
    }

    /// Marks every session degraded because history cannot be read.
    pub fn degrade_all(&self, reason: &str) {
        let mut table = self.table.write();
        for session in table.sessions.values_mut() {
            if session.health == SessionHealth::Healthy {
                session.health = SessionHealth::Degraded;
            }
            session.last_error = Some(reason.to_string());
        }
    }

    /// Clears history-related degradation after history becomes readable.
    pub fn recover_all(&self) {
        let mut table = self.table.write();
        for session in table.sessions.values_mut() {
            if session.health == SessionHealth::Degraded && session.consecutive_errors == 0 {
                session.health = SessionHealth::Healthy;
                session.last_error = None;
            }
        }
    }

    /// Detaches a lost connection. The session and its queue are kept for
    /// `reconnect_grace`.
    pub fn suspend(&self, handle: SessionHandle, reason: &str) {
        let suspended = {
            let mut table = self.table.write();
            match table.sessions.get_mut(&handle.id) {
                Some(s) if s.generation == handle.generation && s.state != ChannelState::Closed => {
                    s.state = ChannelState::Reconnecting;
                    s.health = SessionHealth::Disconnected;
                    s.disconnected_at = Some(Instant::now());
                    s.last_error = Some(reason.to_string());
                    true
                }
                _ => false,
            }
        };
        if suspended {
            info!(session = %handle.id, reason, "session suspended");
            self.emit(SyncEvent::SessionSuspended {
                session_id: handle.id,
                reason: reason.to_string(),
            });
        }
    }

    /// Removes a session, its queue, and wakes its connection to close.
    pub fn close(&self, id: &Uuid, reason: &str) {
        let removed = {
            let mut table = self.table.write();
            let removed = table.sessions.remove(id);
            if let Some(session) = &removed {
                if table.by_agent.get(&session.agent_id) == Some(id) {
                    table.by_agent.remove(&session.agent_id);
                }
            }
            removed
        };
        if let Some(session) = removed {
            session.close.notify_one();
            self.queue.unregister(id);
            info!(session = %id, reason, "session closed");
            self.emit(SyncEvent::SessionClosed {
                session_id: *id,
                reason: reason.to_string(),
            });
        }
    }

    /// Closes the session behind `handle` if it is still the current
    /// attachment.
    pub fn close_handle(&self, handle: SessionHandle, reason: &str) {
        let current = self
            .table
            .read()
            .sessions
            .get(&handle.id)
            .is_some_and(|s| s.generation == handle.generation);
        if current {
            self.close(&handle.id, reason);
        }
    }

    /// Closes sessions disconnected for longer than `reconnect_grace`.
    pub fn expire_suspended(&self) -> usize {
        let grace = self.config.reconnect_grace;
        let expired: Vec<Uuid> = {
            let table = self.table.read();
            table
                .sessions
                .iter()
                .filter(|(_, s)| s.disconnected_at.is_some_and(|at| at.elapsed() > grace))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            self.close(id, "reconnect grace expired");
        }
        expired.len()
    }

    /// Evicts pooled patch sets no session can still need.
    pub fn collect_garbage(&self) -> usize {
        let live: HashSet<Revision> = {
            let table = self.table.read();
            table
                .sessions
                .values()
                .flat_map(|s| [s.position.clone(), s.watermark.clone()])
                .flatten()
                .collect()
        };
        let evicted = self.queue.collect_garbage(&live);
        if evicted > 0 {
            debug!(evicted, "evicted pooled patch sets");
        }
        evicted
    }

    /// Closes every session.
    pub fn close_all(&self, reason: &str) {
        let ids: Vec<Uuid> = self.table.read().sessions.keys().copied().collect();
        for id in ids {
            self.close(&id, reason);
        }
    }

    /// Summary of every session, ordered by connection time.
    pub fn status(&self) -> Vec<SessionSummary> {
        let table = self.table.read();
        let mut summaries: Vec<SessionSummary> = table
            .sessions
            .iter()
            .map(|(id, s)| SessionSummary {
                session_id: *id,
                agent_id: s.agent_id,
                state: s.state,
                health: s.health,
                last_acknowledged: s.watermark.clone(),
                queued: self.queue.len(id),
                resync_pending: s.force_full,
                connected_at: s.connected_at,
                last_ack_at: s.last_ack_at,
                acks: s.acks,
                drifts: s.drifts,
                last_error: s.last_error.clone(),
            })
            .collect();
        summaries.sort_by_key(|s| s.connected_at);
        summaries
    }

    /// Summary of one session.
    pub fn session(&self, id: &Uuid) -> Option<SessionSummary> {
        self.status().into_iter().find(|s| &s.session_id == id)
    }

    /// Queue sizes.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// How long to wait before resending after `attempt` failed applies.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.config.retry.delay_for_attempt(attempt)
    }
}

/// Maps revision errors from reachability checks to "not reachable".
fn revision_check(result: HistoryResult<bool>) -> HistoryResult<bool> {
    match result {
        Err(err) if err.is_revision_error() => Ok(false),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffOptions;
    use crate::history::{MemoryHistory, RevisionReader};
    use bytes::Bytes;
    use patchsync_protocol::{ContentHash, PathChange, PathOutcome};
    use std::collections::BTreeMap;

    struct Fixture {
        history: Arc<MemoryHistory>,
        manager: SessionManager,
    }

    fn fixture(config: ServerConfig) -> Fixture {
        let history = Arc::new(MemoryHistory::new());
        let engine = DiffEngine::new(history.clone(), DiffOptions::default());
        let manager = SessionManager::new(engine, WatchRange::new("main"), config);
        Fixture { history, manager }
    }

    fn hello(agent: Uuid, revision: Option<&Revision>, digest: TreeDigest) -> Hello {
        Hello::new(agent, revision.cloned(), digest)
    }

    fn clean_ack(set: &PatchSet) -> Ack {
        Ack {
            to: set.to.clone(),
            results: BTreeMap::new(),
            actual_digest: set.expected_digest,
            current_revision: Some(set.to.clone()),
        }
    }

    #[test]
    fn first_run_gets_full_resync() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a.txt", Some(&b"a"[..]))]);
        let agent = Uuid::new_v4();
        let hello = hello(agent, None, TreeDigest::empty());

        let attached = fx.manager.attach(&hello).unwrap();
        let decision = fx.manager.plan(attached.handle, &hello).unwrap();
        assert_eq!(
            decision,
            SyncDecision::Full {
                reason: FullReason::FirstRun,
                to: r1.clone()
            }
        );
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(set.mode, SyncMode::Full);
        assert_eq!(set.expected_digest, fx.history.tree_digest(&r1).unwrap());

        let outcome = fx.manager.acknowledge(attached.handle, &clean_ack(&set)).unwrap();
        assert_eq!(outcome, Acknowledgment::Advanced { to: r1.clone() });
        let summary = fx.manager.session(&attached.handle.id).unwrap();
        assert_eq!(summary.last_acknowledged, Some(r1));
        assert_eq!(summary.acks, 1);
    }

    #[test]
    fn matching_digest_gets_incremental() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("src/a.txt", Some(&b"one"[..]))]);
        let r2 = fx.history.commit_changes("main", [("src/a.txt", Some(&b"two"[..]))]);
        let agent = Uuid::new_v4();
        let hello = hello(agent, Some(&r1), fx.history.tree_digest(&r1).unwrap());

        let attached = fx.manager.attach(&hello).unwrap();
        let decision = fx.manager.plan(attached.handle, &hello).unwrap();
        assert_eq!(
            decision,
            SyncDecision::Incremental {
                from: r1.clone(),
                to: r2.clone()
            }
        );
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.ops[0].path, "src/a.txt");
    }

    #[test]
    fn digest_mismatch_forces_full() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let agent = Uuid::new_v4();
        let tampered = TreeDigest::from_entries([("a", &ContentHash::of(b"x"))]);
        let hello = hello(agent, Some(&r1), tampered);
        let attached = fx.manager.attach(&hello).unwrap();
        assert!(matches!(
            fx.manager.plan(attached.handle, &hello).unwrap(),
            SyncDecision::Full {
                reason: FullReason::DigestMismatch,
                ..
            }
        ));
    }

    #[test]
    fn unknown_and_unreachable_revisions_force_full() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let r2 = fx.history.commit_changes("main", [("a", Some(&b"2"[..]))]);

        let unknown = hello(Uuid::new_v4(), Some(&"feedface".into()), TreeDigest::empty());
        let attached = fx.manager.attach(&unknown).unwrap();
        assert!(matches!(
            fx.manager.plan(attached.handle, &unknown).unwrap(),
            SyncDecision::Full {
                reason: FullReason::UnknownRevision,
                ..
            }
        ));

        // Rewind main: r2 is no longer an ancestor of head.
        fx.history.set_ref("main", &r1).unwrap();
        fx.manager.refresh_head().unwrap();
        let ahead = hello(Uuid::new_v4(), Some(&r2), fx.history.tree_digest(&r2).unwrap());
        let attached = fx.manager.attach(&ahead).unwrap();
        assert!(matches!(
            fx.manager.plan(attached.handle, &ahead).unwrap(),
            SyncDecision::Full {
                reason: FullReason::Unreachable,
                ..
            }
        ));
    }

    #[test]
    fn up_to_date_agent_queues_nothing() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        assert_eq!(
            fx.manager.plan(attached.handle, &hello).unwrap(),
            SyncDecision::UpToDate { at: r1 }
        );
        assert!(fx.manager.next_patch(attached.handle).unwrap().is_none());
    }

    #[test]
    fn failed_paths_retry_without_advancing() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let r2 = fx.history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();

        let mut ack = clean_ack(&set);
        ack.results.insert(
            "a".into(),
            PathOutcome::Failed {
                reason: "permission denied".into(),
            },
        );
        ack.current_revision = Some(r1.clone());
        assert_eq!(
            fx.manager.acknowledge(attached.handle, &ack).unwrap(),
            Acknowledgment::Retry {
                from: r1.clone(),
                failures: 1
            }
        );
        let summary = fx.manager.session(&attached.handle.id).unwrap();
        assert_eq!(summary.last_acknowledged, Some(r1));
        assert_eq!(fx.manager.next_patch(attached.handle).unwrap().unwrap().to, r2);
    }

    #[test]
    fn drift_after_apply_schedules_full() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        fx.history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();

        let mut ack = clean_ack(&set);
        ack.actual_digest = TreeDigest::empty();
        assert!(matches!(
            fx.manager.acknowledge(attached.handle, &ack).unwrap(),
            Acknowledgment::Drift { .. }
        ));
        assert!(fx.manager.session(&attached.handle.id).unwrap().resync_pending);
        let next = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(next.mode, SyncMode::Full);
    }

    #[test]
    fn full_set_is_computed_on_first_send() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), None, TreeDigest::empty());
        let attached = fx.manager.attach(&hello).unwrap();
        let mut events = fx.manager.subscribe();

        fx.manager.plan(attached.handle, &hello).unwrap();
        let summary = fx.manager.session(&attached.handle.id).unwrap();
        assert!(summary.resync_pending);
        assert_eq!(summary.queued, 0);
        assert!(events.try_recv().is_err());

        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!((set.mode, set.to.clone()), (SyncMode::Full, r1.clone()));
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::PlanIssued { mode: SyncMode::Full, ref to, .. } if *to == r1
        ));
        assert!(!fx.manager.session(&attached.handle.id).unwrap().resync_pending);
        // Sending again returns the same in-flight set.
        assert_eq!(fx.manager.next_patch(attached.handle).unwrap().unwrap().key(), set.key());
    }

    #[test]
    fn diverged_path_schedules_full_resync() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("site/index.html", Some(&b"<p>one</p>"[..]))]);
        let r2 = fx.history.commit_changes("main", [("site/index.html", Some(&b"<p>two</p>"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();

        let mut ack = clean_ack(&set);
        ack.results.insert(
            "site/index.html".into(),
            PathOutcome::Diverged {
                reason: "base mismatch".into(),
            },
        );
        ack.actual_digest = TreeDigest::empty();
        ack.current_revision = Some(r1);
        assert!(matches!(
            fx.manager.acknowledge(attached.handle, &ack).unwrap(),
            Acknowledgment::Drift { .. }
        ));
        let summary = fx.manager.session(&attached.handle.id).unwrap();
        assert!(summary.resync_pending);
        assert_eq!(summary.drifts, 1);

        let next = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!((next.mode, next.to.clone()), (SyncMode::Full, r2));
    }

    #[test]
    fn repeated_apply_failures_escalate_to_full() {
        let fx = fixture(ServerConfig::default().with_max_apply_retries(2));
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let r2 = fx.history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();

        let failing = |set: &PatchSet| {
            let mut ack = clean_ack(set);
            ack.results.insert(
                "a".into(),
                PathOutcome::Failed {
                    reason: "file busy".into(),
                },
            );
            ack
        };
        for _ in 0..2 {
            let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
            assert!(matches!(
                fx.manager.acknowledge(attached.handle, &failing(&set)).unwrap(),
                Acknowledgment::Retry { failures: 1, .. }
            ));
        }
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(
            fx.manager.acknowledge(attached.handle, &failing(&set)).unwrap(),
            Acknowledgment::Escalated { failures: 1 }
        );
        assert!(fx.manager.session(&attached.handle.id).unwrap().resync_pending);

        let full = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(full.mode, SyncMode::Full);
        // The retry budget starts over with the full set.
        assert!(matches!(
            fx.manager.acknowledge(attached.handle, &failing(&full)).unwrap(),
            Acknowledgment::Retry { .. }
        ));
        let outcome = fx.manager.acknowledge(attached.handle, &clean_ack(&full)).unwrap();
        assert_eq!(outcome, Acknowledgment::Advanced { to: r2 });
    }

    /// Runs a callback the first time changed paths are listed.
    struct HookedHistory {
        inner: MemoryHistory,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl RevisionReader for HookedHistory {
        fn resolve(&self, reference: &str) -> HistoryResult<Revision> {
            self.inner.resolve(reference)
        }

        fn contains(&self, revision: &Revision) -> HistoryResult<bool> {
            self.inner.contains(revision)
        }

        fn is_reachable(&self, from: &Revision, to: &Revision) -> HistoryResult<bool> {
            self.inner.is_reachable(from, to)
        }

        fn changes_between(&self, from: &Revision, to: &Revision) -> HistoryResult<Vec<PathChange>> {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.changes_between(from, to)
        }

        fn content_at(&self, revision: &Revision, path: &str) -> HistoryResult<Bytes> {
            self.inner.content_at(revision, path)
        }

        fn tree(&self, revision: &Revision) -> HistoryResult<Vec<(String, ContentHash)>> {
            self.inner.tree(revision)
        }
    }

    #[test]
    fn diffs_run_outside_the_plan_lock() {
        let history = Arc::new(HookedHistory {
            inner: MemoryHistory::new(),
            hook: Mutex::new(None),
        });
        let engine = DiffEngine::new(history.clone(), DiffOptions::default());
        let manager = Arc::new(SessionManager::new(
            engine,
            WatchRange::new("main"),
            ServerConfig::default(),
        ));
        let r1 = history.inner.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), history.inner.tree_digest(&r1).unwrap());
        let attached = manager.attach(&hello).unwrap();
        manager.plan(attached.handle, &hello).unwrap();

        // A resync requested while the diff is being computed must neither
        // block nor be overwritten by the stale incremental set.
        let r2 = history.inner.commit_changes("main", [("a", Some(&b"2"[..]))]);
        let id = attached.handle.id;
        let during = manager.clone();
        *history.hook.lock() = Some(Box::new(move || during.force_resync(&id, "operator request")));
        assert_eq!(manager.advance_all(&r2).unwrap(), 0);

        let summary = manager.session(&id).unwrap();
        assert!(summary.resync_pending);
        assert_eq!(summary.queued, 0);
        let next = manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!((next.mode, next.to.clone()), (SyncMode::Full, r2));
    }

    #[test]
    fn ack_for_wrong_revision_is_protocol_error() {
        let fx = fixture(ServerConfig::default());
        fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), None, TreeDigest::empty());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();
        fx.manager.next_patch(attached.handle).unwrap().unwrap();
        let ack = Ack {
            to: "bogus".into(),
            results: BTreeMap::new(),
            actual_digest: TreeDigest::empty(),
            current_revision: None,
        };
        assert!(matches!(
            fx.manager.acknowledge(attached.handle, &ack),
            Err(ServerError::Protocol(_))
        ));
    }

    #[test]
    fn advance_all_extends_queues() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();

        let r2 = fx.history.commit_changes("main", [("b", Some(&b"2"[..]))]);
        let r3 = fx.history.commit_changes("main", [("c", Some(&b"3"[..]))]);
        assert!(fx.manager.set_head(r2.clone()));
        assert_eq!(fx.manager.advance_all(&r2).unwrap(), 1);
        assert!(fx.manager.set_head(r3.clone()));
        assert_eq!(fx.manager.advance_all(&r3).unwrap(), 1);
        assert_eq!(fx.manager.queue().tail(&attached.handle.id), Some(r3));
        assert_eq!(fx.manager.queue().len(&attached.handle.id), 2);
    }

    #[test]
    fn backlog_forces_full_resync() {
        let config = ServerConfig::default().with_backlog_limits(1, Duration::from_secs(600));
        let fx = fixture(config);
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();

        for i in 0..3u8 {
            let head = fx.history.commit_changes("main", [("a", Some(&[b'2' + i][..]))]);
            fx.manager.set_head(head.clone());
            fx.manager.advance_all(&head).unwrap();
        }
        let summary = fx.manager.session(&attached.handle.id).unwrap();
        assert!(summary.resync_pending);
        assert_eq!(summary.queued, 0);
    }

    #[test]
    fn ack_for_set_dropped_by_resync_is_ignored() {
        let config = ServerConfig::default().with_backlog_limits(1, Duration::from_secs(600));
        let fx = fixture(config);
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r1), fx.history.tree_digest(&r1).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();

        let r2 = fx.history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        fx.manager.set_head(r2.clone());
        fx.manager.advance_all(&r2).unwrap();
        let in_flight = fx.manager.next_patch(attached.handle).unwrap().unwrap();

        for i in 0..2u8 {
            let head = fx.history.commit_changes("main", [("a", Some(&[b'3' + i][..]))]);
            fx.manager.set_head(head.clone());
            fx.manager.advance_all(&head).unwrap();
        }
        let ack = Ack {
            to: in_flight.to.clone(),
            results: BTreeMap::new(),
            actual_digest: in_flight.expected_digest,
            current_revision: Some(in_flight.to.clone()),
        };
        assert_eq!(
            fx.manager.acknowledge(attached.handle, &ack).unwrap(),
            Acknowledgment::Superseded
        );
        let next = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(next.mode, SyncMode::Full);
    }

    #[test]
    fn rollback_forces_full_to_pinned_revision() {
        let fx = fixture(ServerConfig::default());
        let r1 = fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let r2 = fx.history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        let hello = hello(Uuid::new_v4(), Some(&r2), fx.history.tree_digest(&r2).unwrap());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();
        let mut events = fx.manager.subscribe();

        let missing = fx.manager.rollback(Pin::new("nope".into(), "typo"));
        assert!(matches!(missing, Err(ServerError::History(HistoryError::UnknownRevision(_)))));

        fx.manager.rollback(Pin::new(r1.clone(), "bad release")).unwrap();
        assert_eq!(fx.manager.head(), Some(r1.clone()));
        assert_eq!(fx.manager.refresh_head().unwrap(), r1);
        assert!(matches!(events.try_recv().unwrap(), SyncEvent::RolledBack { .. }));
        assert!(fx.manager.session(&attached.handle.id).unwrap().resync_pending);

        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(set.mode, SyncMode::Full);
        assert_eq!(set.to, r1);
        assert_eq!(set.expected_digest, fx.history.tree_digest(&r1).unwrap());
        assert_eq!(
            fx.manager.acknowledge(attached.handle, &clean_ack(&set)).unwrap(),
            Acknowledgment::Advanced { to: r1.clone() }
        );

        // Resuming continues incrementally from the pinned revision.
        let cleared = fx.manager.resume_following().unwrap().unwrap();
        assert_eq!(cleared.revision, r1);
        assert_eq!(fx.manager.refresh_head().unwrap(), r2);
        assert_eq!(fx.manager.advance_all(&r2).unwrap(), 1);
        let set = fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(set.mode, SyncMode::Incremental);
        assert_eq!((set.from.clone(), set.to.clone()), (r1, r2));
    }

    #[test]
    fn reconnect_resumes_session() {
        let fx = fixture(ServerConfig::default());
        fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let agent = Uuid::new_v4();
        let hello = hello(agent, None, TreeDigest::empty());
        let first = fx.manager.attach(&hello).unwrap();
        fx.manager.suspend(first.handle, "connection lost");
        assert_eq!(
            fx.manager.session(&first.handle.id).unwrap().health,
            SessionHealth::Disconnected
        );

        let second = fx.manager.attach(&hello).unwrap();
        assert!(second.resumed);
        assert_eq!(second.handle.id, first.handle.id);
        assert_eq!(second.handle.generation, first.handle.generation + 1);

        // The superseded connection cannot suspend the new attachment.
        fx.manager.suspend(first.handle, "late");
        assert_eq!(
            fx.manager.session(&first.handle.id).unwrap().health,
            SessionHealth::Healthy
        );
    }

    #[test]
    fn session_limit_and_auth() {
        let secret = b"secret".to_vec();
        let fx = fixture(ServerConfig::default().with_max_sessions(1).with_auth(secret.clone()));
        let agent = Uuid::new_v4();
        let validator = TokenValidator::new(secret);

        let no_token = hello(agent, None, TreeDigest::empty());
        assert!(matches!(
            fx.manager.attach(&no_token),
            Err(ServerError::AuthenticationFailed(_))
        ));

        let with_token = no_token.with_token(validator.create_token(agent).unwrap());
        fx.manager.attach(&with_token).unwrap();

        let other = Uuid::new_v4();
        let second = hello(other, None, TreeDigest::empty()).with_token(validator.create_token(other).unwrap());
        assert!(matches!(
            fx.manager.attach(&second),
            Err(ServerError::TooManySessions(1))
        ));
    }

    #[test]
    fn close_and_garbage_collect() {
        let fx = fixture(ServerConfig::default());
        fx.history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let hello = hello(Uuid::new_v4(), None, TreeDigest::empty());
        let attached = fx.manager.attach(&hello).unwrap();
        fx.manager.plan(attached.handle, &hello).unwrap();
        assert_eq!(fx.manager.queue_stats().pooled, 0);
        fx.manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(fx.manager.queue_stats().pooled, 1);

        let mut events = fx.manager.subscribe();
        fx.manager.close(&attached.handle.id, "test");
        assert!(fx.manager.status().is_empty());
        assert_eq!(fx.manager.collect_garbage(), 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::SessionClosed { .. }
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let fx = fixture(ServerConfig::default());
        let mut hello = hello(Uuid::new_v4(), None, TreeDigest::empty());
        hello.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            fx.manager.attach(&hello),
            Err(ServerError::Protocol(ProtocolError::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SyncEvent::HistoryFailed {
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "history_failed");
    }
}
