//! Per-connection session worker.
//!
//! One worker runs per accepted connection. It performs the handshake,
//! then drains the session's queue one patch set at a time: `SyncPlan`,
//! the `PatchOp`s, `PatchSetEnd`, then waits for the `Ack` before sending
//! the next. Heartbeats flow both ways while idle and while patch sets are
//! being computed on blocking threads.
//!
//! Frames are read through an [`Inbox`] so the main loop can race inbound
//! traffic against timers without cancelling a partially read frame.

use crate::error::{ServerError, ServerResult};
use crate::session::{Acknowledgment, Attachment, SessionHandle, SessionManager};
use patchsync_protocol::{
    ChannelError, ChannelState, FrameWriter, Goodbye, Heartbeat, Hello, Inbox, Message, PatchSet,
    Reject, Welcome, PROTOCOL_VERSION,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const INBOX_CAPACITY: usize = 64;

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The handshake was refused.
    Rejected(String),
    /// The synchronizer is shutting down.
    Shutdown,
    /// A newer connection for the same agent took over, or the session was
    /// closed.
    Superseded,
    /// The agent said goodbye; the session was closed.
    Closed(String),
    /// The connection was lost; the session is kept for a reconnect.
    Lost(String),
}

/// Runs the sync protocol over one connection until it ends.
pub async fn serve_connection<S>(
    stream: S,
    manager: Arc<SessionManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> ConnectionEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = FrameWriter::new(write_half);
    let mut inbox = Inbox::spawn(read_half, INBOX_CAPACITY);

    let mut state = ChannelState::Connecting;
    let _ = state.transition(ChannelState::Handshaking);

    let end = match handshake(&manager, &mut writer, &mut inbox, &mut shutdown).await {
        Ok((attachment, hello)) => {
            let _ = state.transition(ChannelState::Syncing);
            manager.set_state(attachment.handle, state);
            let end = sync_loop(&manager, &attachment, hello, &mut writer, &mut inbox, &mut shutdown).await;
            finish(&manager, attachment.handle, &end);
            end
        }
        Err(end) => end,
    };

    if matches!(end, ConnectionEnd::Lost(_)) {
        let _ = state.transition(ChannelState::Reconnecting);
    } else {
        let _ = state.transition(ChannelState::Closing);
    }
    let _ = state.transition(ChannelState::Closed);
    let _ = writer.shutdown().await;
    debug!(?end, "connection finished");
    end
}

async fn handshake<W>(
    manager: &Arc<SessionManager>,
    writer: &mut FrameWriter<W>,
    inbox: &mut Inbox,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(Attachment, Hello), ConnectionEnd>
where
    W: AsyncWrite + Unpin,
{
    let timeout = manager.config().handshake_timeout;
    let first = tokio::select! {
        _ = shutdown.recv() => return Err(ConnectionEnd::Shutdown),
        first = time::timeout(timeout, inbox.recv()) => first,
    };
    let hello = match first {
        Ok(Ok(Some(Message::Hello(hello)))) => hello,
        Ok(Ok(Some(other))) => {
            let reason = other.unexpected("Hello").to_string();
            return Err(reject(writer, reason).await);
        }
        Ok(Err(err)) => return Err(ConnectionEnd::Lost(err.to_string())),
        Ok(Ok(None)) => return Err(ConnectionEnd::Lost("closed before handshake".into())),
        Err(_) => return Err(reject(writer, "handshake timed out".into()).await),
    };

    let attachment = match manager.attach(&hello) {
        Ok(attachment) => attachment,
        Err(err) => {
            warn!(agent = %hello.agent_id, error = %err, "handshake refused");
            return Err(reject(writer, err.to_string()).await);
        }
    };
    let handle = attachment.handle;

    // Planning may read a lot of history; it runs after the handshake so
    // heartbeats keep flowing.
    let head = match manager.head() {
        Some(head) => Ok(head),
        None => blocking(manager, |m| Ok(m.refresh_head()?)).await,
    };
    let head = match head {
        Ok(head) => head,
        Err(err) => return Err(planning_failed(manager, handle, writer, err).await),
    };
    let welcome = Message::Welcome(Welcome {
        session_id: handle.id,
        protocol_version: PROTOCOL_VERSION,
        head,
    });
    if let Err(err) = writer.send(&welcome).await {
        manager.suspend(handle, "connection lost during handshake");
        return Err(ConnectionEnd::Lost(err.to_string()));
    }
    Ok((attachment, hello))
}

async fn reject<W>(writer: &mut FrameWriter<W>, reason: String) -> ConnectionEnd
where
    W: AsyncWrite + Unpin,
{
    let _ = writer
        .send(&Message::Reject(Reject {
            reason: reason.clone(),
        }))
        .await;
    ConnectionEnd::Rejected(reason)
}

async fn planning_failed<W>(
    manager: &SessionManager,
    handle: SessionHandle,
    writer: &mut FrameWriter<W>,
    err: ServerError,
) -> ConnectionEnd
where
    W: AsyncWrite + Unpin,
{
    warn!(session = %handle.id, error = %err, "planning failed");
    manager.record_error(handle, &err);
    let _ = writer
        .send(&Message::Goodbye(Goodbye {
            reason: format!("cannot plan sync: {err}"),
        }))
        .await;
    manager.suspend(handle, "planning failed");
    ConnectionEnd::Lost(err.to_string())
}

type Job<T> = JoinHandle<ServerResult<T>>;

/// Starts `f` against the manager on a blocking thread.
fn spawn_job<T, F>(manager: &Arc<SessionManager>, f: F) -> Job<T>
where
    F: FnOnce(&SessionManager) -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || f(&manager))
}

/// Runs `f` against the manager on a blocking thread.
pub(crate) async fn blocking<T, F>(manager: &Arc<SessionManager>, f: F) -> ServerResult<T>
where
    F: FnOnce(&SessionManager) -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    joined(spawn_job(manager, f).await)
}

fn joined<T>(result: Result<ServerResult<T>, JoinError>) -> ServerResult<T> {
    result.map_err(|e| ServerError::Internal(format!("blocking task failed: {e}")))?
}

/// Waits for the job in `slot` and empties it. Never resolves while the
/// slot is empty. Cancel safe.
async fn finished<T>(slot: &mut Option<Job<T>>) -> ServerResult<T> {
    let Some(job) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = job.await;
    *slot = None;
    joined(result)
}

struct InFlight {
    set: Arc<PatchSet>,
    deadline: Instant,
}

async fn sync_loop<W>(
    manager: &Arc<SessionManager>,
    attachment: &Attachment,
    hello: Hello,
    writer: &mut FrameWriter<W>,
    inbox: &mut Inbox,
    shutdown: &mut broadcast::Receiver<()>,
) -> ConnectionEnd
where
    W: AsyncWrite + Unpin,
{
    let config = manager.config().clone();
    let handle = attachment.handle;
    let wake = attachment.wake.clone();
    let close = attachment.close.clone();

    let mut heartbeat = time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut in_flight: Option<InFlight> = None;
    let mut retry_at: Option<Instant> = None;
    let mut failed_attempts = 0u32;
    let mut poll_queue = false;
    let mut planning = Some(spawn_job(manager, move |m| m.plan(handle, &hello)));
    let mut preparing: Option<Job<Option<Arc<PatchSet>>>> = None;

    loop {
        let idle = planning.is_none() && preparing.is_none() && in_flight.is_none() && retry_at.is_none();
        if poll_queue && idle {
            poll_queue = false;
            preparing = Some(spawn_job(manager, move |m| m.next_patch(handle)));
        }

        let ack_deadline = in_flight
            .as_ref()
            .map(|f| f.deadline)
            .unwrap_or_else(|| Instant::now() + config.ack_timeout);
        let retry_deadline = retry_at.unwrap_or_else(Instant::now);
        let liveness_deadline = last_seen + config.heartbeat_timeout;

        tokio::select! {
            _ = shutdown.recv() => {
                let _ = writer.send(&goodbye("synchronizer shutting down")).await;
                return ConnectionEnd::Shutdown;
            }
            _ = close.notified() => {
                let _ = writer.send(&goodbye("session superseded")).await;
                return ConnectionEnd::Superseded;
            }
            planned = finished(&mut planning), if planning.is_some() => {
                match planned {
                    Ok(decision) => {
                        debug!(session = %handle.id, ?decision, "sync planned");
                        poll_queue = true;
                    }
                    Err(err) => return planning_failed(manager, handle, writer, err).await,
                }
            }
            prepared = finished(&mut preparing), if preparing.is_some() => {
                match prepared {
                    Ok(Some(set)) => {
                        if let Err(err) = send_patch_set(writer, &set).await {
                            return ConnectionEnd::Lost(err.to_string());
                        }
                        debug!(session = %handle.id, to = %set.to.short(), ops = set.len(), "patch set sent");
                        in_flight = Some(InFlight {
                            deadline: Instant::now() + config.ack_timeout,
                            set,
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(session = %handle.id, error = %err, "cannot prepare next patch set");
                        manager.record_error(handle, &err);
                        failed_attempts += 1;
                        retry_at = Some(Instant::now() + manager.retry_delay(failed_attempts));
                    }
                }
            }
            _ = wake.notified(), if in_flight.is_none() && retry_at.is_none() => {
                poll_queue = true;
            }
            _ = time::sleep_until(retry_deadline), if retry_at.is_some() => {
                retry_at = None;
                poll_queue = true;
            }
            _ = heartbeat.tick() => {
                if let Err(err) = writer.send(&Message::Heartbeat(Heartbeat::now())).await {
                    return ConnectionEnd::Lost(err.to_string());
                }
            }
            _ = time::sleep_until(liveness_deadline) => {
                warn!(session = %handle.id, "agent missed heartbeats");
                return ConnectionEnd::Lost("heartbeat timeout".into());
            }
            _ = time::sleep_until(ack_deadline), if in_flight.is_some() => {
                let to = in_flight.as_ref().map(|f| f.set.to.to_string()).unwrap_or_default();
                warn!(session = %handle.id, to, "no acknowledgment before deadline");
                return ConnectionEnd::Lost("ack timeout".into());
            }
            inbound = inbox.recv() => {
                last_seen = Instant::now();
                let message = match inbound {
                    Ok(Some(message)) => message,
                    Ok(None) => return ConnectionEnd::Lost("connection closed".into()),
                    Err(err) => return ConnectionEnd::Lost(err.to_string()),
                };
                match message {
                    Message::Heartbeat(_) => {}
                    Message::Goodbye(bye) => return ConnectionEnd::Closed(bye.reason),
                    Message::Ack(ack) if in_flight.is_some() => {
                        in_flight = None;
                        poll_queue = true;
                        match blocking(manager, move |m| m.acknowledge(handle, &ack)).await {
                            Ok(Acknowledgment::Advanced { .. }) => failed_attempts = 0,
                            Ok(Acknowledgment::Retry { failures, .. }) => {
                                failed_attempts += 1;
                                let delay = manager.retry_delay(failed_attempts);
                                info!(session = %handle.id, failures, delay_ms = delay.as_millis() as u64, "resending after failed apply");
                                retry_at = Some(Instant::now() + delay);
                            }
                            Ok(Acknowledgment::Escalated { failures }) => {
                                // Keep backing off: a full set may hit the same failure.
                                failed_attempts += 1;
                                let delay = manager.retry_delay(failed_attempts);
                                info!(session = %handle.id, failures, delay_ms = delay.as_millis() as u64, "switching to full resync after failed applies");
                                retry_at = Some(Instant::now() + delay);
                            }
                            Ok(Acknowledgment::Drift { .. } | Acknowledgment::Superseded) => {
                                failed_attempts = 0;
                            }
                            Err(err) => return protocol_failure(manager, handle, writer, err).await,
                        }
                    }
                    other => {
                        let err = ServerError::from(other.unexpected("Ack or Heartbeat"));
                        return protocol_failure(manager, handle, writer, err).await;
                    }
                }
            }
        }
    }
}

async fn protocol_failure<W>(
    manager: &SessionManager,
    handle: SessionHandle,
    writer: &mut FrameWriter<W>,
    err: ServerError,
) -> ConnectionEnd
where
    W: AsyncWrite + Unpin,
{
    warn!(session = %handle.id, error = %err, "closing connection");
    manager.record_error(handle, &err);
    let _ = writer.send(&goodbye(&err.to_string())).await;
    ConnectionEnd::Lost(err.to_string())
}

fn goodbye(reason: &str) -> Message {
    Message::Goodbye(Goodbye {
        reason: reason.to_string(),
    })
}

async fn send_patch_set<W>(writer: &mut FrameWriter<W>, set: &PatchSet) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.send(&Message::SyncPlan(set.plan())).await?;
    for op in &set.ops {
        writer.send(&Message::PatchOp(op.clone())).await?;
    }
    writer.send(&Message::PatchSetEnd(set.end())).await
}

fn finish(manager: &SessionManager, handle: SessionHandle, end: &ConnectionEnd) {
    match end {
        ConnectionEnd::Lost(reason) => manager.suspend(handle, reason),
        ConnectionEnd::Closed(reason) => manager.close_handle(handle, reason),
        ConnectionEnd::Shutdown => manager.set_state(handle, ChannelState::Closed),
        ConnectionEnd::Superseded | ConnectionEnd::Rejected(_) => {}
    }
}
