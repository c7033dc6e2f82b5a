//! The synchronizer service.

use crate::config::ServerConfig;
use crate::diff::DiffEngine;
use crate::error::{ServerError, ServerResult};
use crate::history::RevisionReader;
use crate::producer::run_producer;
use crate::queue::QueueStats;
use crate::rollback::{DeliveryLog, Pin};
use crate::session::{SessionManager, SessionSummary, SyncEvent, WatchRange};
use crate::worker::{blocking, serve_connection};
use patchsync_protocol::Revision;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, info_span, Instrument};

/// Point-in-time view of the synchronizer.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// Reference being followed.
    pub reference: String,
    /// Latest head read from history.
    pub head: Option<Revision>,
    /// Every known session.
    pub sessions: Vec<SessionSummary>,
    /// Queue sizes.
    pub queue: QueueStats,
    /// Active rollback pin.
    pub pin: Option<Pin>,
}

/// A running synchronizer.
///
/// Accepts agent connections on a TCP listener, follows the watched
/// reference and streams patch sets to every connected agent.
///
/// # Example
///
/// ```no_run
/// use patchsync_server::{GitHistory, ServerConfig, Synchronizer, WatchRange};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let history = Arc::new(GitHistory::open("/srv/site.git")?);
/// let server = Synchronizer::start(history, WatchRange::new("main"), ServerConfig::default()).await?;
/// println!("listening on {}", server.local_addr());
/// server.run_until(tokio::signal::ctrl_c()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Synchronizer {
    manager: Arc<SessionManager>,
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    acceptor: JoinHandle<ServerResult<()>>,
    producer: JoinHandle<ServerResult<()>>,
}

impl Synchronizer {
    /// Validates `config`, opens the state directory if one is set, reads
    /// the current head, binds the listener and starts accepting agents.
    pub async fn start(
        reader: Arc<dyn RevisionReader>,
        watch: WatchRange,
        config: ServerConfig,
    ) -> ServerResult<Self> {
        config.validate()?;
        let engine = DiffEngine::new(reader, config.diff.clone());
        let mut manager = SessionManager::new(engine, watch, config.clone());
        if let Some(dir) = &config.state_dir {
            manager = manager.with_delivery_log(DeliveryLog::open(dir, config.deliveries.clone())?);
        }
        let manager = Arc::new(manager);

        let head = blocking(&manager, |m| {
            m.sync_pin()?;
            let head = m.refresh_head()?;
            m.record_delivery(&head);
            Ok(head)
        })
        .await?;
        let listener = TcpListener::bind(manager.config().bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            reference = %manager.watch().reference,
            head = %head.short(),
            "synchronizer listening"
        );

        let (shutdown, _) = broadcast::channel::<()>(16);
        let acceptor = tokio::spawn(accept_loop(
            listener,
            manager.clone(),
            shutdown.clone(),
            shutdown.subscribe(),
        ));
        let producer = {
            let manager = manager.clone();
            let shutdown_tx = shutdown.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let result = run_producer(manager, shutdown_rx).await;
                let _ = shutdown_tx.send(());
                result
            })
        };

        Ok(Self {
            manager,
            local_addr,
            shutdown,
            acceptor,
            producer,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session manager, for embedding and tests.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            reference: self.manager.watch().reference.clone(),
            head: self.manager.head(),
            sessions: self.manager.status(),
            queue: self.manager.queue_stats(),
            pin: self.manager.pin(),
        }
    }

    /// Subscribes to session and history events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.manager.subscribe()
    }

    /// Runs until `signal` resolves or a background task stops, then shuts
    /// down.
    pub async fn run_until<F: Future>(self, signal: F) -> ServerResult<()> {
        let mut stopped = self.shutdown.subscribe();
        tokio::select! {
            _ = signal => info!("shutdown requested"),
            _ = stopped.recv() => {}
        }
        self.shutdown().await
    }

    /// Says goodbye to every agent, stops background tasks and drops all
    /// sessions.
    pub async fn shutdown(self) -> ServerResult<()> {
        let _ = self.shutdown.send(());
        let (acceptor, producer) = tokio::join!(self.acceptor, self.producer);
        self.manager.close_all("synchronizer shut down");
        info!("synchronizer stopped");
        join_result("acceptor", acceptor)?;
        join_result("producer", producer)
    }
}

fn join_result(
    name: &str,
    joined: Result<ServerResult<()>, tokio::task::JoinError>,
) -> ServerResult<()> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(ServerError::Internal(format!("{name} task failed: {err}"))),
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServerResult<()> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient_accept_error(&err) => {
                        error!(error = %err, "accept failed");
                        continue;
                    }
                    Err(err) => {
                        let _ = shutdown_tx.send(());
                        break Err(err.into());
                    }
                };
                let _ = stream.set_nodelay(true);
                let span = info_span!("connection", %peer);
                connections.spawn(
                    serve_connection(stream, manager.clone(), shutdown_tx.subscribe()).instrument(span),
                );
            }
        }
    };

    // Workers observe the same shutdown signal and say goodbye.
    while connections.join_next().await.is_some() {}
    result
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) || err.raw_os_error().is_some_and(|code| code == 24 || code == 23)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use patchsync_protocol::{FrameReader, FrameWriter, Hello, Message, TreeDigest};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use uuid::Uuid;

    fn local_config() -> ServerConfig {
        ServerConfig::default().with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[tokio::test]
    async fn start_requires_readable_head() {
        let history = Arc::new(MemoryHistory::new());
        let result = Synchronizer::start(history, WatchRange::new("main"), local_config()).await;
        assert!(matches!(result, Err(ServerError::History(_))));
    }

    #[tokio::test]
    async fn accepts_agents_and_shuts_down() {
        let history = Arc::new(MemoryHistory::new());
        let r1 = history.commit_changes("main", [("index.html", Some(&b"<html/>"[..]))]);
        let server = Synchronizer::start(history, WatchRange::new("main"), local_config())
            .await
            .unwrap();
        assert_eq!(server.status().head, Some(r1.clone()));

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        writer
            .send(&Message::Hello(Hello::new(Uuid::new_v4(), None, TreeDigest::empty())))
            .await
            .unwrap();
        let welcome = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(welcome, Message::Welcome(ref w) if w.head == r1));
        assert_eq!(server.status().sessions.len(), 1);

        server.shutdown().await.unwrap();
        let mut saw_goodbye = false;
        while let Ok(Some(message)) = reader.next().await {
            if matches!(message, Message::Goodbye(_)) {
                saw_goodbye = true;
            }
        }
        assert!(saw_goodbye);
    }

    #[tokio::test]
    async fn start_honours_stored_pin() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(MemoryHistory::new());
        let r1 = history.commit_changes("main", [("index.html", Some(&b"v1"[..]))]);
        let r2 = history.commit_changes("main", [("index.html", Some(&b"v2"[..]))]);
        crate::rollback::write_pin(dir.path(), Some(&Pin::new(r1.clone(), "v2 is broken"))).unwrap();

        let config = local_config().with_state_dir(dir.path());
        let server = Synchronizer::start(history, WatchRange::new("main"), config)
            .await
            .unwrap();
        let status = server.status();
        assert_eq!(status.head, Some(r1.clone()));
        assert_eq!(status.pin.map(|pin| pin.revision), Some(r1.clone()));
        assert_ne!(status.head, Some(r2));

        let log = crate::rollback::read_entries(dir.path()).unwrap();
        assert_eq!(log[0].revision, r1);
        server.shutdown().await.unwrap();
    }

    #[test]
    fn status_serializes() {
        let status = SyncStatus {
            reference: "main".into(),
            head: Some("abc".into()),
            sessions: Vec::new(),
            queue: QueueStats::default(),
            pin: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["head"], "abc");
        assert!(json["pin"].is_null());
        assert_eq!(json["queue"]["pooled"], 0);
    }
}
