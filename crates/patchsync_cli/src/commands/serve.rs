//! Serve command implementation.

use super::config::FileConfig;
use clap::Args;
use patchsync_server::{GitHistory, RevisionReader, Synchronizer, SyncEvent, WatchRange};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Environment variable read when `--secret` is not given.
pub const SECRET_ENV: &str = "PATCHSYNC_SECRET";

/// Arguments of `patchsync serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Git repository to follow
    #[arg(short, long)]
    pub repo: Option<PathBuf>,

    /// Reference to follow
    #[arg(long)]
    pub reference: Option<String>,

    /// Listen address
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Oldest revision agents may be incrementally synced from
    #[arg(long)]
    pub floor: Option<String>,

    /// Shared secret for agent tokens (also read from PATCHSYNC_SECRET)
    #[arg(long)]
    pub secret: Option<String>,

    /// Write the status as JSON to this file every few seconds
    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Keep the delivery log and rollback pin in this directory
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

/// Runs the synchronizer until ctrl-c.
pub async fn run(file: FileConfig, args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = file.server;
    if let Some(listen) = args.listen {
        config = config.with_bind_addr(listen);
    }
    if let Some(dir) = args.state_dir {
        config = config.with_state_dir(dir);
    }
    if let Some(secret) = args.secret.or_else(|| std::env::var(SECRET_ENV).ok()) {
        config = config.with_auth(secret.into_bytes());
    }
    if config.auth_secret.is_none() {
        warn!("no shared secret configured, agents are not authenticated");
    }

    let repo = args
        .repo
        .or(file.watch.repo)
        .ok_or("repository required: pass --repo or set watch.repo")?;
    let history = Arc::new(GitHistory::open(&repo)?);

    let mut watch = WatchRange::new(args.reference.unwrap_or(file.watch.reference));
    if let Some(floor) = args.floor.or(file.watch.floor) {
        let revision = history.resolve(&floor)?;
        info!(floor = %revision.short(), "incremental sync floor set");
        watch = watch.with_floor(revision);
    }

    let server = Synchronizer::start(history, watch, config).await?;
    let mut events = server.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let status_writer = args.status_file.map(|path| {
        let manager = server.manager().clone();
        let reference = server.status().reference;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let status = patchsync_server::SyncStatus {
                    reference: reference.clone(),
                    head: manager.head(),
                    sessions: manager.status(),
                    queue: manager.queue_stats(),
                    pin: manager.pin(),
                };
                match serde_json::to_vec_pretty(&status) {
                    Ok(json) => {
                        if let Err(err) = tokio::fs::write(&path, json).await {
                            warn!(path = %path.display(), error = %err, "cannot write status file");
                        }
                    }
                    Err(err) => warn!(error = %err, "cannot encode status"),
                }
            }
        })
    });

    let result = server.run_until(tokio::signal::ctrl_c()).await;
    event_log.abort();
    if let Some(task) = status_writer {
        task.abort();
    }
    Ok(result?)
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::DriftDetected { .. }
        | SyncEvent::ResyncScheduled { .. }
        | SyncEvent::ApplyFailed { .. }
        | SyncEvent::RolledBack { .. }
        | SyncEvent::RollbackCleared { .. } => {
            if let Ok(json) = serde_json::to_string(event) {
                info!(target: "patchsync::events", "{json}");
            }
        }
        _ => {
            if let Ok(json) = serde_json::to_string(event) {
                debug!(target: "patchsync::events", "{json}");
            }
        }
    }
}
