//! Head polling and queue production.
//!
//! The producer watches the configured reference. When the head moves it
//! extends every live session's queue, and on each pass it expires
//! abandoned sessions and evicts unused pooled patch sets. A rollback pin
//! written to the state directory is picked up at the start of each pass,
//! and every newly delivered head is recorded. History failures
//! back off with the configured retry policy and mark sessions degraded
//! until history is readable again.

use crate::error::{ServerError, ServerResult};
use crate::session::SessionManager;
use crate::worker::blocking;
use patchsync_protocol::Revision;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

/// Result of one producer pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Head observed.
    pub head: Revision,
    /// Sessions whose queue grew.
    pub extended: usize,
    /// Sessions expired after their reconnect grace.
    pub expired: usize,
    /// Pooled patch sets evicted.
    pub evicted: usize,
}

/// Runs one producer pass. `delivered` is the head every session was last
/// extended to; it is updated only when extension succeeds. Blocks.
pub fn poll_once(manager: &SessionManager, delivered: &mut Option<Revision>) -> ServerResult<PollReport> {
    manager.sync_pin()?;
    let head = manager.refresh_head()?;
    let mut extended = 0;
    if delivered.as_ref() != Some(&head) {
        extended = manager.advance_all(&head)?;
        if delivered.is_some() {
            info!(head = %head.short(), sessions = extended, "head advanced");
        }
        manager.record_delivery(&head);
        *delivered = Some(head.clone());
    }
    let expired = manager.expire_suspended();
    let evicted = manager.collect_garbage();
    Ok(PollReport {
        head,
        extended,
        expired,
        evicted,
    })
}

/// Polls history until shutdown.
pub(crate) async fn run_producer(
    manager: Arc<SessionManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> ServerResult<()> {
    let config = manager.config().clone();
    let mut ticker = time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut delivered = manager.head();
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        let mut state = delivered.clone();
        let outcome = blocking(&manager, move |m| {
            poll_once(m, &mut state).map(|report| (report, state))
        })
        .await;

        match outcome {
            Ok((report, state)) => {
                delivered = state;
                if failures > 0 {
                    info!(after = failures, "history readable again");
                    manager.recover_all();
                    failures = 0;
                }
                debug!(
                    head = %report.head.short(),
                    extended = report.extended,
                    expired = report.expired,
                    evicted = report.evicted,
                    "poll complete"
                );
            }
            Err(err) => {
                failures += 1;
                let delay = config.retry.delay_for_attempt(failures);
                error!(error = %err, attempt = failures, delay_ms = delay.as_millis() as u64, "history poll failed");
                manager.degrade_all(&err.to_string());
                if let ServerError::History(history) = &err {
                    manager.history_failed(history);
                }
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = time::sleep(delay) => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiffOptions, ServerConfig};
    use crate::diff::DiffEngine;
    use crate::history::{MemoryHistory, RevisionReader};
    use crate::rollback::{write_pin, DeliveryLog, Pin, RetentionConfig};
    use crate::session::{SessionHealth, SyncDecision, WatchRange};
    use patchsync_protocol::SyncMode;
    use patchsync_protocol::{Hello, TreeDigest};
    use std::time::Duration;
    use uuid::Uuid;

    fn manager(history: Arc<MemoryHistory>, config: ServerConfig) -> Arc<SessionManager> {
        let engine = DiffEngine::new(history, DiffOptions::default());
        Arc::new(SessionManager::new(engine, WatchRange::new("main"), config))
    }

    #[test]
    fn poll_extends_only_on_new_head() {
        let history = Arc::new(MemoryHistory::new());
        let r1 = history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let manager = manager(history.clone(), ServerConfig::default());

        let hello = Hello::new(Uuid::new_v4(), Some(r1.clone()), history.tree_digest(&r1).unwrap());
        let attached = manager.attach(&hello).unwrap();
        manager.plan(attached.handle, &hello).unwrap();

        let mut delivered = Some(r1.clone());
        let report = poll_once(&manager, &mut delivered).unwrap();
        assert_eq!(report.extended, 0);

        let r2 = history.commit_changes("main", [("b", Some(&b"2"[..]))]);
        let report = poll_once(&manager, &mut delivered).unwrap();
        assert_eq!(report.head, r2);
        assert_eq!(report.extended, 1);
        assert_eq!(delivered, Some(r2));

        let report = poll_once(&manager, &mut delivered).unwrap();
        assert_eq!(report.extended, 0);
    }

    #[test]
    fn poll_expires_abandoned_sessions() {
        let history = Arc::new(MemoryHistory::new());
        history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let config = ServerConfig::default().with_reconnect_grace(Duration::ZERO);
        let manager = manager(history, config);

        let hello = Hello::new(Uuid::new_v4(), None, TreeDigest::empty());
        let attached = manager.attach(&hello).unwrap();
        manager.plan(attached.handle, &hello).unwrap();
        manager.next_patch(attached.handle).unwrap();
        manager.suspend(attached.handle, "lost");
        std::thread::sleep(Duration::from_millis(5));

        let mut delivered = None;
        let report = poll_once(&manager, &mut delivered).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 1);
        assert!(manager.status().is_empty());
    }

    #[test]
    fn poll_records_each_delivered_head() {
        let history = Arc::new(MemoryHistory::new());
        let r1 = history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let manager = manager(history.clone(), ServerConfig::default());

        let mut delivered = None;
        poll_once(&manager, &mut delivered).unwrap();
        poll_once(&manager, &mut delivered).unwrap();
        let r2 = history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        poll_once(&manager, &mut delivered).unwrap();

        let revisions: Vec<Revision> = manager.deliveries().into_iter().map(|d| d.revision).collect();
        assert_eq!(revisions, vec![r2, r1]);
    }

    #[test]
    fn pin_file_rolls_back_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(MemoryHistory::new());
        let r1 = history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let r2 = history.commit_changes("main", [("a", Some(&b"2"[..]))]);
        let engine = DiffEngine::new(history.clone(), DiffOptions::default());
        let log = DeliveryLog::open(dir.path(), RetentionConfig::default()).unwrap();
        let manager = SessionManager::new(engine, WatchRange::new("main"), ServerConfig::default())
            .with_delivery_log(log);

        let hello = Hello::new(Uuid::new_v4(), Some(r2.clone()), history.tree_digest(&r2).unwrap());
        let attached = manager.attach(&hello).unwrap();
        assert_eq!(
            manager.plan(attached.handle, &hello).unwrap(),
            SyncDecision::UpToDate { at: r2.clone() }
        );
        let mut delivered = None;
        assert_eq!(poll_once(&manager, &mut delivered).unwrap().head, r2);

        // Written by `patchsync rollback to` while running.
        write_pin(dir.path(), Some(&Pin::new(r1.clone(), "bad release"))).unwrap();
        let report = poll_once(&manager, &mut delivered).unwrap();
        assert_eq!(report.head, r1);
        assert_eq!(manager.pin().unwrap().revision, r1);
        let set = manager.next_patch(attached.handle).unwrap().unwrap();
        assert_eq!(set.mode, SyncMode::Full);
        assert_eq!(set.to, r1);
        let newest = &manager.deliveries()[0];
        assert_eq!(newest.revision, r1);
        assert_eq!(newest.rollback_reason.as_deref(), Some("bad release"));

        // A later commit does not move a pinned head.
        history.commit_changes("main", [("b", Some(&b"3"[..]))]);
        assert_eq!(poll_once(&manager, &mut delivered).unwrap().head, r1);

        write_pin(dir.path(), None).unwrap();
        let report = poll_once(&manager, &mut delivered).unwrap();
        assert_ne!(report.head, r1);
        assert!(manager.pin().is_none());
    }

    #[test]
    fn pin_to_unknown_revision_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(MemoryHistory::new());
        let r1 = history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let engine = DiffEngine::new(history, DiffOptions::default());
        let log = DeliveryLog::open(dir.path(), RetentionConfig::default()).unwrap();
        let manager = SessionManager::new(engine, WatchRange::new("main"), ServerConfig::default())
            .with_delivery_log(log);

        write_pin(dir.path(), Some(&Pin::new("nope".into(), "typo"))).unwrap();
        let mut delivered = None;
        assert_eq!(poll_once(&manager, &mut delivered).unwrap().head, r1);
        assert_eq!(poll_once(&manager, &mut delivered).unwrap().head, r1);
        assert!(manager.pin().is_none());
    }

    #[tokio::test]
    async fn unreadable_history_degrades_sessions() {
        let history = Arc::new(MemoryHistory::new());
        let config = ServerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(patchsync_protocol::RetryConfig::unbounded().with_initial_delay(Duration::from_millis(10)));
        // "main" does not exist yet, so every poll fails.
        let manager = manager(history.clone(), config);
        let hello = Hello::new(Uuid::new_v4(), None, TreeDigest::empty());
        let attached = manager.attach(&hello).unwrap();
        let mut events = manager.subscribe();

        let (shutdown, _) = broadcast::channel(1);
        let task = tokio::spawn(run_producer(manager.clone(), shutdown.subscribe()));

        let event = time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, crate::session::SyncEvent::HistoryFailed { .. }));
        assert_eq!(
            manager.session(&attached.handle.id).unwrap().health,
            SessionHealth::Degraded
        );

        history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        for _ in 0..200 {
            if manager.session(&attached.handle.id).unwrap().health == SessionHealth::Healthy {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.session(&attached.handle.id).unwrap().health,
            SessionHealth::Healthy
        );

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
