//! Per-session patch queues and the shared patch set pool.
//!
//! Producing a diff and sending it are decoupled here: the producer
//! enqueues, each session worker drains its own queue in order. Patch sets
//! are pooled by `(from, to)` so sessions sitting at the same watermark
//! share one computation and one allocation.

use parking_lot::{Mutex, RwLock};
use patchsync_protocol::{PatchSet, Revision};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue invariant violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The patch set does not start where the queue ends.
    #[error("patch set from {actual} does not continue queue ending at {expected}")]
    OutOfOrder {
        /// Revision the queue currently ends at.
        expected: Revision,
        /// Start of the rejected patch set.
        actual: Revision,
    },

    /// No queue is registered for the session.
    #[error("no queue for session {0}")]
    UnknownSession(Uuid),
}

/// Key of the shared pool.
pub type PoolKey = (Revision, Revision);

/// A patch set waiting to be sent.
#[derive(Debug, Clone)]
pub struct QueuedPatch {
    /// Shared patch set.
    pub set: Arc<PatchSet>,
    /// When it was enqueued.
    pub enqueued_at: Instant,
}

struct SessionQueue {
    patches: VecDeque<QueuedPatch>,
    notify: Arc<Notify>,
}

/// Queue sizes, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Patch sets in the shared pool.
    pub pooled: usize,
    /// Registered session queues.
    pub sessions: usize,
    /// Patch sets queued across all sessions.
    pub queued: usize,
}

/// Ordered per-session queues plus the shared pool.
///
/// All methods take `&self`; internal locks are never held across an
/// await point or while a diff is being computed.
#[derive(Default)]
pub struct PatchQueue {
    pool: RwLock<HashMap<PoolKey, Arc<PatchSet>>>,
    sessions: Mutex<HashMap<Uuid, SessionQueue>>,
}

impl PatchQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pooled patch set for `(from, to)`, if any.
    pub fn pooled(&self, from: &Revision, to: &Revision) -> Option<Arc<PatchSet>> {
        self.pool.read().get(&(from.clone(), to.clone())).cloned()
    }

    /// Adds a patch set to the pool, returning the pooled instance (an
    /// existing one wins).
    pub fn share(&self, set: PatchSet) -> Arc<PatchSet> {
        let mut pool = self.pool.write();
        pool.entry(set.key()).or_insert_with(|| Arc::new(set)).clone()
    }

    /// Returns the pooled patch set for `(from, to)`, computing it with
    /// `compute` when absent. `compute` runs without any lock held.
    pub fn get_or_compute<E, F>(&self, from: &Revision, to: &Revision, compute: F) -> Result<Arc<PatchSet>, E>
    where
        F: FnOnce() -> Result<PatchSet, E>,
    {
        if let Some(set) = self.pooled(from, to) {
            return Ok(set);
        }
        Ok(self.share(compute()?))
    }

    /// Registers a session queue and returns its wake-up handle. An
    /// existing queue is kept.
    pub fn register(&self, session: Uuid) -> Arc<Notify> {
        self.sessions
            .lock()
            .entry(session)
            .or_insert_with(|| SessionQueue {
                patches: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            })
            .notify
            .clone()
    }

    /// Drops a session queue.
    pub fn unregister(&self, session: &Uuid) {
        self.sessions.lock().remove(session);
    }

    /// Appends a patch set to a session queue and wakes its sender.
    ///
    /// The patch set must start where the queue currently ends.
    pub fn enqueue(&self, session: &Uuid, set: Arc<PatchSet>) -> QueueResult<()> {
        let mut sessions = self.sessions.lock();
        let queue = sessions
            .get_mut(session)
            .ok_or(QueueError::UnknownSession(*session))?;
        if let Some(tail) = queue.patches.back() {
            if tail.set.to != set.from {
                return Err(QueueError::OutOfOrder {
                    expected: tail.set.to.clone(),
                    actual: set.from.clone(),
                });
            }
        }
        queue.patches.push_back(QueuedPatch {
            set,
            enqueued_at: Instant::now(),
        });
        queue.notify.notify_one();
        Ok(())
    }

    /// Revision the session's queue ends at.
    pub fn tail(&self, session: &Uuid) -> Option<Revision> {
        let sessions = self.sessions.lock();
        sessions
            .get(session)
            .and_then(|q| q.patches.back())
            .map(|p| p.set.to.clone())
    }

    /// Next patch set to send, without removing it.
    pub fn front(&self, session: &Uuid) -> Option<Arc<PatchSet>> {
        let sessions = self.sessions.lock();
        sessions
            .get(session)
            .and_then(|q| q.patches.front())
            .map(|p| p.set.clone())
    }

    /// Removes the front patch set if it ends at `to`.
    pub fn pop_acknowledged(&self, session: &Uuid, to: &Revision) -> Option<Arc<PatchSet>> {
        let mut sessions = self.sessions.lock();
        let queue = sessions.get_mut(session)?;
        if queue.patches.front().map(|p| &p.set.to) == Some(to) {
            queue.patches.pop_front().map(|p| p.set)
        } else {
            None
        }
    }

    /// Aligns a queue with the revision an agent reports after
    /// reconnecting: drops the already-applied prefix, or everything when no
    /// queued patch set starts at `reported`. Returns the number dropped.
    pub fn rebase(&self, session: &Uuid, reported: &Revision) -> usize {
        let mut sessions = self.sessions.lock();
        let Some(queue) = sessions.get_mut(session) else {
            return 0;
        };
        match queue.patches.iter().position(|p| &p.set.from == reported) {
            Some(start) => {
                queue.patches.drain(..start);
                start
            }
            None => {
                let dropped = queue.patches.len();
                queue.patches.clear();
                dropped
            }
        }
    }

    /// Empties a session queue, returning the number dropped.
    pub fn clear(&self, session: &Uuid) -> usize {
        let mut sessions = self.sessions.lock();
        sessions
            .get_mut(session)
            .map(|q| {
                let dropped = q.patches.len();
                q.patches.clear();
                dropped
            })
            .unwrap_or(0)
    }

    /// Number of queued patch sets for a session.
    pub fn len(&self, session: &Uuid) -> usize {
        self.sessions
            .lock()
            .get(session)
            .map(|q| q.patches.len())
            .unwrap_or(0)
    }

    /// True if the session has nothing queued.
    pub fn is_empty(&self, session: &Uuid) -> bool {
        self.len(session) == 0
    }

    /// True when the queue is longer than `max_len` or its oldest entry is
    /// older than `max_age`.
    pub fn is_backlogged(&self, session: &Uuid, max_len: usize, max_age: Duration) -> bool {
        let sessions = self.sessions.lock();
        let Some(queue) = sessions.get(session) else {
            return false;
        };
        queue.patches.len() > max_len
            || queue
                .patches
                .front()
                .is_some_and(|p| p.enqueued_at.elapsed() > max_age)
    }

    /// Evicts pooled patch sets that no queue references and that do not
    /// start at any live watermark. Returns the number evicted.
    pub fn collect_garbage(&self, live_watermarks: &HashSet<Revision>) -> usize {
        // Session queues hold their own Arc clones, so a strong count of
        // one means only the pool still refers to the patch set.
        let mut pool = self.pool.write();
        let before = pool.len();
        pool.retain(|(from, _), set| Arc::strong_count(set) > 1 || live_watermarks.contains(from));
        before - pool.len()
    }

    /// Current sizes.
    pub fn stats(&self) -> QueueStats {
        let pooled = self.pool.read().len();
        let sessions = self.sessions.lock();
        QueueStats {
            pooled,
            sessions: sessions.len(),
            queued: sessions.values().map(|q| q.patches.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_protocol::TreeDigest;

    fn set(from: &str, to: &str) -> PatchSet {
        PatchSet::new(from.into(), to.into(), Vec::new(), TreeDigest::empty())
    }

    #[test]
    fn enqueue_enforces_chain() {
        let queue = PatchQueue::new();
        let session = Uuid::new_v4();
        queue.register(session);

        queue.enqueue(&session, queue.share(set("a", "b"))).unwrap();
        queue.enqueue(&session, queue.share(set("b", "c"))).unwrap();
        let err = queue.enqueue(&session, queue.share(set("a", "c"))).unwrap_err();
        assert_eq!(
            err,
            QueueError::OutOfOrder {
                expected: "c".into(),
                actual: "a".into()
            }
        );
        assert_eq!(queue.tail(&session), Some("c".into()));
        assert_eq!(queue.len(&session), 2);
    }

    #[test]
    fn unknown_session() {
        let queue = PatchQueue::new();
        let session = Uuid::new_v4();
        assert_eq!(
            queue.enqueue(&session, Arc::new(set("a", "b"))),
            Err(QueueError::UnknownSession(session))
        );
    }

    #[test]
    fn front_and_pop_in_order() {
        let queue = PatchQueue::new();
        let session = Uuid::new_v4();
        queue.register(session);
        queue.enqueue(&session, Arc::new(set("a", "b"))).unwrap();
        queue.enqueue(&session, Arc::new(set("b", "c"))).unwrap();

        assert_eq!(queue.front(&session).unwrap().to, Revision::from("b"));
        assert!(queue.pop_acknowledged(&session, &"c".into()).is_none());
        assert!(queue.pop_acknowledged(&session, &"b".into()).is_some());
        assert_eq!(queue.front(&session).unwrap().from, Revision::from("b"));
    }

    #[test]
    fn rebase_drops_applied_prefix() {
        let queue = PatchQueue::new();
        let session = Uuid::new_v4();
        queue.register(session);
        for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
            queue.enqueue(&session, Arc::new(set(from, to))).unwrap();
        }
        assert_eq!(queue.rebase(&session, &"b".into()), 1);
        assert_eq!(queue.front(&session).unwrap().from, Revision::from("b"));

        assert_eq!(queue.rebase(&session, &"zzz".into()), 2);
        assert!(queue.is_empty(&session));
    }

    #[test]
    fn pool_shares_instances() {
        let queue = PatchQueue::new();
        let first = queue.share(set("a", "b"));
        let second = queue.share(set("a", "b"));
        assert!(Arc::ptr_eq(&first, &second));

        let mut computed = 0;
        let third = queue
            .get_or_compute::<(), _>(&"a".into(), &"b".into(), || {
                computed += 1;
                Ok(set("a", "b"))
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(computed, 0);
    }

    #[test]
    fn garbage_collection_keeps_referenced_sets() {
        let queue = PatchQueue::new();
        let session = Uuid::new_v4();
        queue.register(session);

        queue.enqueue(&session, queue.share(set("a", "b"))).unwrap();
        drop(queue.share(set("x", "y")));
        drop(queue.share(set("w", "z")));

        let live: HashSet<Revision> = ["w".into()].into_iter().collect();
        assert_eq!(queue.collect_garbage(&live), 1);
        assert!(queue.pooled(&"a".into(), &"b".into()).is_some());
        assert!(queue.pooled(&"w".into(), &"z".into()).is_some());
        assert!(queue.pooled(&"x".into(), &"y".into()).is_none());

        queue.pop_acknowledged(&session, &"b".into());
        assert_eq!(queue.collect_garbage(&HashSet::new()), 2);
        assert_eq!(queue.stats().pooled, 0);
    }

    #[test]
    fn backlog_by_length_and_age() {
        let queue = PatchQueue::new();
        let session = Uuid::new_v4();
        queue.register(session);
        queue.enqueue(&session, Arc::new(set("a", "b"))).unwrap();
        queue.enqueue(&session, Arc::new(set("b", "c"))).unwrap();

        assert!(queue.is_backlogged(&session, 1, Duration::from_secs(60)));
        assert!(!queue.is_backlogged(&session, 5, Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.is_backlogged(&session, 5, Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn enqueue_wakes_sender() {
        let queue = Arc::new(PatchQueue::new());
        let session = Uuid::new_v4();
        let notify = queue.register(session);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.enqueue(&session, Arc::new(set("a", "b"))).unwrap();
            })
        };
        tokio::time::timeout(Duration::from_secs(5), notify.notified())
            .await
            .unwrap();
        assert_eq!(queue.len(&session), 1);
        producer.await.unwrap();
    }
}
