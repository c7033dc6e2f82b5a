//! Applies patch sets to a target tree.
//!
//! A single failed path never aborts the patch set: the remaining
//! operations still run and the failure is reported in the `Ack`. The
//! agent's revision advances only when every path succeeded and the
//! resulting tree digest equals the digest the synchronizer attached;
//! otherwise it stays where it was and the synchronizer re-diffs from
//! there.

use crate::error::{AgentError, AgentResult, ApplyError};
use crate::state::{AgentState, StateStore};
use crate::target::TargetFs;
use patchsync_protocol::{
    Ack, ChangeKind, ContentHash, Hello, PatchOp, PatchSet, PathOutcome, Payload, Revision,
    SyncMode, TreeDigest,
};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Last cleanly applied patch set, replayed when the same set arrives again.
#[derive(Debug, Clone)]
struct LastApply {
    from: Revision,
    to: Revision,
    ack: Ack,
}

/// Applies patch sets and tracks the agent's current revision.
///
/// # Example
///
/// ```rust
/// use patchsync_agent::{MemoryTarget, RemoteApplier};
/// use patchsync_protocol::{PatchOp, PatchSet, PathChange, Revision, TreeDigest, ContentHash};
///
/// let mut applier = RemoteApplier::new(MemoryTarget::new());
/// let op = PatchOp::from_change(0, PathChange::added("index.html", &b"hi"[..]));
/// let digest = TreeDigest::from_entries([("index.html", &ContentHash::of(b"hi"))]);
/// let set = PatchSet::new(Revision::empty_tree(), "r1".into(), vec![op], digest);
///
/// let ack = applier.apply(&set).unwrap();
/// assert!(ack.is_clean());
/// assert_eq!(applier.current_revision(), Some(&"r1".into()));
/// ```
pub struct RemoteApplier<T: TargetFs> {
    target: T,
    state: AgentState,
    store: Option<StateStore>,
    last: Option<LastApply>,
}

impl<T: TargetFs> RemoteApplier<T> {
    /// Creates an applier whose state lives only in memory.
    pub fn new(target: T) -> Self {
        Self {
            target,
            state: AgentState::default(),
            store: None,
            last: None,
        }
    }

    /// Creates an applier that loads and persists its state in `store`.
    pub fn with_store(target: T, store: StateStore) -> AgentResult<Self> {
        let state = store.load()?;
        if let Some(revision) = &state.current_revision {
            debug!(revision = %revision.short(), "loaded agent state");
        }
        Ok(Self {
            target,
            state,
            store: Some(store),
            last: None,
        })
    }

    /// The target tree.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Current state.
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Revision the tree was last brought to.
    pub fn current_revision(&self) -> Option<&Revision> {
        self.state.current_revision.as_ref()
    }

    /// Records the agent id, persisting it if it changed.
    pub fn set_agent_id(&mut self, agent_id: Uuid) -> AgentResult<()> {
        if self.state.agent_id == Some(agent_id) {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.agent_id = Some(agent_id);
        self.commit(next)
    }

    /// Scans the tree and checks it against the digest recorded with the
    /// current revision.
    pub fn verify(&self) -> AgentResult<TreeDigest> {
        let actual = self.target.digest()?;
        match self.state.tree_digest {
            Some(expected) if expected != actual => Err(AgentError::Drift { expected, actual }),
            _ => Ok(actual),
        }
    }

    /// Builds the handshake: the current revision and the actual digest.
    ///
    /// Local drift is logged but still reported, so the synchronizer sees
    /// the mismatch and schedules a full resync.
    pub fn hello(&self, agent_id: Uuid) -> AgentResult<Hello> {
        let digest = match self.verify() {
            Ok(digest) => digest,
            Err(AgentError::Drift { expected, actual }) => {
                warn!(%expected, %actual, "local tree changed since last sync");
                actual
            }
            Err(err) => return Err(err),
        };
        Ok(Hello::new(agent_id, self.state.current_revision.clone(), digest))
    }

    /// Applies `set` and returns the acknowledgment to send back.
    ///
    /// Errors are reserved for a malformed set or a failure to scan the tree
    /// or save state; per-path failures are part of the `Ack`.
    pub fn apply(&mut self, set: &PatchSet) -> AgentResult<Ack> {
        set.validate()?;
        if let Some(ack) = self.replay(set)? {
            debug!(from = %set.from.short(), to = %set.to.short(), "patch set already applied");
            return Ok(ack);
        }
        if set.mode == SyncMode::Incremental && self.current_revision() != Some(&set.from) {
            warn!(
                from = %set.from.short(),
                current = ?self.current_revision().map(Revision::short),
                "incremental patch set does not start at the current revision"
            );
        }

        let started = Instant::now();
        let mut results = BTreeMap::new();
        if set.mode == SyncMode::Full {
            self.prune(set, &mut results)?;
        }
        for op in &set.ops {
            let outcome = match self.apply_op(op) {
                Ok(true) => PathOutcome::Applied,
                Ok(false) => PathOutcome::Unchanged,
                Err(err) if err.is_divergence() => {
                    warn!(path = %op.path, error = %err, "local content diverged from patch base");
                    PathOutcome::Diverged {
                        reason: err.to_string(),
                    }
                }
                Err(err) => {
                    warn!(path = %op.path, kind = op.kind.label(), error = %err, "operation failed");
                    PathOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            results.insert(op.path.clone(), outcome);
        }

        let actual = self.target.digest()?;
        let failed = results.values().filter(|o| !o.is_success()).count();
        if failed == 0 && actual == set.expected_digest {
            let next = self.state.advanced(set.to.clone(), actual);
            self.commit(next)?;
            info!(
                from = %set.from.short(),
                to = %set.to.short(),
                ops = set.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "patch set applied"
            );
        } else if failed > 0 {
            warn!(to = %set.to.short(), failed, "patch set partially applied");
        } else {
            warn!(
                to = %set.to.short(),
                expected = %set.expected_digest,
                %actual,
                "tree digest differs after apply"
            );
        }

        let ack = Ack {
            to: set.to.clone(),
            results,
            actual_digest: actual,
            current_revision: self.state.current_revision.clone(),
        };
        self.last = (ack.is_clean() && ack.current_revision.as_ref() == Some(&set.to)).then(|| {
            LastApply {
                from: set.from.clone(),
                to: set.to.clone(),
                ack: ack.clone(),
            }
        });
        Ok(ack)
    }

    fn replay(&self, set: &PatchSet) -> AgentResult<Option<Ack>> {
        let Some(last) = &self.last else {
            return Ok(None);
        };
        if last.from != set.from || last.to != set.to || self.current_revision() != Some(&set.to) {
            return Ok(None);
        }
        let unchanged = self.target.digest()? == last.ack.actual_digest;
        Ok(unchanged.then(|| last.ack.clone()))
    }

    /// Removes every file a full patch set does not name.
    fn prune(&self, set: &PatchSet, results: &mut BTreeMap<String, PathOutcome>) -> AgentResult<()> {
        let named: HashSet<&str> = set.ops.iter().map(|op| op.path.as_str()).collect();
        let mut pruned = 0usize;
        for path in self.target.list()? {
            if named.contains(path.as_str()) {
                continue;
            }
            let outcome = match self.target.remove(&path) {
                Ok(_) => {
                    pruned += 1;
                    PathOutcome::Applied
                }
                Err(err) => {
                    warn!(%path, error = %err, "failed to remove stale file");
                    PathOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            results.insert(path, outcome);
        }
        if pruned > 0 {
            debug!(pruned, "removed files outside the full patch set");
        }
        Ok(())
    }

    /// Applies one operation, returning whether anything changed.
    fn apply_op(&self, op: &PatchOp) -> Result<bool, ApplyError> {
        match &op.kind {
            ChangeKind::Deleted => Ok(self.target.remove(&op.path)?),
            ChangeKind::Added | ChangeKind::Modified => {
                let checksum = expected_checksum(op)?;
                let existing = self.target.read(&op.path)?;
                if existing.as_deref().map(ContentHash::of) == Some(checksum) {
                    return Ok(false);
                }
                let content = match &op.payload {
                    Payload::Full(bytes) => bytes.to_vec(),
                    Payload::Delta(delta) => {
                        let base = existing.ok_or(ApplyError::BaseMismatch {
                            expected: delta.base,
                            actual: None,
                        })?;
                        let actual = ContentHash::of(&base);
                        if actual != delta.base {
                            return Err(ApplyError::BaseMismatch {
                                expected: delta.base,
                                actual: Some(actual),
                            });
                        }
                        delta.apply(&base)?
                    }
                    Payload::None => {
                        return Err(ApplyError::InvalidOp(format!("{} without content", op.path)))
                    }
                };
                check_content(&content, checksum)?;
                self.target.write(&op.path, &content)?;
                Ok(true)
            }
            ChangeKind::Renamed { from } => {
                let checksum = expected_checksum(op)?;
                let Payload::Full(content) = &op.payload else {
                    return Err(ApplyError::InvalidOp(format!(
                        "rename to {} without full content",
                        op.path
                    )));
                };
                check_content(content, checksum)?;
                if from == &op.path {
                    return Err(ApplyError::InvalidPath(op.path.clone()));
                }

                let source = self.target.read(from)?;
                if source.as_deref().map(ContentHash::of) == Some(checksum) {
                    self.target.rename(from, &op.path)?;
                    return Ok(true);
                }
                let mut changed = false;
                let dest = self.target.read(&op.path)?;
                if dest.as_deref().map(ContentHash::of) != Some(checksum) {
                    self.target.write(&op.path, content)?;
                    changed = true;
                }
                if source.is_some() {
                    self.target.remove(from)?;
                    changed = true;
                }
                Ok(changed)
            }
        }
    }

    fn commit(&mut self, next: AgentState) -> AgentResult<()> {
        if let Some(store) = &self.store {
            store.save(&next)?;
        }
        self.state = next;
        Ok(())
    }
}

fn expected_checksum(op: &PatchOp) -> Result<ContentHash, ApplyError> {
    op.checksum
        .ok_or_else(|| ApplyError::InvalidOp(format!("{} without checksum", op.path)))
}

fn check_content(content: &[u8], expected: ContentHash) -> Result<(), ApplyError> {
    let actual = ContentHash::of(content);
    if actual != expected {
        return Err(ApplyError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}
