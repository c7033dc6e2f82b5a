//! Turns changed-path listings into ordered patch sets.

use crate::config::DiffOptions;
use crate::history::{DigestCache, HistoryResult, RevisionReader};
use patchsync_protocol::{
    ChangeKind, ContentHash, Delta, PatchOp, PatchSet, PathChange, Payload, Revision, TreeDigest,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Computes patch sets between revisions.
///
/// The engine holds no state besides the reader and a digest cache, so a
/// single instance is shared by every session. Calls block on history I/O.
#[derive(Clone)]
pub struct DiffEngine {
    reader: Arc<dyn RevisionReader>,
    digests: Arc<DigestCache>,
    options: DiffOptions,
}

impl DiffEngine {
    /// Creates an engine over `reader`.
    pub fn new(reader: Arc<dyn RevisionReader>, options: DiffOptions) -> Self {
        Self {
            reader,
            digests: Arc::new(DigestCache::new()),
            options,
        }
    }

    /// The underlying history.
    pub fn reader(&self) -> &Arc<dyn RevisionReader> {
        &self.reader
    }

    /// Options in effect.
    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Digest of the tree at `revision`, memoized.
    pub fn digest(&self, revision: &Revision) -> HistoryResult<TreeDigest> {
        self.digests.get(self.reader.as_ref(), revision)
    }

    /// Computes the patch set taking a tree at `from` to `to`.
    ///
    /// `from` may be the empty tree, yielding a full patch set.
    pub fn diff(&self, from: &Revision, to: &Revision) -> HistoryResult<PatchSet> {
        let started = Instant::now();
        let changes = self.reader.changes_between(from, to)?;
        let expected_digest = self.digest(to)?;
        let ordered = order_changes(changes, self.options.coalesce_renames);

        let mut ops = Vec::with_capacity(ordered.len());
        let mut deltas = 0usize;
        for (index, change) in ordered.into_iter().enumerate() {
            let mut op = PatchOp::from_change(index as u32, change);
            if let Some(delta) = self.try_delta(from, &op)? {
                op.payload = Payload::Delta(delta);
                deltas += 1;
            }
            ops.push(op);
        }

        let set = PatchSet::new(from.clone(), to.clone(), ops, expected_digest);
        debug!(
            from = %from.short(),
            to = %to.short(),
            ops = set.len(),
            deltas,
            bytes = set.payload_size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "computed patch set"
        );
        Ok(set)
    }

    /// Computes a full resync patch set for `to`.
    pub fn full(&self, to: &Revision) -> HistoryResult<PatchSet> {
        self.diff(&Revision::empty_tree(), to)
    }

    fn try_delta(&self, from: &Revision, op: &PatchOp) -> HistoryResult<Option<Delta>> {
        let content = match (&op.kind, &op.payload) {
            (ChangeKind::Modified, Payload::Full(content)) => content,
            _ => return Ok(None),
        };
        if from.is_empty_tree() || content.len() < self.options.delta_threshold {
            return Ok(None);
        }
        let base = self.reader.content_at(from, &op.path)?;
        let deadline = Instant::now() + self.options.delta_deadline;
        let delta = Delta::compute(&base, content, Some(deadline));
        let limit = content.len() as f64 * self.options.max_delta_ratio;
        Ok(((delta.encoded_len() as f64) < limit).then_some(delta))
    }
}

/// Orders changes for application and optionally coalesces renames.
///
/// Order: plain deletions (deepest first), renames, modifications, then
/// additions (shallowest first). Within a group paths sort
/// lexicographically. A deletion and an addition of byte-identical
/// content become one rename, unless the new path sits below or above
/// any deleted path (a file turning into a directory or back).
pub fn order_changes(changes: Vec<PathChange>, coalesce_renames: bool) -> Vec<PathChange> {
    let mut deletes = Vec::new();
    let mut adds = Vec::new();
    let mut modifies = Vec::new();
    let mut renames = Vec::new();
    for change in changes {
        match change.kind {
            ChangeKind::Deleted => deletes.push(change),
            ChangeKind::Added => adds.push(change),
            ChangeKind::Modified => modifies.push(change),
            ChangeKind::Renamed { .. } => renames.push(change),
        }
    }

    if coalesce_renames && !deletes.is_empty() && !adds.is_empty() {
        let deleted_paths: HashSet<String> = deletes.iter().map(|d| d.path.clone()).collect();
        let deleted_dirs: HashSet<String> = deletes
            .iter()
            .flat_map(|d| ancestors(&d.path).map(str::to_string))
            .collect();
        let mut by_hash: BTreeMap<ContentHash, VecDeque<String>> = BTreeMap::new();
        deletes.sort_by(|a, b| a.path.cmp(&b.path));
        for delete in &deletes {
            by_hash
                .entry(delete.checksum)
                .or_default()
                .push_back(delete.path.clone());
        }

        adds.sort_by(|a, b| a.path.cmp(&b.path));
        let mut consumed = HashSet::new();
        let mut remaining = Vec::with_capacity(adds.len());
        for add in adds {
            let blocked = deleted_dirs.contains(&add.path)
                || ancestors(&add.path).any(|dir| deleted_paths.contains(dir));
            let source = if blocked {
                None
            } else {
                by_hash.get_mut(&add.checksum).and_then(VecDeque::pop_front)
            };
            match (source, add.new_content) {
                (Some(from), Some(content)) => {
                    consumed.insert(from.clone());
                    renames.push(PathChange::renamed(from, add.path, content));
                }
                (_, new_content) => remaining.push(PathChange { new_content, ..add }),
            }
        }
        adds = remaining;
        deletes.retain(|d| !consumed.contains(&d.path));
    }

    deletes.sort_by(|a, b| depth(&b.path).cmp(&depth(&a.path)).then_with(|| a.path.cmp(&b.path)));
    renames.sort_by(|a, b| a.path.cmp(&b.path));
    modifies.sort_by(|a, b| a.path.cmp(&b.path));
    adds.sort_by(|a, b| depth(&a.path).cmp(&depth(&b.path)).then_with(|| a.path.cmp(&b.path)));

    let mut ordered = deletes;
    ordered.extend(renames);
    ordered.extend(modifies);
    ordered.extend(adds);
    ordered
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Proper ancestor directories of `path`, nearest last.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}
