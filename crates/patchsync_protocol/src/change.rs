//! Path changes, patch operations and patch sets.

use crate::delta::Delta;
use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::{ContentHash, TreeDigest};
use crate::messages::{PatchSetEnd, SyncPlan};
use crate::revision::Revision;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What happened to a path between two revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Path did not exist before.
    Added,
    /// Path existed and its content changed.
    Modified,
    /// Path no longer exists.
    Deleted,
    /// Content moved here from another path.
    Renamed {
        /// Previous location.
        from: String,
    },
}

impl ChangeKind {
    /// Short label for logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed { .. } => "renamed",
        }
    }
}

/// One changed path as reported by history.
///
/// `new_content` is `None` exactly when `kind` is [`ChangeKind::Deleted`].
/// For deletions `checksum` is the hash of the removed content, otherwise
/// it is the hash of `new_content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Content after the change.
    pub new_content: Option<Bytes>,
    /// Content hash (see type docs).
    pub checksum: ContentHash,
}

impl PathChange {
    /// A newly added path.
    pub fn added(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            kind: ChangeKind::Added,
            checksum: ContentHash::of(&content),
            new_content: Some(content),
        }
    }

    /// A path whose content changed.
    pub fn modified(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
            checksum: ContentHash::of(&content),
            new_content: Some(content),
        }
    }

    /// A removed path, identified by the hash of the content it had.
    pub fn deleted(path: impl Into<String>, old_checksum: ContentHash) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            new_content: None,
            checksum: old_checksum,
        }
    }

    /// Content moved from `from` to `path`.
    pub fn renamed(
        from: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            kind: ChangeKind::Renamed { from: from.into() },
            checksum: ContentHash::of(&content),
            new_content: Some(content),
        }
    }

    /// Checks the content/kind invariant.
    pub fn validate(&self) -> ProtocolResult<()> {
        let is_delete = self.kind == ChangeKind::Deleted;
        if is_delete == self.new_content.is_some() {
            return Err(ProtocolError::invalid(format!(
                "{} change for {} must {}carry content",
                self.kind.label(),
                self.path,
                if is_delete { "not " } else { "" }
            )));
        }
        validate_path(&self.path)
    }
}

/// How a patch operation transmits its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// No content (deletions).
    None,
    /// Complete new content.
    Full(Bytes),
    /// Delta against the content the receiver should already hold.
    Delta(Delta),
}

impl Payload {
    /// Number of content bytes carried on the wire (approximate for deltas).
    pub fn wire_len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Full(bytes) => bytes.len(),
            Payload::Delta(delta) => delta.encoded_len(),
        }
    }
}

/// A single operation inside a [`PatchSet`], as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    /// Position inside the patch set, starting at 0.
    pub index: u32,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Target path.
    pub path: String,
    /// Content or delta.
    pub payload: Payload,
    /// Hash of the resulting content, `None` for deletions.
    pub checksum: Option<ContentHash>,
}

impl PatchOp {
    /// Builds an operation carrying full content for `change`.
    pub fn from_change(index: u32, change: PathChange) -> Self {
        let checksum = match change.kind {
            ChangeKind::Deleted => None,
            _ => Some(change.checksum),
        };
        let payload = match change.new_content {
            Some(content) => Payload::Full(content),
            None => Payload::None,
        };
        Self {
            index,
            kind: change.kind,
            path: change.path,
            payload,
            checksum,
        }
    }

    /// Checks the per-operation invariants.
    pub fn validate(&self) -> ProtocolResult<()> {
        validate_path(&self.path)?;
        let consistent = match (&self.kind, &self.payload, &self.checksum) {
            (ChangeKind::Deleted, Payload::None, None) => true,
            (ChangeKind::Deleted, _, _) => false,
            (_, Payload::None, _) | (_, _, None) => false,
            (ChangeKind::Added | ChangeKind::Renamed { .. }, Payload::Delta(_), _) => false,
            _ => true,
        };
        if !consistent {
            return Err(ProtocolError::invalid(format!(
                "{} operation for {} has inconsistent payload",
                self.kind.label(),
                self.path
            )));
        }
        if let ChangeKind::Renamed { from } = &self.kind {
            validate_path(from)?;
        }
        Ok(())
    }
}

/// Whether a patch set rebuilds the tree from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// From the empty tree; the receiver also removes files not named.
    Full,
    /// From the receiver's current revision.
    Incremental,
}

/// Ordered, self-contained description of every change between two revisions.
///
/// Applying `ops` in order to a tree exactly at `from` yields a tree exactly
/// at `to`, whose digest is `expected_digest`. Patch sets are immutable once
/// produced and shared between sessions behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    /// Full or incremental.
    pub mode: SyncMode,
    /// Base revision.
    pub from: Revision,
    /// Resulting revision.
    pub to: Revision,
    /// Operations in application order.
    pub ops: Vec<PatchOp>,
    /// Digest of the tree at `to`.
    pub expected_digest: TreeDigest,
}

impl PatchSet {
    /// Creates a patch set, deriving the mode from `from`.
    pub fn new(from: Revision, to: Revision, ops: Vec<PatchOp>, expected_digest: TreeDigest) -> Self {
        let mode = if from.is_empty_tree() {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        };
        Self {
            mode,
            from,
            to,
            ops,
            expected_digest,
        }
    }

    /// Pool key.
    pub fn key(&self) -> (Revision, Revision) {
        (self.from.clone(), self.to.clone())
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when the patch set carries no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Approximate payload bytes.
    pub fn payload_size(&self) -> usize {
        self.ops.iter().map(|op| op.payload.wire_len()).sum()
    }

    /// Operation count as sent in `SyncPlan`/`PatchSetEnd`.
    pub fn op_count(&self) -> u32 {
        u32::try_from(self.ops.len()).unwrap_or(u32::MAX)
    }

    /// The announcement preceding the operations.
    pub fn plan(&self) -> SyncPlan {
        SyncPlan {
            mode: self.mode,
            from: self.from.clone(),
            to: self.to.clone(),
            op_count: self.op_count(),
        }
    }

    /// The trailer following the operations.
    pub fn end(&self) -> PatchSetEnd {
        PatchSetEnd {
            to: self.to.clone(),
            expected_digest: self.expected_digest,
            op_count: self.op_count(),
        }
    }

    /// Checks index continuity, per-op invariants and that no path is
    /// touched twice.
    pub fn validate(&self) -> ProtocolResult<()> {
        let mut seen = HashSet::with_capacity(self.ops.len());
        for (expected, op) in self.ops.iter().enumerate() {
            if op.index as usize != expected {
                return Err(ProtocolError::OutOfOrder {
                    expected: expected as u32,
                    actual: op.index,
                });
            }
            op.validate()?;
            if !seen.insert(op.path.as_str()) {
                return Err(ProtocolError::invalid(format!(
                    "path {} appears twice",
                    op.path
                )));
            }
        }
        Ok(())
    }
}

/// Rejects absolute paths, empty components and parent traversal.
pub fn validate_path(path: &str) -> ProtocolResult<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(ProtocolError::invalid(format!("invalid path {path:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_change_invariant() {
        assert!(PathChange::added("a.txt", "x").validate().is_ok());
        assert!(PathChange::deleted("a.txt", ContentHash::of(b"x"))
            .validate()
            .is_ok());

        let mut broken = PathChange::added("a.txt", "x");
        broken.kind = ChangeKind::Deleted;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn rejects_escaping_paths() {
        for path in ["", "/etc/passwd", "../x", "a/../b", "a//b", "a\\b", "./a"] {
            assert!(
                PathChange::added(path, "x").validate().is_err(),
                "{path:?} accepted"
            );
        }
        assert!(PathChange::added("src/lib.rs", "x").validate().is_ok());
    }

    #[test]
    fn deleted_op_has_no_checksum() {
        let op = PatchOp::from_change(0, PathChange::deleted("gone", ContentHash::of(b"old")));
        assert_eq!(op.checksum, None);
        assert_eq!(op.payload, Payload::None);
        assert!(op.validate().is_ok());
    }

    #[test]
    fn patch_set_mode_and_validation() {
        let ops = vec![
            PatchOp::from_change(0, PathChange::added("a", "1")),
            PatchOp::from_change(1, PathChange::modified("b", "2")),
        ];
        let set = PatchSet::new(Revision::empty_tree(), "r1".into(), ops, TreeDigest::empty());
        assert_eq!(set.mode, SyncMode::Full);
        assert!(set.validate().is_ok());
        assert_eq!(set.plan().op_count, 2);
        assert_eq!(set.end().to, Revision::from("r1"));

        let mut gap = set.clone();
        gap.ops[1].index = 5;
        assert!(matches!(
            gap.validate(),
            Err(ProtocolError::OutOfOrder {
                expected: 1,
                actual: 5
            })
        ));

        let mut dup = set;
        dup.ops[1].path = "a".into();
        assert!(dup.validate().is_err());
    }
}
