//! Read-only access to version-control history.
//!
//! The synchronizer never mutates history. Everything it needs is
//! expressed through [`RevisionReader`]: resolve a reference, test
//! reachability, list changed paths between two revisions and read blob
//! content. Two backends are provided, an in-memory commit graph and a
//! git repository read through the `git` command line.

mod git;
mod memory;

pub use git::GitHistory;
pub use memory::{MemoryHistory, Tree};

use bytes::Bytes;
use parking_lot::Mutex;
use patchsync_protocol::{ContentHash, PathChange, Revision, TreeDigest};
use std::collections::HashMap;
use std::io;
use thiserror::Error;

/// Result type for history reads.
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Errors raised while reading history.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// The revision or reference does not exist.
    #[error("unknown revision: {0}")]
    UnknownRevision(String),

    /// `to` does not descend from `from`.
    #[error("{to} is not reachable from {from}")]
    Unreachable {
        /// Base revision.
        from: Revision,
        /// Target revision.
        to: Revision,
    },

    /// The path does not exist at the revision.
    #[error("{path} not found at {revision}")]
    NotFound {
        /// Revision that was read.
        revision: Revision,
        /// Missing path.
        path: String,
    },

    /// The backend failed or returned something unparseable.
    #[error("history backend error: {0}")]
    Backend(String),

    /// I/O error talking to the backend.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl HistoryError {
    /// Returns true when the error concerns the requested revisions rather
    /// than the backend itself. Such errors are answered with a full resync
    /// instead of a retry.
    pub fn is_revision_error(&self) -> bool {
        matches!(
            self,
            HistoryError::UnknownRevision(_) | HistoryError::Unreachable { .. }
        )
    }
}

/// Read-only view over version-control history.
///
/// Implementations must be safe to call from several threads at once.
/// Calls may block on I/O; callers on an async runtime run them on a
/// blocking thread.
pub trait RevisionReader: Send + Sync {
    /// Resolves a reference (branch, tag or revision id) to a revision.
    fn resolve(&self, reference: &str) -> HistoryResult<Revision>;

    /// Returns true if `revision` exists. The empty tree always exists.
    fn contains(&self, revision: &Revision) -> HistoryResult<bool>;

    /// Returns true if `to` equals `from` or descends from it. Every
    /// revision is reachable from the empty tree.
    fn is_reachable(&self, from: &Revision, to: &Revision) -> HistoryResult<bool>;

    /// Lists the paths that differ between `from` and `to`, sorted by path.
    ///
    /// Only `Added`, `Modified` and `Deleted` are reported; rename
    /// detection happens in the diff engine. With `from` the empty tree,
    /// every path at `to` is reported as `Added`.
    fn changes_between(&self, from: &Revision, to: &Revision) -> HistoryResult<Vec<PathChange>>;

    /// Reads the content of `path` at `revision`.
    fn content_at(&self, revision: &Revision, path: &str) -> HistoryResult<Bytes>;

    /// Lists every file at `revision` with its content hash.
    fn tree(&self, revision: &Revision) -> HistoryResult<Vec<(String, ContentHash)>>;

    /// Digest of the whole tree at `revision`.
    fn tree_digest(&self, revision: &Revision) -> HistoryResult<TreeDigest> {
        let entries = self.tree(revision)?;
        Ok(TreeDigest::from_entries(
            entries.iter().map(|(path, hash)| (path.as_str(), hash)),
        ))
    }
}

/// Checks the common preconditions of `changes_between`.
pub(crate) fn check_range<R: RevisionReader + ?Sized>(
    reader: &R,
    from: &Revision,
    to: &Revision,
) -> HistoryResult<()> {
    for revision in [from, to] {
        if !reader.contains(revision)? {
            return Err(HistoryError::UnknownRevision(revision.to_string()));
        }
    }
    if !reader.is_reachable(from, to)? {
        return Err(HistoryError::Unreachable {
            from: from.clone(),
            to: to.clone(),
        });
    }
    Ok(())
}

/// Memoized tree digests.
///
/// History is immutable, so a revision's digest never changes once
/// computed.
#[derive(Default)]
pub struct DigestCache {
    digests: Mutex<HashMap<Revision, TreeDigest>>,
}

impl DigestCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the digest of `revision`, computing it on first use.
    ///
    /// The lock is not held while the reader runs.
    pub fn get<R: RevisionReader + ?Sized>(
        &self,
        reader: &R,
        revision: &Revision,
    ) -> HistoryResult<TreeDigest> {
        if revision.is_empty_tree() {
            return Ok(TreeDigest::empty());
        }
        if let Some(digest) = self.digests.lock().get(revision) {
            return Ok(*digest);
        }
        let digest = reader.tree_digest(revision)?;
        self.digests.lock().insert(revision.clone(), digest);
        Ok(digest)
    }

    /// Number of cached digests.
    pub fn len(&self) -> usize {
        self.digests.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.digests.lock().is_empty()
    }
}
