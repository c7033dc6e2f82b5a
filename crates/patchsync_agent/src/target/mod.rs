//! Target filesystem abstraction.
//!
//! The applier only ever touches the target tree through [`TargetFs`].
//! Paths are `/`-separated and relative to the tree root; implementations
//! refuse anything else.
//!
//! # Implementors
//!
//! - [`DirectoryTarget`] - a directory on the local filesystem
//! - [`MemoryTarget`] - an in-memory tree with fault injection, for tests

mod directory;
mod memory;

pub use directory::DirectoryTarget;
pub use memory::MemoryTarget;

use patchsync_protocol::{ContentHash, TreeDigest};
use std::collections::BTreeMap;
use std::io;

/// Name of the directory holding agent metadata inside a target tree.
///
/// It is never listed, never part of the tree digest and never written by
/// patch operations.
pub const METADATA_DIR: &str = ".patchsync";

/// Filesystem operations the applier needs.
///
/// # Invariants
///
/// - `write` creates missing parent directories
/// - `remove` of an absent file returns `Ok(false)`
/// - `remove` and `rename` prune directories they leave empty
/// - `list` returns every regular file, sorted, excluding [`METADATA_DIR`]
pub trait TargetFs: Send + Sync {
    /// Reads a file, `None` if it does not exist.
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replaces a file's content.
    fn write(&self, path: &str, content: &[u8]) -> io::Result<()>;

    /// Removes a file, returning whether it existed.
    fn remove(&self, path: &str) -> io::Result<bool>;

    /// Moves a file, replacing any file at `to`.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Lists every file.
    fn list(&self) -> io::Result<Vec<String>>;

    /// Content hash of every file.
    fn entries(&self) -> io::Result<BTreeMap<String, ContentHash>> {
        let mut entries = BTreeMap::new();
        for path in self.list()? {
            if let Some(content) = self.read(&path)? {
                entries.insert(path, ContentHash::of(&content));
            }
        }
        Ok(entries)
    }

    /// Digest of the whole tree.
    fn digest(&self) -> io::Result<TreeDigest> {
        let entries = self.entries()?;
        Ok(TreeDigest::from_entries(
            entries.iter().map(|(path, hash)| (path.as_str(), hash)),
        ))
    }
}

impl<T: TargetFs + ?Sized> TargetFs for std::sync::Arc<T> {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        (**self).read(path)
    }

    fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        (**self).write(path, content)
    }

    fn remove(&self, path: &str) -> io::Result<bool> {
        (**self).remove(path)
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        (**self).rename(from, to)
    }

    fn list(&self) -> io::Result<Vec<String>> {
        (**self).list()
    }
}

/// Parent directories of `path`, deepest first.
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .rev()
        .filter(|(_, c)| *c == '/')
        .map(move |(i, _)| &path[..i])
}
