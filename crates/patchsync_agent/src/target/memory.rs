//! In-memory target tree for tests.

use super::TargetFs;
use parking_lot::RwLock;
use patchsync_protocol::validate_path;
use std::collections::{BTreeMap, HashSet};
use std::io;

/// An in-memory tree.
///
/// Mirrors the file/directory conflicts of a real filesystem (a path cannot
/// be both a file and a directory) and can be told to fail operations on
/// chosen paths.
///
/// # Example
///
/// ```rust
/// use patchsync_agent::{MemoryTarget, TargetFs};
///
/// let target = MemoryTarget::new();
/// target.write("docs/index.md", b"# Hello").unwrap();
/// target.fail_on("docs/index.md");
/// assert!(target.write("docs/index.md", b"# Bye").is_err());
/// ```
#[derive(Debug, Default)]
pub struct MemoryTarget {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    faults: RwLock<HashSet<String>>,
}

impl MemoryTarget {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tree holding `files`.
    pub fn with_files<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let target = Self::new();
        {
            let mut map = target.files.write();
            for (path, content) in files {
                map.insert(path.to_string(), content.to_vec());
            }
        }
        target
    }

    /// Copy of every file.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.files.read().clone()
    }

    /// Writes a file behind the applier's back, ignoring faults.
    pub fn insert(&self, path: &str, content: &[u8]) {
        self.files.write().insert(path.to_string(), content.to_vec());
    }

    /// Makes every operation touching `path` fail with `PermissionDenied`.
    pub fn fail_on(&self, path: &str) {
        self.faults.write().insert(path.to_string());
    }

    /// Clears every injected fault.
    pub fn heal(&self) {
        self.faults.write().clear();
    }

    fn check(&self, path: &str) -> io::Result<()> {
        if validate_path(path).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to touch {path:?}"),
            ));
        }
        if self.faults.read().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("injected fault on {path}"),
            ));
        }
        Ok(())
    }
}

fn conflicts(files: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
    let as_dir = format!("{path}/");
    let under = files
        .range(as_dir.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&as_dir));
    under || super::ancestors(path).any(|parent| files.contains_key(parent))
}

impl TargetFs for MemoryTarget {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        self.check(path)?;
        Ok(self.files.read().get(path).cloned())
    }

    fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        self.check(path)?;
        let mut files = self.files.write();
        if conflicts(&files, path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} conflicts with an existing file or directory"),
            ));
        }
        files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<bool> {
        self.check(path)?;
        Ok(self.files.write().remove(path).is_some())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.check(from)?;
        self.check(to)?;
        let mut files = self.files.write();
        let content = files
            .remove(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{from} not found")))?;
        if conflicts(&files, to) {
            files.insert(from.to_string(), content);
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{to} conflicts with an existing file or directory"),
            ));
        }
        files.insert(to.to_string(), content);
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }
}
