//! A target tree on the local filesystem.

use super::{ancestors, TargetFs, METADATA_DIR};
use patchsync_protocol::validate_path;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// A directory on disk.
///
/// Writes go to a temporary file under [`METADATA_DIR`] first and are then
/// renamed into place, so a reader never observes a half-written file.
#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    root: PathBuf,
}

impl DirectoryTarget {
    /// Opens `root`, creating it if missing.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let reserved = path == METADATA_DIR
            || path
                .strip_prefix(METADATA_DIR)
                .is_some_and(|rest| rest.starts_with('/'));
        if reserved || validate_path(path).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to touch {path:?}"),
            ));
        }
        Ok(self.root.join(path))
    }

    fn scratch_file(&self) -> io::Result<PathBuf> {
        let dir = self.root.join(METADATA_DIR).join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(dir.join(Uuid::new_v4().simple().to_string()))
    }

    /// Removes directories above `path` until one is not empty.
    fn prune_parents(&self, path: &str) {
        for parent in ancestors(path) {
            if fs::remove_dir(self.root.join(parent)).is_err() {
                break;
            }
        }
    }
}

impl TargetFs for DirectoryTarget {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let scratch = self.scratch_file()?;
        fs::write(&scratch, content)?;
        if let Err(err) = fs::rename(&scratch, &full) {
            let _ = fs::remove_file(&scratch);
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<bool> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => {
                self.prune_parents(path);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &dest)?;
        self.prune_parents(from);
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == METADATA_DIR));

        let mut paths = Vec::new();
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            let mut parts = Vec::new();
            for part in relative.components() {
                let part = part.as_os_str().to_str().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("non UTF-8 path {}", relative.display()),
                    )
                })?;
                parts.push(part);
            }
            paths.push(parts.join("/"));
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_creates_parents_and_reads_back() {
        let dir = tempdir().unwrap();
        let target = DirectoryTarget::open(dir.path()).unwrap();
        target.write("site/css/main.css", b"body{}").unwrap();
        assert_eq!(target.read("site/css/main.css").unwrap().unwrap(), b"body{}");
        assert_eq!(target.read("missing").unwrap(), None);
        assert_eq!(target.list().unwrap(), vec!["site/css/main.css"]);
    }

    #[test]
    fn remove_prunes_empty_directories() {
        let dir = tempdir().unwrap();
        let target = DirectoryTarget::open(dir.path()).unwrap();
        target.write("a/b/c.txt", b"1").unwrap();
        target.write("a/keep.txt", b"2").unwrap();

        assert!(target.remove("a/b/c.txt").unwrap());
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a").exists());
        assert!(!target.remove("a/b/c.txt").unwrap());
    }

    #[test]
    fn rename_moves_and_prunes() {
        let dir = tempdir().unwrap();
        let target = DirectoryTarget::open(dir.path()).unwrap();
        target.write("old/name.txt", b"x").unwrap();
        target.rename("old/name.txt", "new/dir/name.txt").unwrap();
        assert_eq!(target.list().unwrap(), vec!["new/dir/name.txt"]);
        assert!(!dir.path().join("old").exists());
    }

    #[test]
    fn metadata_is_hidden_and_protected() {
        let dir = tempdir().unwrap();
        let target = DirectoryTarget::open(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join(METADATA_DIR)).unwrap();
        fs::write(dir.path().join(METADATA_DIR).join("state.cbor"), b"s").unwrap();
        target.write("index.html", b"<html/>").unwrap();

        assert_eq!(target.list().unwrap(), vec!["index.html"]);
        assert!(target.write(".patchsync/state.cbor", b"x").is_err());
        assert!(target.write("../escape", b"x").is_err());
        assert!(target.read("/etc/passwd").is_err());
    }

    #[test]
    fn digest_ignores_empty_directories() {
        let dir = tempdir().unwrap();
        let target = DirectoryTarget::open(dir.path()).unwrap();
        target.write("a.txt", b"a").unwrap();
        let before = target.digest().unwrap();
        fs::create_dir_all(dir.path().join("empty/nested")).unwrap();
        assert_eq!(target.digest().unwrap(), before);
    }
}
