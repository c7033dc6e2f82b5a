//! Git repository history, read through the `git` command line.

use super::{check_range, HistoryError, HistoryResult, RevisionReader};
use bytes::Bytes;
use parking_lot::Mutex;
use patchsync_protocol::{ContentHash, PathChange, Revision};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// A git repository read with `git rev-parse`, `merge-base`, `diff`,
/// `ls-tree` and `cat-file`. The working tree and index are never touched.
///
/// Content hashes of blobs are memoized by git object id, so repeated
/// digests of neighbouring revisions only read the blobs that changed.
pub struct GitHistory {
    repo: PathBuf,
    hashes: Mutex<HashMap<String, ContentHash>>,
}

struct TreeEntry {
    oid: String,
    path: String,
}

impl GitHistory {
    /// Opens the repository at `repo` (a work tree or a bare repository).
    pub fn open(repo: impl Into<PathBuf>) -> HistoryResult<Self> {
        let history = Self {
            repo: repo.into(),
            hashes: Mutex::new(HashMap::new()),
        };
        let output = history.git(&["rev-parse", "--git-dir"])?;
        if !output.status.success() {
            return Err(HistoryError::Backend(format!(
                "{} is not a git repository: {}",
                history.repo.display(),
                stderr(&output)
            )));
        }
        Ok(history)
    }

    /// Repository path.
    pub fn path(&self) -> &Path {
        &self.repo
    }

    fn git(&self, args: &[&str]) -> HistoryResult<Output> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(output)
    }

    fn git_ok(&self, args: &[&str]) -> HistoryResult<Vec<u8>> {
        let output = self.git(args)?;
        if !output.status.success() {
            return Err(HistoryError::Backend(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr(&output)
            )));
        }
        Ok(output.stdout)
    }

    fn ls_tree(&self, revision: &Revision) -> HistoryResult<Vec<TreeEntry>> {
        let stdout = self.git_ok(&["ls-tree", "-r", "-z", "--full-tree", revision.as_str()])?;
        let mut entries = Vec::new();
        for record in stdout.split(|b| *b == 0).filter(|r| !r.is_empty()) {
            let bad_record = || HistoryError::Backend(format!("bad ls-tree record: {}", record.escape_ascii()));
            // "<mode> <type> <oid>\t<path>"
            let tab = record.iter().position(|b| *b == b'\t').ok_or_else(bad_record)?;
            let meta = std::str::from_utf8(&record[..tab]).map_err(|_| bad_record())?;
            let mut fields = meta.split(' ');
            let (_mode, kind, oid) = match (fields.next(), fields.next(), fields.next()) {
                (Some(mode), Some(kind), Some(oid)) => (mode, kind, oid),
                _ => return Err(bad_record()),
            };
            if kind == "blob" {
                entries.push(TreeEntry {
                    oid: oid.to_string(),
                    path: utf8_path(&record[tab + 1..])?,
                });
            }
        }
        Ok(entries)
    }

    /// Reads several blobs with one `git cat-file --batch` process.
    fn read_blobs(&self, oids: &[&str]) -> HistoryResult<Vec<Bytes>> {
        if oids.is_empty() {
            return Ok(Vec::new());
        }
        let mut child = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HistoryError::Backend("cat-file stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HistoryError::Backend("cat-file stdout unavailable".into()))?;

        let request: String = oids.iter().map(|oid| format!("{oid}\n")).collect();
        let blobs = std::thread::scope(|scope| {
            let writer = scope.spawn(move || {
                let result = stdin.write_all(request.as_bytes());
                drop(stdin);
                result
            });
            let blobs = parse_batch(BufReader::new(stdout), oids.len());
            if blobs.is_err() {
                // Unblock the writer if git stopped reading.
                let _ = child.kill();
            }
            let written = writer
                .join()
                .map_err(|_| HistoryError::Backend("cat-file writer panicked".into()))?;
            written?;
            blobs
        })?;

        let status = child.wait()?;
        if !status.success() {
            return Err(HistoryError::Backend(format!("git cat-file exited with {status}")));
        }
        Ok(blobs)
    }

    fn hashes_for(&self, entries: &[TreeEntry]) -> HistoryResult<Vec<ContentHash>> {
        let missing: Vec<&str> = {
            let cache = self.hashes.lock();
            entries
                .iter()
                .map(|entry| entry.oid.as_str())
                .filter(|oid| !cache.contains_key(*oid))
                .collect()
        };
        let blobs = self.read_blobs(&missing)?;
        let mut cache = self.hashes.lock();
        for (oid, blob) in missing.iter().zip(blobs) {
            cache.insert(oid.to_string(), ContentHash::of(&blob));
        }
        entries
            .iter()
            .map(|entry| {
                cache
                    .get(&entry.oid)
                    .copied()
                    .ok_or_else(|| HistoryError::Backend(format!("blob {} not read", entry.oid)))
            })
            .collect()
    }
}

fn parse_batch<R: BufRead>(mut reader: R, count: usize) -> HistoryResult<Vec<Bytes>> {
    let mut blobs = Vec::with_capacity(count);
    let mut header = String::new();
    for _ in 0..count {
        header.clear();
        reader.read_line(&mut header)?;
        // "<oid> <type> <size>" or "<oid> missing"
        let mut fields = header.trim_end().split(' ');
        let oid = fields.next().unwrap_or_default().to_string();
        let size = match (fields.next(), fields.next()) {
            (Some(_), Some(size)) => size
                .parse::<usize>()
                .map_err(|_| HistoryError::Backend(format!("bad cat-file header: {header}")))?,
            _ => return Err(HistoryError::Backend(format!("object {oid} missing"))),
        };
        let mut content = vec![0u8; size];
        reader.read_exact(&mut content)?;
        let mut newline = [0u8; 1];
        reader.read_exact(&mut newline)?;
        blobs.push(Bytes::from(content));
    }
    Ok(blobs)
}

/// Paths travel as UTF-8 strings; anything else cannot be delivered.
fn utf8_path(bytes: &[u8]) -> HistoryResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| HistoryError::Backend(format!("path is not valid UTF-8: {}", bytes.escape_ascii())))
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

impl RevisionReader for GitHistory {
    fn resolve(&self, reference: &str) -> HistoryResult<Revision> {
        let spec = format!("{reference}^{{commit}}");
        let output = self.git(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Err(HistoryError::UnknownRevision(reference.to_string()));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Revision::new(id))
    }

    fn contains(&self, revision: &Revision) -> HistoryResult<bool> {
        if revision.is_empty_tree() {
            return Ok(true);
        }
        let spec = format!("{}^{{commit}}", revision.as_str());
        Ok(self.git(&["cat-file", "-e", &spec])?.status.success())
    }

    fn is_reachable(&self, from: &Revision, to: &Revision) -> HistoryResult<bool> {
        if !self.contains(to)? {
            return Err(HistoryError::UnknownRevision(to.to_string()));
        }
        if from.is_empty_tree() || from == to {
            return Ok(true);
        }
        let output = self.git(&["merge-base", "--is-ancestor", from.as_str(), to.as_str()])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(HistoryError::UnknownRevision(from.to_string())),
        }
    }

    fn changes_between(&self, from: &Revision, to: &Revision) -> HistoryResult<Vec<PathChange>> {
        check_range(self, from, to)?;

        let mut changes = Vec::new();
        if from.is_empty_tree() {
            let entries = self.ls_tree(to)?;
            let oids: Vec<&str> = entries.iter().map(|e| e.oid.as_str()).collect();
            for (entry, content) in entries.iter().zip(self.read_blobs(&oids)?) {
                changes.push(PathChange::added(entry.path.clone(), content));
            }
        } else {
            let stdout = self.git_ok(&[
                "diff",
                "--name-status",
                "-z",
                "--no-renames",
                "--no-ext-diff",
                // Gitlinks are not blobs; ls-tree skips them too.
                "--ignore-submodules",
                from.as_str(),
                to.as_str(),
            ])?;
            let mut fields = stdout.split(|b| *b == 0).filter(|f| !f.is_empty());
            while let Some(status) = fields.next() {
                let path = fields
                    .next()
                    .ok_or_else(|| HistoryError::Backend("truncated diff output".into()))
                    .and_then(utf8_path)?;
                match status.first() {
                    Some(b'A') => changes.push(PathChange::added(path.clone(), self.content_at(to, &path)?)),
                    Some(b'M') | Some(b'T') => {
                        changes.push(PathChange::modified(path.clone(), self.content_at(to, &path)?))
                    }
                    Some(b'D') => {
                        let old = self.content_at(from, &path)?;
                        changes.push(PathChange::deleted(path, ContentHash::of(&old)));
                    }
                    _ => {
                        return Err(HistoryError::Backend(format!(
                            "unsupported diff status {} for {path}",
                            String::from_utf8_lossy(status)
                        )))
                    }
                }
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn content_at(&self, revision: &Revision, path: &str) -> HistoryResult<Bytes> {
        let not_found = || HistoryError::NotFound {
            revision: revision.clone(),
            path: path.to_string(),
        };
        if revision.is_empty_tree() {
            return Err(not_found());
        }
        let spec = format!("{}:{}", revision.as_str(), path);
        let output = self.git(&["cat-file", "blob", &spec])?;
        if !output.status.success() {
            if !self.contains(revision)? {
                return Err(HistoryError::UnknownRevision(revision.to_string()));
            }
            return Err(not_found());
        }
        Ok(Bytes::from(output.stdout))
    }

    fn tree(&self, revision: &Revision) -> HistoryResult<Vec<(String, ContentHash)>> {
        if revision.is_empty_tree() {
            return Ok(Vec::new());
        }
        let entries = self.ls_tree(revision)?;
        let hashes = self.hashes_for(&entries)?;
        Ok(entries.into_iter().map(|e| e.path).zip(hashes).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_protocol::{ChangeKind, TreeDigest};
    use std::fs;
    use tempfile::TempDir;

    /// Returns None when no usable git binary is installed.
    fn init_repo() -> Option<TempDir> {
        let dir = TempDir::new().unwrap();
        let ok = Command::new("git")
            .args(["init", "-q", "-b", "main"])
            .arg(dir.path())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        ok.then_some(dir)
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    /// Commits the index as it is.
    fn commit_index(dir: &Path, message: &str) -> Revision {
        run(dir, &["commit", "-q", "--allow-empty", "-m", message]);
        GitHistory::open(dir).unwrap().resolve("HEAD").unwrap()
    }

    fn commit(dir: &Path, message: &str) -> Revision {
        run(dir, &["add", "-A"]);
        commit_index(dir, message)
    }

    #[test]
    fn reads_real_repository() {
        let Some(dir) = init_repo() else { return };
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/a.txt"), "one\n").unwrap();
        fs::write(root.join("README"), "hello\n").unwrap();
        let r1 = commit(root, "first");

        fs::write(root.join("src/a.txt"), "two\n").unwrap();
        fs::remove_file(root.join("README")).unwrap();
        fs::write(root.join("bin.dat"), [0u8, 159, 146, 150]).unwrap();
        let r2 = commit(root, "second");

        let history = GitHistory::open(root).unwrap();
        assert_eq!(history.resolve("main").unwrap(), r2);
        assert!(history.is_reachable(&r1, &r2).unwrap());
        assert!(!history.is_reachable(&r2, &r1).unwrap());

        let changes = history.changes_between(&r1, &r2).unwrap();
        let kinds: Vec<_> = changes.iter().map(|c| (c.path.as_str(), c.kind.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                ("README", ChangeKind::Deleted),
                ("bin.dat", ChangeKind::Added),
                ("src/a.txt", ChangeKind::Modified),
            ]
        );
        assert_eq!(changes[0].checksum, ContentHash::of(b"hello\n"));
        assert_eq!(&history.content_at(&r2, "bin.dat").unwrap()[..], &[0u8, 159, 146, 150]);
        assert!(matches!(
            history.content_at(&r2, "README"),
            Err(HistoryError::NotFound { .. })
        ));

        let full = history.changes_between(&Revision::empty_tree(), &r2).unwrap();
        assert_eq!(full.len(), 2);

        let expected = TreeDigest::from_entries([
            ("bin.dat", &ContentHash::of(&[0u8, 159, 146, 150])),
            ("src/a.txt", &ContentHash::of(b"two\n")),
        ]);
        assert_eq!(history.tree_digest(&r2).unwrap(), expected);
    }

    #[test]
    fn submodule_entries_are_skipped() {
        let Some(dir) = init_repo() else { return };
        let root = dir.path();
        fs::write(root.join("a.txt"), "a\n").unwrap();
        let r1 = commit(root, "first");

        // A gitlink without a checked out submodule.
        let gitlink = format!("160000,{},vendor/lib", r1.as_str());
        run(root, &["update-index", "--add", "--cacheinfo", &gitlink]);
        fs::write(root.join("b.txt"), "b\n").unwrap();
        run(root, &["add", "b.txt"]);
        let r2 = commit_index(root, "add submodule");

        let gitlink = format!("160000,{},vendor/lib", r2.as_str());
        run(root, &["update-index", "--cacheinfo", &gitlink]);
        let r3 = commit_index(root, "bump submodule");

        let history = GitHistory::open(root).unwrap();
        let changes = history.changes_between(&r1, &r2).unwrap();
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["b.txt"]);
        assert!(history.changes_between(&r2, &r3).unwrap().is_empty());

        let full = history.changes_between(&Revision::empty_tree(), &r3).unwrap();
        let paths: Vec<&str> = full.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
        assert_eq!(history.tree_digest(&r3).unwrap(), history.tree_digest(&r2).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let Some(dir) = init_repo() else { return };
        let root = dir.path();
        fs::write(root.join("ok.txt"), "ok\n").unwrap();
        let r1 = commit(root, "first");
        if fs::write(root.join(OsStr::from_bytes(b"caf\xe9.txt")), "latin-1\n").is_err() {
            return;
        }
        let r2 = commit(root, "second");

        let history = GitHistory::open(root).unwrap();
        for from in [r1, Revision::empty_tree()] {
            let err = history.changes_between(&from, &r2).unwrap_err();
            assert!(matches!(err, HistoryError::Backend(_)));
            assert!(err.to_string().contains("caf\\xe9.txt"), "{err}");
        }
    }

    #[test]
    fn unknown_reference() {
        let Some(dir) = init_repo() else { return };
        fs::write(dir.path().join("f"), "x").unwrap();
        commit(dir.path(), "only");
        let history = GitHistory::open(dir.path()).unwrap();
        assert!(matches!(
            history.resolve("no-such-branch"),
            Err(HistoryError::UnknownRevision(_))
        ));
        assert!(!history
            .contains(&Revision::from("0000000000000000000000000000000000000000"))
            .unwrap());
    }

    #[test]
    fn open_rejects_plain_directory() {
        if init_repo().is_none() {
            return;
        }
        let dir = TempDir::new().unwrap();
        assert!(GitHistory::open(dir.path()).is_err());
    }
}
