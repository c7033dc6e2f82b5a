//! In-memory commit graph.

use super::{check_range, HistoryError, HistoryResult, RevisionReader};
use bytes::Bytes;
use parking_lot::RwLock;
use patchsync_protocol::{ContentHash, PathChange, Revision, TreeDigest};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// A full snapshot: path to content.
pub type Tree = BTreeMap<String, Bytes>;

struct Commit {
    parents: Vec<Revision>,
    tree: Tree,
}

#[derive(Default)]
struct Graph {
    commits: HashMap<Revision, Commit>,
    refs: HashMap<String, Revision>,
    sequence: u64,
}

impl Graph {
    fn lookup(&self, revision: &Revision) -> HistoryResult<&Commit> {
        self.commits
            .get(revision)
            .ok_or_else(|| HistoryError::UnknownRevision(revision.to_string()))
    }

    fn tree_of(&self, revision: &Revision) -> HistoryResult<Option<&Tree>> {
        if revision.is_empty_tree() {
            return Ok(None);
        }
        Ok(Some(&self.lookup(revision)?.tree))
    }
}

/// History held entirely in memory.
///
/// Commits store complete trees and may have several parents. Revision ids
/// are 40-character hex strings derived from the parents and content.
/// Used by tests and by embedders that generate trees themselves.
#[derive(Default)]
pub struct MemoryHistory {
    graph: RwLock<Graph>,
}

impl MemoryHistory {
    /// Creates an empty history with no references.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tree` as a new commit on `reference`, whose current head
    /// (if any) becomes the parent, and moves the reference.
    pub fn commit_tree(&self, reference: &str, tree: Tree) -> Revision {
        let mut graph = self.graph.write();
        let parents: Vec<Revision> = graph.refs.get(reference).cloned().into_iter().collect();
        let revision = Self::insert(&mut graph, parents, tree);
        graph.refs.insert(reference.to_string(), revision.clone());
        revision
    }

    /// Records a commit with explicit parents without moving any reference.
    pub fn commit_with_parents(&self, parents: Vec<Revision>, tree: Tree) -> HistoryResult<Revision> {
        let mut graph = self.graph.write();
        for parent in &parents {
            graph.lookup(parent)?;
        }
        Ok(Self::insert(&mut graph, parents, tree))
    }

    /// Applies `writes` (content, or `None` to delete) on top of the head of
    /// `reference` and commits the result there.
    pub fn commit_changes<'a, I>(&self, reference: &str, writes: I) -> Revision
    where
        I: IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
    {
        let mut tree = self.head_tree(reference).unwrap_or_default();
        for (path, content) in writes {
            match content {
                Some(bytes) => {
                    tree.insert(path.to_string(), Bytes::copy_from_slice(bytes));
                }
                None => {
                    tree.remove(path);
                }
            }
        }
        self.commit_tree(reference, tree)
    }

    /// Points `reference` at `revision` (for example to simulate a force push).
    pub fn set_ref(&self, reference: &str, revision: &Revision) -> HistoryResult<()> {
        let mut graph = self.graph.write();
        graph.lookup(revision)?;
        graph.refs.insert(reference.to_string(), revision.clone());
        Ok(())
    }

    /// The full tree at the head of `reference`.
    pub fn head_tree(&self, reference: &str) -> Option<Tree> {
        let graph = self.graph.read();
        let head = graph.refs.get(reference)?;
        graph.commits.get(head).map(|commit| commit.tree.clone())
    }

    /// The full tree at `revision`.
    pub fn tree_at(&self, revision: &Revision) -> HistoryResult<Tree> {
        let graph = self.graph.read();
        Ok(graph.tree_of(revision)?.cloned().unwrap_or_default())
    }

    fn insert(graph: &mut Graph, parents: Vec<Revision>, tree: Tree) -> Revision {
        graph.sequence += 1;
        let mut hasher = Sha256::new();
        hasher.update(graph.sequence.to_be_bytes());
        for parent in &parents {
            hasher.update(parent.as_str().as_bytes());
            hasher.update([0u8]);
        }
        let digest = digest_of(&tree);
        hasher.update(digest.to_hex().as_bytes());
        let id = hex::encode(hasher.finalize());
        let revision = Revision::new(&id[..40]);
        graph.commits.insert(revision.clone(), Commit { parents, tree });
        revision
    }
}

fn digest_of(tree: &Tree) -> TreeDigest {
    let hashes: Vec<(&str, ContentHash)> = tree
        .iter()
        .map(|(path, content)| (path.as_str(), ContentHash::of(content)))
        .collect();
    TreeDigest::from_entries(hashes.iter().map(|(path, hash)| (*path, hash)))
}

impl RevisionReader for MemoryHistory {
    fn resolve(&self, reference: &str) -> HistoryResult<Revision> {
        let graph = self.graph.read();
        if let Some(revision) = graph.refs.get(reference) {
            return Ok(revision.clone());
        }
        let revision = Revision::from(reference);
        if graph.commits.contains_key(&revision) {
            return Ok(revision);
        }
        Err(HistoryError::UnknownRevision(reference.to_string()))
    }

    fn contains(&self, revision: &Revision) -> HistoryResult<bool> {
        Ok(revision.is_empty_tree() || self.graph.read().commits.contains_key(revision))
    }

    fn is_reachable(&self, from: &Revision, to: &Revision) -> HistoryResult<bool> {
        let graph = self.graph.read();
        graph.lookup(to)?;
        if from.is_empty_tree() || from == to {
            return Ok(true);
        }
        graph.lookup(from)?;

        let mut seen = HashSet::new();
        let mut pending = VecDeque::from([to.clone()]);
        while let Some(current) = pending.pop_front() {
            if &current == from {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            pending.extend(graph.lookup(&current)?.parents.iter().cloned());
        }
        Ok(false)
    }

    fn changes_between(&self, from: &Revision, to: &Revision) -> HistoryResult<Vec<PathChange>> {
        check_range(self, from, to)?;
        let graph = self.graph.read();
        let empty = Tree::new();
        let old = graph.tree_of(from)?.unwrap_or(&empty);
        let new = graph.tree_of(to)?.unwrap_or(&empty);

        let mut changes = Vec::new();
        for (path, content) in old {
            if !new.contains_key(path) {
                changes.push(PathChange::deleted(path.clone(), ContentHash::of(content)));
            }
        }
        for (path, content) in new {
            match old.get(path) {
                None => changes.push(PathChange::added(path.clone(), content.clone())),
                Some(previous) if previous != content => {
                    changes.push(PathChange::modified(path.clone(), content.clone()))
                }
                Some(_) => {}
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn content_at(&self, revision: &Revision, path: &str) -> HistoryResult<Bytes> {
        let graph = self.graph.read();
        graph
            .tree_of(revision)?
            .and_then(|tree| tree.get(path))
            .cloned()
            .ok_or_else(|| HistoryError::NotFound {
                revision: revision.clone(),
                path: path.to_string(),
            })
    }

    fn tree(&self, revision: &Revision) -> HistoryResult<Vec<(String, ContentHash)>> {
        let graph = self.graph.read();
        Ok(graph
            .tree_of(revision)?
            .map(|tree| {
                tree.iter()
                    .map(|(path, content)| (path.clone(), ContentHash::of(content)))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_protocol::ChangeKind;

    fn linear() -> (MemoryHistory, Revision, Revision) {
        let history = MemoryHistory::new();
        let r1 = history.commit_changes(
            "main",
            [("src/a.txt", Some(&b"one"[..])), ("README", Some(&b"hi"[..]))],
        );
        let r2 = history.commit_changes(
            "main",
            [("src/a.txt", Some(&b"two"[..])), ("README", None), ("new.txt", Some(&b"n"[..]))],
        );
        (history, r1, r2)
    }

    #[test]
    fn resolve_and_contains() {
        let (history, _, r2) = linear();
        assert_eq!(history.resolve("main").unwrap(), r2);
        assert_eq!(history.resolve(r2.as_str()).unwrap(), r2);
        assert!(history.resolve("nope").is_err());
        assert!(history.contains(&Revision::empty_tree()).unwrap());
        assert!(!history.contains(&Revision::from("deadbeef")).unwrap());
        assert_eq!(r2.as_str().len(), 40);
    }

    #[test]
    fn reachability_follows_parents() {
        let (history, r1, r2) = linear();
        assert!(history.is_reachable(&r1, &r2).unwrap());
        assert!(!history.is_reachable(&r2, &r1).unwrap());
        assert!(history.is_reachable(&Revision::empty_tree(), &r1).unwrap());
        assert!(history.is_reachable(&r2, &r2).unwrap());
    }

    #[test]
    fn changes_are_sorted_and_classified() {
        let (history, r1, r2) = linear();
        let changes = history.changes_between(&r1, &r2).unwrap();
        let summary: Vec<_> = changes
            .iter()
            .map(|c| (c.path.as_str(), c.kind.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("README", ChangeKind::Deleted),
                ("new.txt", ChangeKind::Added),
                ("src/a.txt", ChangeKind::Modified),
            ]
        );
        assert_eq!(changes[0].checksum, ContentHash::of(b"hi"));
    }

    #[test]
    fn empty_tree_lists_everything_as_added() {
        let (history, r1, _) = linear();
        let changes = history.changes_between(&Revision::empty_tree(), &r1).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Added));
    }

    #[test]
    fn unreachable_and_unknown() {
        let (history, r1, r2) = linear();
        assert!(matches!(
            history.changes_between(&r2, &r1),
            Err(HistoryError::Unreachable { .. })
        ));
        assert!(matches!(
            history.changes_between(&Revision::from("zzz"), &r1),
            Err(HistoryError::UnknownRevision(_))
        ));
    }

    #[test]
    fn content_and_digest() {
        let (history, r1, r2) = linear();
        assert_eq!(&history.content_at(&r1, "README").unwrap()[..], b"hi");
        assert!(matches!(
            history.content_at(&r2, "README"),
            Err(HistoryError::NotFound { .. })
        ));
        let expected = digest_of(&history.tree_at(&r2).unwrap());
        assert_eq!(history.tree_digest(&r2).unwrap(), expected);
        assert_eq!(
            history.tree_digest(&Revision::empty_tree()).unwrap(),
            TreeDigest::empty()
        );
    }

    #[test]
    fn merge_commits_reach_both_parents() {
        let history = MemoryHistory::new();
        let base = history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        let left = history
            .commit_with_parents(vec![base.clone()], history.tree_at(&base).unwrap())
            .unwrap();
        let right = history.commit_changes("main", [("b", Some(&b"2"[..]))]);
        let merge = history
            .commit_with_parents(vec![left.clone(), right.clone()], history.tree_at(&right).unwrap())
            .unwrap();
        assert!(history.is_reachable(&left, &merge).unwrap());
        assert!(history.is_reachable(&base, &merge).unwrap());
        assert!(!history.is_reachable(&left, &right).unwrap());
    }
}
