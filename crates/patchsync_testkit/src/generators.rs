//! Property-based test generators using proptest.
//!
//! Trees are generated as path to content maps that a real filesystem can
//! hold: no path is both a file and a directory.

use patchsync_protocol::{ContentHash, TreeDigest};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// A tree snapshot: path to content.
pub type Files = BTreeMap<String, Vec<u8>>;

/// Strategy for relative paths up to three segments deep over a small
/// alphabet, so generated trees collide often.
pub fn path_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[ab]{1,2}(/[ab]{1,2}){0,2}").expect("Invalid regex")
}

/// Strategy for file content, biased toward a few shared values so that
/// renames (identical content under a new path) occur.
pub fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 0..96),
        1 => Just(b"shared".to_vec()),
        1 => Just(Vec::new()),
    ]
}

/// Strategy for trees with up to `max_files` files.
pub fn tree_strategy(max_files: usize) -> impl Strategy<Value = Files> {
    prop::collection::vec((path_strategy(), content_strategy()), 0..=max_files)
        .prop_map(|entries| normalize(entries.into_iter().collect()))
}

/// Strategy for a pair of trees where the second is an edit of the first.
pub fn edit_strategy(max_files: usize) -> impl Strategy<Value = (Files, Files)> {
    (tree_strategy(max_files), tree_strategy(max_files / 2 + 1), any::<u64>()).prop_map(
        |(before, extra, seed)| {
            let mut after = before.clone();
            for (i, path) in before.keys().enumerate() {
                let roll = seed.rotate_left(i as u32) % 4;
                match roll {
                    0 => {
                        after.remove(path);
                    }
                    1 => {
                        if let Some(content) = after.get_mut(path) {
                            content.push(b'!');
                        }
                    }
                    _ => {}
                }
            }
            after.extend(extra);
            let after = normalize(after);
            (before, after)
        },
    )
}

/// Drops files that sit below another file, keeping the shallower one.
pub fn normalize(mut files: Files) -> Files {
    let conflicting: Vec<String> = files
        .keys()
        .filter(|path| {
            path.match_indices('/')
                .any(|(at, _)| files.contains_key(&path[..at]))
        })
        .cloned()
        .collect();
    for path in conflicting {
        files.remove(&path);
    }
    files
}

/// Digest of a snapshot.
pub fn digest_of(files: &Files) -> TreeDigest {
    let hashes: Vec<_> = files
        .iter()
        .map(|(path, content)| (path.as_str(), ContentHash::of(content)))
        .collect();
    TreeDigest::from_entries(hashes.iter().map(|(path, hash)| (*path, hash)))
}

/// Borrowed view of a snapshot for `MemoryHistory::commit_changes`.
///
/// Paths in `before` but not in `after` are deleted.
pub fn as_writes<'a>(before: &'a Files, after: &'a Files) -> Vec<(&'a str, Option<&'a [u8]>)> {
    let deletes = before
        .keys()
        .filter(|path| !after.contains_key(*path))
        .map(|path| (path.as_str(), None));
    let writes = after
        .iter()
        .map(|(path, content)| (path.as_str(), Some(content.as_slice())));
    deletes.chain(writes).collect()
}
