//! Content hashes and tree digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of a blob's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(#[serde(with = "hex::serde")] [u8; 32]);

impl ContentHash {
    /// Hashes `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

/// Digest of a whole tree.
///
/// Computed as SHA-256 over the path-sorted sequence of
/// `path || 0x00 || content-hash`. Two trees have the same digest exactly
/// when they contain the same paths with byte-identical content. Empty
/// directories do not contribute.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeDigest(#[serde(with = "hex::serde")] [u8; 32]);

impl TreeDigest {
    /// Computes the digest of a tree given its `(path, hash)` entries in any order.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a ContentHash)>,
    {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (path, hash) in entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Digest of the empty tree.
    pub fn empty() -> Self {
        Self::from_entries(std::iter::empty())
    }

    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TreeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeDigest({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256() {
        // sha256("abc")
        assert_eq!(
            ContentHash::of(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_ignores_entry_order() {
        let a = ContentHash::of(b"a");
        let b = ContentHash::of(b"b");
        let d1 = TreeDigest::from_entries([("x.txt", &a), ("y/z.txt", &b)]);
        let d2 = TreeDigest::from_entries([("y/z.txt", &b), ("x.txt", &a)]);
        assert_eq!(d1, d2);
    }

    #[test]
    fn digest_depends_on_paths_and_content() {
        let a = ContentHash::of(b"a");
        let b = ContentHash::of(b"b");
        let base = TreeDigest::from_entries([("x", &a)]);
        assert_ne!(base, TreeDigest::from_entries([("y", &a)]));
        assert_ne!(base, TreeDigest::from_entries([("x", &b)]));
        assert_ne!(base, TreeDigest::empty());
    }

    #[test]
    fn hex_serde_roundtrip() {
        let hash = ContentHash::of(b"payload");
        let mut buf = Vec::new();
        ciborium::into_writer(&hash, &mut buf).unwrap();
        let decoded: ContentHash = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(hash, decoded);
    }
}
