//! Revision identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier naming a point in version-control history.
///
/// Revisions are ordered only through the history graph; the derived
/// `Ord` exists for deterministic map iteration and carries no meaning.
/// The empty string is reserved for the empty-tree sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Creates a revision from its identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The empty tree, the base of every full resync.
    pub fn empty_tree() -> Self {
        Self(String::new())
    }

    /// Returns true for the empty-tree sentinel.
    pub fn is_empty_tree(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an abbreviated form for logs.
    pub fn short(&self) -> &str {
        if self.is_empty_tree() {
            return "<empty>";
        }
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty_tree() {
            f.write_str("<empty-tree>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for Revision {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Revision {
    fn from(id: String) -> Self {
        Self(id)
    }
}
