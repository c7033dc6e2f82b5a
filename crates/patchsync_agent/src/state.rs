//! Persisted agent state.

use crate::error::{AgentError, AgentResult};
use patchsync_protocol::{Revision, TreeDigest};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// What the agent believes about its tree.
///
/// Only the applier mutates it, and only after a patch set applied with
/// zero failures and the expected digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Identity presented to the synchronizer.
    pub agent_id: Option<Uuid>,
    /// Revision the tree was last brought to, `None` before the first sync.
    pub current_revision: Option<Revision>,
    /// Tree digest recorded together with `current_revision`.
    pub tree_digest: Option<TreeDigest>,
    /// When the state last changed, Unix millis.
    pub updated_at_ms: u64,
    /// Patch sets applied over the agent's lifetime.
    pub applied_sets: u64,
}

impl AgentState {
    /// Returns the state after successfully applying up to `revision`.
    pub fn advanced(&self, revision: Revision, digest: TreeDigest) -> Self {
        Self {
            agent_id: self.agent_id,
            current_revision: Some(revision),
            tree_digest: Some(digest),
            updated_at_ms: now_ms(),
            applied_sets: self.applied_sets + 1,
        }
    }
}

/// Stores [`AgentState`] as CBOR in a directory.
///
/// Saves are atomic: the state is written to a temporary file, synced and
/// renamed over the previous one.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// File name inside the state directory.
    pub const FILE_NAME: &'static str = "state.cbor";

    /// Creates a store in `dir`. Nothing is touched until the first save.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(Self::FILE_NAME),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored state, or the default state if none was saved yet.
    pub fn load(&self) -> AgentResult<AgentState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(AgentState::default()),
            Err(err) => return Err(err.into()),
        };
        ciborium::from_reader(bytes.as_slice()).map_err(|err| {
            AgentError::State(format!("corrupt state file {}: {err}", self.path.display()))
        })
    }

    /// Saves `state`.
    pub fn save(&self, state: &AgentState) -> AgentResult<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(state, &mut bytes)
            .map_err(|err| AgentError::State(format!("failed to encode state: {err}")))?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("cbor.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
