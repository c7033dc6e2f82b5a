//! Configuration file handling.
//!
//! A single JSON file holds the synchronizer, watch and agent sections.
//! Every field is optional; missing fields take their defaults and command
//! line flags override whatever the file says.

use patchsync_agent::AgentConfig;
use patchsync_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file does not exist and `--init-config` was not given.
    #[error("config file {0} not found (pass --init-config to create it)")]
    Missing(PathBuf),

    /// The file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not valid configuration JSON.
    #[error("config file {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// What the synchronizer follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Git repository.
    pub repo: Option<PathBuf>,
    /// Reference to follow.
    pub reference: String,
    /// Oldest revision agents may be incrementally synced from.
    pub floor: Option<String>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            repo: None,
            reference: "main".into(),
            floor: None,
        }
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Synchronizer settings.
    pub server: ServerConfig,
    /// Watched reference.
    pub watch: WatchSection,
    /// Agent settings.
    pub agent: AgentConfig,
}

/// Loads `path`, or the defaults when no file was named.
///
/// With `init`, a missing file is first written with the defaults.
pub fn load(path: Option<&Path>, init: bool) -> Result<FileConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if !path.exists() {
        if !init {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let defaults = serde_json::to_string_pretty(&FileConfig::default()).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, defaults + "\n").map_err(io_err)?;
        warn!(path = %path.display(), "config file not found, wrote defaults");
    }

    let text = fs::read_to_string(path).map_err(io_err)?;
    let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}
