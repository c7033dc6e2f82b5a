//! Digest command implementation.

use patchsync_agent::{DirectoryTarget, TargetFs};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Digest of a directory.
#[derive(Debug, Serialize)]
pub struct DigestResult {
    /// Directory scanned.
    pub path: String,
    /// Number of files.
    pub files: usize,
    /// Tree digest, hex.
    pub digest: String,
    /// Per-file content hashes (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<BTreeMap<String, String>>,
}

/// Scans `dir` the way an agent does.
pub fn scan(dir: &Path, list: bool) -> Result<DigestResult, Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()).into());
    }
    let target = DirectoryTarget::open(dir)?;
    let entries = target.entries()?;
    let digest = target.digest()?;
    Ok(DigestResult {
        path: dir.display().to_string(),
        files: entries.len(),
        digest: digest.to_hex(),
        entries: list.then(|| {
            entries
                .into_iter()
                .map(|(path, hash)| (path, hash.to_hex()))
                .collect()
        }),
    })
}

/// Runs the digest command.
pub fn run(dir: &Path, list: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = scan(dir, list)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            if let Some(entries) = &result.entries {
                for (path, hash) in entries {
                    println!("{hash}  {path}");
                }
                println!();
            }
            println!("{}  ({} files)", result.digest, result.files);
        }
    }
    Ok(())
}
