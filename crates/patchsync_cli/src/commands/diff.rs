//! Diff command implementation.
//!
//! Computes the patch set the synchronizer would send for a range without
//! serving it.

use patchsync_protocol::{ChangeKind, PatchSet, Payload};
use patchsync_server::{DiffEngine, DiffOptions, GitHistory, RevisionReader};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// One operation in the summary.
#[derive(Debug, Serialize)]
pub struct OpSummary {
    /// Position in the patch set.
    pub index: u32,
    /// Change label.
    pub kind: &'static str,
    /// Target path.
    pub path: String,
    /// Previous path for renames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// `full`, `delta` or `none`.
    pub payload: &'static str,
    /// Bytes carried.
    pub bytes: usize,
}

/// Summary of a patch set.
#[derive(Debug, Serialize)]
pub struct DiffResult {
    /// `Full` or `Incremental`.
    pub mode: String,
    /// Base revision.
    pub from: String,
    /// Target revision.
    pub to: String,
    /// Expected tree digest after applying.
    pub expected_digest: String,
    /// Total payload bytes.
    pub payload_bytes: usize,
    /// Operations in application order.
    pub ops: Vec<OpSummary>,
}

impl From<&PatchSet> for DiffResult {
    fn from(set: &PatchSet) -> Self {
        let ops = set
            .ops
            .iter()
            .map(|op| OpSummary {
                index: op.index,
                kind: op.kind.label(),
                path: op.path.clone(),
                from: match &op.kind {
                    ChangeKind::Renamed { from } => Some(from.clone()),
                    _ => None,
                },
                payload: match op.payload {
                    Payload::None => "none",
                    Payload::Full(_) => "full",
                    Payload::Delta(_) => "delta",
                },
                bytes: op.payload.wire_len(),
            })
            .collect();
        Self {
            mode: format!("{:?}", set.mode),
            from: set.from.to_string(),
            to: set.to.to_string(),
            expected_digest: set.expected_digest.to_hex(),
            payload_bytes: set.payload_size(),
            ops,
        }
    }
}

/// Builds the patch set from `from` (or the empty tree) to `to`.
pub fn compute(
    reader: Arc<dyn RevisionReader>,
    from: Option<&str>,
    to: &str,
) -> Result<PatchSet, Box<dyn std::error::Error>> {
    let to = reader.resolve(to)?;
    let engine = DiffEngine::new(reader.clone(), DiffOptions::default());
    let set = match from {
        Some(from) => engine.diff(&reader.resolve(from)?, &to)?,
        None => engine.full(&to)?,
    };
    Ok(set)
}

/// Runs the diff command.
pub fn run(
    repo: &Path,
    from: Option<&str>,
    to: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let history = Arc::new(GitHistory::open(repo)?);
    let set = compute(history, from, to)?;
    let result = DiffResult::from(&set);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("{} {}..{}", result.mode, set.from.short(), set.to.short());
            for op in &result.ops {
                match &op.from {
                    Some(from) => println!("{:>4} {:<8} {} -> {}", op.index, op.kind, from, op.path),
                    None => println!(
                        "{:>4} {:<8} {} ({} {} bytes)",
                        op.index, op.kind, op.path, op.payload, op.bytes
                    ),
                }
            }
            println!(
                "{} ops, {} payload bytes, digest {}",
                result.ops.len(),
                result.payload_bytes,
                result.expected_digest
            );
        }
    }
    Ok(())
}
