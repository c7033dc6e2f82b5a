//! Rollback command implementation.
//!
//! Works on the synchronizer's state directory, so it acts on a running
//! synchronizer at its next poll or on the next start.

use super::config::FileConfig;
use clap::{Args, Subcommand};
use patchsync_protocol::Revision;
use patchsync_server::{read_entries, read_pin, write_pin, Delivery, GitHistory, Pin, RevisionReader};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Arguments of `patchsync rollback`.
#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Synchronizer state directory (defaults to server.state_dir)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: RollbackAction,
}

/// What to do.
#[derive(Subcommand, Debug)]
pub enum RollbackAction {
    /// List recent deliveries, newest first
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Deliver an earlier revision instead of the watched reference
    To {
        /// Revision, reference, or a prefix of a delivered revision
        revision: String,

        /// Why
        #[arg(long, default_value = "manual rollback")]
        reason: String,

        /// Git repository to resolve the revision in (defaults to watch.repo)
        #[arg(short, long)]
        repo: Option<PathBuf>,
    },

    /// Remove the pin and follow the watched reference again
    Resume,
}

/// One listed delivery.
#[derive(Debug, Serialize)]
pub struct ListedDelivery {
    /// The delivery.
    #[serde(flatten)]
    pub delivery: Delivery,
    /// True if this revision is the active pin.
    pub pinned: bool,
}

/// Deliveries in `dir`, newest first, with the active pin marked.
pub fn list(dir: &Path) -> Result<Vec<ListedDelivery>, Box<dyn std::error::Error>> {
    let pin = read_pin(dir)?;
    let mut pin_seen = false;
    let listed = read_entries(dir)?
        .into_iter()
        .map(|delivery| {
            // Only the newest delivery of the pinned revision is marked.
            let pinned = !pin_seen && pin.as_ref().is_some_and(|pin| pin.revision == delivery.revision);
            pin_seen |= pinned;
            ListedDelivery { delivery, pinned }
        })
        .collect();
    Ok(listed)
}

/// Resolves `revision` through `reader`, or by unique prefix among
/// delivered revisions when there is no repository.
pub fn resolve(
    revision: &str,
    reader: Option<&dyn RevisionReader>,
    deliveries: &[Delivery],
) -> Result<Revision, Box<dyn std::error::Error>> {
    if let Some(reader) = reader {
        return Ok(reader.resolve(revision)?);
    }
    let mut matches: Vec<&Revision> = deliveries
        .iter()
        .map(|d| &d.revision)
        .filter(|r| r.as_str().starts_with(revision))
        .collect();
    matches.sort();
    matches.dedup();
    match matches.as_slice() {
        [single] => Ok((*single).clone()),
        [] => Err(format!("{revision} is not in the delivery log; pass --repo to resolve it").into()),
        _ => Err(format!("{revision} is ambiguous ({} delivered revisions match)", matches.len()).into()),
    }
}

/// Runs the rollback command.
pub fn run(file: FileConfig, args: RollbackArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dir = args
        .state_dir
        .or(file.server.state_dir)
        .ok_or("state directory required: pass --state-dir or set server.state_dir")?;

    match args.action {
        RollbackAction::List { format } => {
            let listed = list(&dir)?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&listed)?),
                _ => {
                    if listed.is_empty() {
                        println!("no deliveries recorded in {}", dir.display());
                    }
                    for entry in &listed {
                        let marker = if entry.pinned { "*" } else { " " };
                        let reason = entry
                            .delivery
                            .rollback_reason
                            .as_deref()
                            .map(|reason| format!("  rollback: {reason}"))
                            .unwrap_or_default();
                        println!(
                            "{marker} {}  {}{reason}",
                            entry.delivery.revision.short(),
                            entry.delivery.delivered_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        );
                    }
                }
            }
        }
        RollbackAction::To { revision, reason, repo } => {
            let history = match repo.or(file.watch.repo) {
                Some(repo) => Some(GitHistory::open(&repo)?),
                None => None,
            };
            let reader = history.as_ref().map(|h| h as &dyn RevisionReader);
            let revision = resolve(&revision, reader, &read_entries(&dir)?)?;
            let pin = Pin::new(revision, reason);
            write_pin(&dir, Some(&pin))?;
            println!("pinned {} ({})", pin.revision.short(), pin.reason);
        }
        RollbackAction::Resume => match read_pin(&dir)? {
            Some(pin) => {
                write_pin(&dir, None)?;
                println!("unpinned {}, following the watched reference", pin.revision.short());
            }
            None => println!("no rollback in effect"),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchsync_server::{DeliveryLog, MemoryHistory, RetentionConfig};
    use tempfile::tempdir;

    fn delivered(dir: &Path, revisions: &[&str]) {
        let log = DeliveryLog::open(dir, RetentionConfig::default()).unwrap();
        for revision in revisions {
            log.record(&Revision::new(*revision), None).unwrap();
        }
    }

    #[test]
    fn list_marks_the_pin() {
        let dir = tempdir().unwrap();
        delivered(dir.path(), &["aaa111", "bbb222", "aaa111"]);
        write_pin(dir.path(), Some(&Pin::new("aaa111".into(), "bad"))).unwrap();

        let listed = list(dir.path()).unwrap();
        let marks: Vec<(&str, bool)> = listed
            .iter()
            .map(|l| (l.delivery.revision.as_str(), l.pinned))
            .collect();
        assert_eq!(marks, vec![("aaa111", true), ("bbb222", false), ("aaa111", false)]);

        let json = serde_json::to_value(&listed).unwrap();
        assert_eq!(json[0]["revision"], "aaa111");
        assert_eq!(json[0]["pinned"], true);
    }

    #[test]
    fn prefixes_resolve_against_the_log() {
        let deliveries: Vec<Delivery> = ["abc123", "abd456", "abc123"]
            .iter()
            .map(|r| Delivery {
                revision: Revision::new(*r),
                delivered_at: Default::default(),
                rollback_reason: None,
            })
            .collect();
        assert_eq!(resolve("abc", None, &deliveries).unwrap(), Revision::new("abc123"));
        assert!(resolve("ab", None, &deliveries).unwrap_err().to_string().contains("ambiguous"));
        assert!(resolve("fff", None, &deliveries).unwrap_err().to_string().contains("--repo"));
    }

    #[test]
    fn repository_resolves_references() {
        let history = MemoryHistory::new();
        let r1 = history.commit_changes("main", [("a", Some(&b"1"[..]))]);
        assert_eq!(resolve("main", Some(&history), &[]).unwrap(), r1);
        assert!(resolve("nope", Some(&history), &[]).is_err());
    }

    #[test]
    fn to_and_resume_write_the_pin() {
        let dir = tempdir().unwrap();
        delivered(dir.path(), &["aaa111", "bbb222"]);
        let mut file = FileConfig::default();
        file.server.state_dir = Some(dir.path().to_path_buf());

        let args = RollbackArgs {
            state_dir: None,
            action: RollbackAction::To {
                revision: "aaa".into(),
                reason: "broken release".into(),
                repo: None,
            },
        };
        run(file.clone(), args).unwrap();
        let pin = read_pin(dir.path()).unwrap().unwrap();
        assert_eq!(pin.revision, Revision::new("aaa111"));
        assert_eq!(pin.reason, "broken release");

        let args = RollbackArgs {
            state_dir: None,
            action: RollbackAction::Resume,
        };
        run(file, args).unwrap();
        assert!(read_pin(dir.path()).unwrap().is_none());
    }

    #[test]
    fn state_dir_is_required() {
        let args = RollbackArgs {
            state_dir: None,
            action: RollbackAction::Resume,
        };
        let err = run(FileConfig::default(), args).unwrap_err();
        assert!(err.to_string().contains("--state-dir"));
    }
}
