//! Delivery log and rollback pin.
//!
//! Every head the synchronizer starts delivering is recorded in a
//! [`DeliveryLog`]. Because history already holds each delivered tree, a
//! rollback is a [`Pin`]: while one is set the synchronizer delivers the
//! pinned revision instead of the watched reference's head.
//!
//! With a state directory both are kept as JSON files next to each other,
//! so the CLI can list deliveries and pin a revision while the
//! synchronizer is running.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use patchsync_protocol::Revision;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Delivery log file inside the state directory.
pub const LOG_FILE: &str = "deliveries.json";

/// Pin file inside the state directory.
pub const PIN_FILE: &str = "pin.json";

/// Result type for state directory operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors reading or writing the state directory.
#[derive(Error, Debug)]
pub enum StateError {
    /// A state file could not be read or written.
    #[error("state file {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A state file is not valid JSON for its type.
    #[error("corrupt state file {}: {source}", path.display())]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One delivered head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Revision delivered.
    pub revision: Revision,
    /// When delivery started.
    pub delivered_at: DateTime<Utc>,
    /// Set when the delivery was a rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

/// A revision delivered instead of the watched reference's head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    /// Pinned revision.
    pub revision: Revision,
    /// Why the rollback happened.
    pub reason: String,
    /// When the pin was set.
    pub pinned_at: DateTime<Utc>,
}

impl Pin {
    /// Pins `revision` now.
    pub fn new(revision: Revision, reason: impl Into<String>) -> Self {
        Self {
            revision,
            reason: reason.into(),
            pinned_at: Utc::now(),
        }
    }
}

/// How many deliveries are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Most entries kept.
    pub max_entries: usize,
    /// Entries older than this many days are dropped; 0 keeps them.
    pub keep_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            keep_days: 30,
        }
    }
}

/// Recently delivered heads, newest first.
#[derive(Debug)]
pub struct DeliveryLog {
    dir: Option<PathBuf>,
    retention: RetentionConfig,
    entries: Mutex<Vec<Delivery>>,
}

impl DeliveryLog {
    /// A log that is not persisted.
    pub fn in_memory(retention: RetentionConfig) -> Self {
        Self {
            dir: None,
            retention,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Opens the log in `dir`, loading existing entries. The directory is
    /// created on the first write.
    pub fn open(dir: impl Into<PathBuf>, retention: RetentionConfig) -> StateResult<Self> {
        let dir = dir.into();
        let entries = read_entries(&dir)?;
        Ok(Self {
            dir: Some(dir),
            retention,
            entries: Mutex::new(entries),
        })
    }

    /// State directory, if persisted.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Records a delivery of `revision`. Returns false if it repeats the
    /// newest entry.
    pub fn record(&self, revision: &Revision, rollback_reason: Option<&str>) -> StateResult<bool> {
        let mut entries = self.entries.lock();
        let repeat = entries
            .first()
            .is_some_and(|newest| &newest.revision == revision && rollback_reason.is_none());
        if repeat {
            return Ok(false);
        }
        entries.insert(
            0,
            Delivery {
                revision: revision.clone(),
                delivered_at: Utc::now(),
                rollback_reason: rollback_reason.map(str::to_string),
            },
        );
        prune(&mut entries, &self.retention, Utc::now());
        if let Some(dir) = &self.dir {
            write_json(&dir.join(LOG_FILE), &*entries)?;
        }
        Ok(true)
    }

    /// Kept deliveries, newest first.
    pub fn entries(&self) -> Vec<Delivery> {
        self.entries.lock().clone()
    }

    /// Pin stored in the state directory. Always `None` in memory.
    pub fn stored_pin(&self) -> StateResult<Option<Pin>> {
        match &self.dir {
            Some(dir) => read_pin(dir),
            None => Ok(None),
        }
    }

    /// Stores or removes the pin. A no-op in memory.
    pub fn store_pin(&self, pin: Option<&Pin>) -> StateResult<()> {
        match &self.dir {
            Some(dir) => write_pin(dir, pin),
            None => Ok(()),
        }
    }
}

/// Keeps the newest entry, then drops expired entries and caps the rest.
fn prune(entries: &mut Vec<Delivery>, retention: &RetentionConfig, now: DateTime<Utc>) {
    if retention.keep_days > 0 {
        let cutoff = now - ChronoDuration::days(i64::from(retention.keep_days));
        let mut index = 0;
        entries.retain(|entry| {
            index += 1;
            index == 1 || entry.delivered_at >= cutoff
        });
    }
    entries.truncate(retention.max_entries.max(1));
}

/// Reads the delivery log in `dir`, newest first. Missing means empty.
pub fn read_entries(dir: &Path) -> StateResult<Vec<Delivery>> {
    Ok(read_json(&dir.join(LOG_FILE))?.unwrap_or_default())
}

/// Reads the pin in `dir`.
pub fn read_pin(dir: &Path) -> StateResult<Option<Pin>> {
    read_json(&dir.join(PIN_FILE))
}

/// Writes the pin in `dir`; `None` removes it.
pub fn write_pin(dir: &Path, pin: Option<&Pin>) -> StateResult<()> {
    let path = dir.join(PIN_FILE);
    match pin {
        Some(pin) => write_json(&path, pin),
        None => match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StateError::io(&path, err)),
        },
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> StateResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StateError::io(path, err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Written to a temporary file, synced and renamed over the old one.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|err| StateError::io(dir, err))?;
    }
    let tmp = path.with_extension("json.tmp");
    let write = || -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    };
    write().map_err(|err| StateError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn delivery(revision: &str, age_days: i64) -> Delivery {
        Delivery {
            revision: revision.into(),
            delivered_at: Utc::now() - ChronoDuration::days(age_days),
            rollback_reason: None,
        }
    }

    #[test]
    fn consecutive_duplicates_are_skipped() {
        let log = DeliveryLog::in_memory(RetentionConfig::default());
        assert!(log.record(&"r1".into(), None).unwrap());
        assert!(!log.record(&"r1".into(), None).unwrap());
        assert!(log.record(&"r2".into(), None).unwrap());
        assert!(log.record(&"r1".into(), Some("bad release")).unwrap());

        let revisions: Vec<Revision> = log.entries().into_iter().map(|d| d.revision).collect();
        let expected: Vec<Revision> = vec!["r1".into(), "r2".into(), "r1".into()];
        assert_eq!(revisions, expected);
        assert_eq!(log.entries()[0].rollback_reason.as_deref(), Some("bad release"));
    }

    #[test]
    fn retention_keeps_newest_and_drops_expired() {
        let retention = RetentionConfig {
            max_entries: 3,
            keep_days: 7,
        };
        let mut entries = vec![
            delivery("r6", 30),
            delivery("r5", 1),
            delivery("r4", 2),
            delivery("r3", 3),
            delivery("r2", 10),
        ];
        prune(&mut entries, &retention, Utc::now());
        let revisions: Vec<&str> = entries.iter().map(|d| d.revision.as_str()).collect();
        // The newest survives even when expired.
        assert_eq!(revisions, vec!["r6", "r5", "r4"]);

        let mut entries = vec![delivery("r1", 0)];
        prune(
            &mut entries,
            &RetentionConfig {
                max_entries: 0,
                keep_days: 0,
            },
            Utc::now(),
        );
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn log_persists_across_opens() {
        let dir = tempdir().unwrap();
        let log = DeliveryLog::open(dir.path().join("state"), RetentionConfig::default()).unwrap();
        log.record(&"r1".into(), None).unwrap();
        log.record(&"r2".into(), None).unwrap();
        assert!(!dir.path().join("state").join("deliveries.json.tmp").exists());

        let reopened = DeliveryLog::open(dir.path().join("state"), RetentionConfig::default()).unwrap();
        assert_eq!(reopened.entries(), log.entries());
        assert_eq!(read_entries(&dir.path().join("state")).unwrap().len(), 2);
    }

    #[test]
    fn pin_round_trip_and_removal() {
        let dir = tempdir().unwrap();
        let log = DeliveryLog::open(dir.path(), RetentionConfig::default()).unwrap();
        assert_eq!(log.stored_pin().unwrap(), None);

        let pin = Pin::new("r1".into(), "broken deploy");
        log.store_pin(Some(&pin)).unwrap();
        assert_eq!(read_pin(dir.path()).unwrap(), Some(pin));

        log.store_pin(None).unwrap();
        log.store_pin(None).unwrap();
        assert_eq!(log.stored_pin().unwrap(), None);
    }

    #[test]
    fn corrupt_files_are_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(PIN_FILE), b"{not json").unwrap();
        let err = read_pin(dir.path()).unwrap_err();
        assert!(matches!(err, StateError::Parse { .. }));
        assert!(err.to_string().contains("pin.json"));
    }

    #[test]
    fn memory_log_has_no_pin() {
        let log = DeliveryLog::in_memory(RetentionConfig::default());
        log.store_pin(Some(&Pin::new("r1".into(), "x"))).unwrap();
        assert_eq!(log.stored_pin().unwrap(), None);
        assert!(log.dir().is_none());
    }
}
