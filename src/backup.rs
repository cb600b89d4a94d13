//! Snapshot and retention service for the DougHub store
//!
//! The migration engine copies the whole store file into the backups
//! directory before any structurally risky step runs, and restores that copy
//! when the step fails. Snapshots are plain file copies named
//! `doughub-<timestamp>.db`, where the timestamp is an RFC 3339 instant with
//! `:` and `.` replaced by `-` so the name is safe on every filesystem.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Snapshot filename prefix (the app name, matching the store filename)
const SNAPSHOT_PREFIX: &str = "doughub";

/// Snapshot filename extension
const SNAPSHOT_EXT: &str = "db";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot not found: {}", .0.display())]
    SnapshotMissing(PathBuf),
}

/// A file-level backup copy of the store. Immutable once written; deleted
/// only by a retention sweep or a manual prune.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Snapshot store rooted at one backups directory.
pub struct BackupService {
    dir: PathBuf,
}

impl BackupService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The backups directory this service manages.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, created_at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.{}",
            SNAPSHOT_PREFIX,
            encode_timestamp(created_at),
            SNAPSHOT_EXT
        ))
    }

    /// Copy the store file into the backups directory.
    ///
    /// Any failure here must abort the pending migration before it mutates
    /// anything: fail closed, never fail open.
    pub fn create_snapshot(&self, source: &Path) -> Result<Snapshot, BackupError> {
        fs::create_dir_all(&self.dir)?;

        // Two snapshots in the same millisecond would collide on filename.
        let mut created_at = Utc::now();
        let mut path = self.snapshot_path(created_at);
        while path.exists() {
            created_at += chrono::Duration::milliseconds(1);
            path = self.snapshot_path(created_at);
        }

        let size_bytes = fs::copy(source, &path)?;

        tracing::info!(snapshot = %path.display(), size_bytes, "created store snapshot");

        Ok(Snapshot {
            path,
            created_at,
            size_bytes,
        })
    }

    /// Overwrite `target` with the snapshot's bytes.
    ///
    /// Fails with [`BackupError::SnapshotMissing`] if the snapshot has
    /// disappeared, e.g. raced by a concurrent retention sweep. Stale
    /// `-wal`/`-shm` sidecars of the target are removed so the restored file
    /// is authoritative when the store is next opened.
    pub fn restore_snapshot(&self, snapshot_path: &Path, target: &Path) -> Result<(), BackupError> {
        if !snapshot_path.exists() {
            return Err(BackupError::SnapshotMissing(snapshot_path.to_path_buf()));
        }

        fs::copy(snapshot_path, target)?;

        for suffix in ["-wal", "-shm"] {
            let mut os = target.as_os_str().to_os_string();
            os.push(suffix);
            let sidecar = PathBuf::from(os);
            if sidecar.exists() {
                let _ = fs::remove_file(&sidecar);
            }
        }

        tracing::info!(
            snapshot = %snapshot_path.display(),
            target = %target.display(),
            "restored store from snapshot"
        );

        Ok(())
    }

    /// List snapshots, newest first.
    ///
    /// The creation time is parsed from the filename; malformed or legacy
    /// names fall back to the file's modification time so the entry is still
    /// included and still correctly ordered.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, BackupError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(SNAPSHOT_PREFIX)
                || path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT)
            {
                continue;
            }

            let metadata = entry.metadata()?;
            let created_at = parse_snapshot_name(name).unwrap_or_else(|| {
                metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            });

            snapshots.push(Snapshot {
                path,
                created_at,
                size_bytes: metadata.len(),
            });
        }

        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });

        Ok(snapshots)
    }

    /// Delete snapshots older than `retention_days`. Returns the count
    /// deleted. Per-file failures are logged and skipped: one locked file
    /// must not block the rest of the sweep.
    pub fn cleanup_by_age(&self, retention_days: i64) -> Result<usize, BackupError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut deleted = 0;

        for snapshot in self.list_snapshots()? {
            if snapshot.created_at >= cutoff {
                continue;
            }
            match fs::remove_file(&snapshot.path) {
                Ok(()) => deleted += 1,
                Err(err) => tracing::warn!(
                    snapshot = %snapshot.path.display(),
                    %err,
                    "skipping snapshot that could not be deleted"
                ),
            }
        }

        Ok(deleted)
    }

    /// Keep the `max_count` most recent snapshots, delete the rest. Returns
    /// the count deleted. Same partial-failure tolerance as
    /// [`BackupService::cleanup_by_age`].
    pub fn prune_by_count(&self, max_count: usize) -> Result<usize, BackupError> {
        let mut deleted = 0;

        for snapshot in self.list_snapshots()?.iter().skip(max_count) {
            match fs::remove_file(&snapshot.path) {
                Ok(()) => deleted += 1,
                Err(err) => tracing::warn!(
                    snapshot = %snapshot.path.display(),
                    %err,
                    "skipping snapshot that could not be deleted"
                ),
            }
        }

        Ok(deleted)
    }

    /// Timestamp of the newest snapshot, or `None` if there are none.
    pub fn last_backup_timestamp(&self) -> Result<Option<DateTime<Utc>>, BackupError> {
        Ok(self.list_snapshots()?.first().map(|s| s.created_at))
    }
}

/// `2024-01-01T12:30:45.123Z` -> `2024-01-01T12-30-45-123Z`
fn encode_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Exact inverse of [`encode_timestamp`]: restore the two colons in the
/// hour-minute-second block and the period before the trailing `Z`.
fn decode_timestamp(encoded: &str) -> Option<DateTime<Utc>> {
    let (date, time) = encoded.split_once('T')?;
    let mut fields = time.splitn(4, '-');
    let (h, m, s, millis) = (
        fields.next()?,
        fields.next()?,
        fields.next()?,
        fields.next()?,
    );
    let restored = format!("{date}T{h}:{m}:{s}.{millis}");
    DateTime::parse_from_rfc3339(&restored)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse the creation time out of a snapshot filename.
fn parse_snapshot_name(name: &str) -> Option<DateTime<Utc>> {
    let encoded = name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_prefix('-')?
        .strip_suffix(SNAPSHOT_EXT)?
        .strip_suffix('.')?;
    decode_timestamp(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_timestamp_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 18, 45, 9).unwrap()
            + chrono::Duration::milliseconds(250);
        let encoded = encode_timestamp(t);
        assert_eq!(encoded, "2024-03-07T18-45-09-250Z");
        assert_eq!(decode_timestamp(&encoded), Some(t));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode_timestamp("not-a-timestamp"), None);
        assert_eq!(decode_timestamp("2024-03-07"), None);
        assert_eq!(decode_timestamp("2024-03-07T18-45Z"), None);
    }

    #[test]
    fn test_parse_snapshot_name() {
        let parsed = parse_snapshot_name("doughub-2024-03-07T18-45-09-250Z.db");
        assert!(parsed.is_some());
        assert_eq!(parse_snapshot_name("doughub-legacy.db"), None);
        assert_eq!(parse_snapshot_name("other-2024-03-07T18-45-09-250Z.db"), None);
    }

    #[test]
    fn test_create_and_restore_snapshot() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.db");
        std::fs::write(&source, b"original bytes").unwrap();

        let backups = BackupService::new(dir.path().join("backups"));
        let snapshot = backups.create_snapshot(&source).unwrap();
        assert!(snapshot.path.exists());
        assert_eq!(snapshot.size_bytes, 14);

        std::fs::write(&source, b"mutated").unwrap();
        backups.restore_snapshot(&snapshot.path, &source).unwrap();
        assert_eq!(std::fs::read(&source).unwrap(), b"original bytes");
    }

    #[test]
    fn test_restore_removes_stale_sidecars() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("store.db");
        std::fs::write(&source, b"data").unwrap();

        let backups = BackupService::new(dir.path().join("backups"));
        let snapshot = backups.create_snapshot(&source).unwrap();

        let wal = dir.path().join("store.db-wal");
        let shm = dir.path().join("store.db-shm");
        std::fs::write(&wal, b"stale wal").unwrap();
        std::fs::write(&shm, b"stale shm").unwrap();

        backups.restore_snapshot(&snapshot.path, &source).unwrap();
        assert!(!wal.exists());
        assert!(!shm.exists());
    }

    #[test]
    fn test_restore_missing_snapshot_is_not_found() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("store.db");
        let backups = BackupService::new(dir.path().join("backups"));

        let missing = dir.path().join("backups").join("doughub-gone.db");
        let err = backups.restore_snapshot(&missing, &target).unwrap_err();
        assert!(matches!(err, BackupError::SnapshotMissing(_)));
    }

    #[test]
    fn test_list_snapshots_empty_when_dir_missing() {
        let dir = tempdir().unwrap();
        let backups = BackupService::new(dir.path().join("backups"));
        assert!(backups.list_snapshots().unwrap().is_empty());
        assert!(backups.last_backup_timestamp().unwrap().is_none());
    }
}
