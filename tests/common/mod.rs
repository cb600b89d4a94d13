//! Common test utilities for DougHub store integration tests
//!
//! Provides a temp-dir backed store, a backup service rooted next to it the
//! way the runner roots its own, and file hashing for rollback assertions.

use doughub_store::backup::BackupService;
use doughub_store::db::Database;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Test context holding temporary resources
#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
    pub backups_dir: PathBuf,
}

/// Route store logs to the test harness; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("temp dir");
        let db_path = temp_dir.path().join("doughub.db");
        let backups_dir = temp_dir.path().join("backups");
        Self {
            temp_dir,
            db_path,
            backups_dir,
        }
    }

    /// Open the store at this context's path.
    pub fn open(&self) -> Database {
        Database::open(&self.db_path).expect("open store")
    }

    /// A backup service rooted where `run_migrations` roots its own.
    pub fn backups(&self) -> BackupService {
        BackupService::new(&self.backups_dir)
    }

    /// Number of snapshot files currently on disk.
    pub fn snapshot_count(&self) -> usize {
        self.backups()
            .list_snapshots()
            .expect("list snapshots")
            .len()
    }

    /// SHA-256 of the store file's bytes.
    pub fn store_hash(&self) -> String {
        let bytes = fs::read(&self.db_path).expect("read store file");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}
