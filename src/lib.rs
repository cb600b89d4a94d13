//! DougHub store core: connection lifecycle, versioned schema migrations,
//! and file-level snapshots for the embedded SQLite database.
//!
//! Application startup opens the store with [`db::Database::open`] and then
//! calls [`migration::run_migrations`] exactly once. Domain query modules
//! obtain the live handle through [`db::Database::conn`] only after that call
//! returns without error; they never touch the migration primitives directly.

pub mod backup;
pub mod db;
pub mod migration;

pub use backup::{BackupError, BackupService, Snapshot};
pub use db::{Database, DbError};
pub use migration::{
    run_migrations, MigrationReport, MigrationRunner, MigrationStep, LATEST_VERSION,
};
