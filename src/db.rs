//! Database module for DougHub
//! Owns the single live SQLite handle and the schema introspection
//! primitives the migration engine builds on.

use crate::backup::BackupError;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database not initialized")]
    NotInitialized,
    #[error("Database corruption detected")]
    Corruption,
    #[error("FTS5 not available in this build")]
    Fts5NotAvailable,
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),
    #[error("Restore failed: {0}")]
    Restore(String),
}

/// Owner of the store connection.
///
/// At most one live handle exists per `Database`. The handle is dropped by
/// [`Database::close`] and only [`Database::reopen`] brings it back in sync
/// with a store file that was replaced on disk (a restored snapshot is
/// invisible to an already-open connection's cached state).
pub struct Database {
    conn: Option<Connection>,
    path: PathBuf,
}

impl Database {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = open_connection(path)?;
        let db = Self {
            conn: Some(conn),
            path: path.to_path_buf(),
        };

        // Verify FTS5 is available (the full-text migrations depend on it)
        db.verify_fts5()?;

        Ok(db)
    }

    /// Idempotent open: a no-op when a handle is already live, so callers
    /// that do not track connection state cannot end up with two handles.
    pub fn ensure_open(&mut self) -> Result<(), DbError> {
        if self.conn.is_none() {
            self.conn = Some(open_connection(&self.path)?);
        }
        Ok(())
    }

    /// Release the handle. Safe to call when already closed.
    ///
    /// The store path is kept so that [`Database::reopen`] cannot be pointed
    /// at a different file between a restore and the reopen.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_conn, err)) = conn.close() {
                tracing::warn!(%err, "store handle did not close cleanly");
            }
        }
    }

    /// Close then open. Required after the file was overwritten out-of-band.
    pub fn reopen(&mut self) -> Result<(), DbError> {
        self.close();
        self.ensure_open()
    }

    /// The live connection handle.
    ///
    /// Returns [`DbError::NotInitialized`] when the store is closed, or when a
    /// collaborator asks for the handle before migrations have opened it --
    /// that is a programming error, not a data error.
    pub fn conn(&self) -> Result<&Connection, DbError> {
        self.conn.as_ref().ok_or(DbError::NotInitialized)
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted schema version.
    ///
    /// The version lives in `PRAGMA user_version`, inside the store file
    /// itself, so it travels with the file even when copied manually.
    pub fn schema_version(&self) -> Result<i32, DbError> {
        let version: i32 = self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Write the persisted schema version.
    ///
    /// Issued only as the final statement of a migration step, before commit.
    pub fn set_schema_version(&self, version: i32) -> Result<(), DbError> {
        self.conn()?.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    /// Does `table` exist in the store?
    pub fn table_exists(&self, table: &str) -> Result<bool, DbError> {
        Ok(table_exists(self.conn()?, table)?)
    }

    /// Does `column` exist on `table`?
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool, DbError> {
        Ok(column_exists(self.conn()?, table, column)?)
    }

    /// Flush the write-ahead log into the main file. Called before any
    /// file-level copy so the copy sees every committed page.
    pub fn checkpoint(&self) -> Result<(), DbError> {
        self.conn()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Check database integrity
    pub fn check_integrity(&self) -> Result<(), DbError> {
        let result: String = self
            .conn()?
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;

        if result != "ok" {
            return Err(DbError::Corruption);
        }

        Ok(())
    }

    /// Verify FTS5 extension is available (release gate)
    pub fn verify_fts5(&self) -> Result<bool, DbError> {
        let conn = self.conn()?;

        // Check if FTS5 is compiled in
        let result: SqliteResult<i32> = conn.query_row(
            "SELECT 1 WHERE EXISTS (SELECT 1 FROM pragma_compile_options WHERE compile_options = 'ENABLE_FTS5')",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Try to create a test FTS5 table as fallback verification
                match conn.execute(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS _fts5_test USING fts5(content)",
                    [],
                ) {
                    Ok(_) => {
                        conn.execute("DROP TABLE IF EXISTS _fts5_test", [])?;
                        Ok(true)
                    }
                    Err(_) => Err(DbError::Fts5NotAvailable),
                }
            }
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }
}

/// Does `table` exist? Usable from migration step bodies that only hold the
/// raw connection.
pub fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Does `column` exist on `table`? Usable from migration step bodies.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Open a connection and apply the session options. These do not persist
/// across opens (WAL mode survives in the file header, the rest must be
/// reapplied on every real open).
fn open_connection(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;

    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(conn)
}

/// Get the application data directory
pub fn get_app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("doughub")
}

/// Get database path
pub fn get_db_path() -> PathBuf {
    get_app_data_dir().join("doughub.db")
}

/// Get backups directory
pub fn get_backups_dir() -> PathBuf {
    get_app_data_dir().join("backups")
}
