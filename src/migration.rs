//! Schema migration engine for the DougHub store
//!
//! The store carries a version integer in `PRAGMA user_version`; this module
//! holds the ordered, gapless registry of migration steps and the runner that
//! walks it at startup. Each step commits as one transaction with the version
//! bump as its final statement. Steps marked `requires_backup` get a
//! file-level snapshot first, and a failure inside such a step restores the
//! snapshot, reopens the handle, and rethrows -- the store on disk is then
//! byte-identical to its pre-run state.

use crate::backup::{BackupService, Snapshot};
use crate::db::{self, Database, DbError};
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;

/// Version written when the baseline schema is created. Registered steps
/// start immediately above it.
pub const BASE_VERSION: i32 = 1;

/// Version a fully migrated store reports.
pub const LATEST_VERSION: i32 = 6;

/// One versioned migration, transforming the store from
/// `target_version - 1` to `target_version`.
///
/// Step bodies must tolerate a store that already reflects them (guarded via
/// [`db::table_exists`] / [`db::column_exists`]): a later launch may re-run a
/// step whose version bump did not persist because the process died between
/// commit and exit.
pub struct MigrationStep {
    pub target_version: i32,
    /// Only structurally risky steps (table rewrites, destructive drops, bulk
    /// transforms) pay for a full-file snapshot; strictly additive steps run
    /// without one and propagate failures with no rollback attempt.
    pub requires_backup: bool,
    pub description: &'static str,
    pub apply: fn(&Connection) -> Result<(), DbError>,
}

/// The full ordered list of known migration steps.
pub fn registry() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            target_version: 2,
            requires_backup: false,
            description: "add sourceName to source_items",
            apply: migrate_v2,
        },
        MigrationStep {
            target_version: 3,
            requires_backup: true,
            description: "create knowledge entity tables",
            apply: migrate_v3,
        },
        MigrationStep {
            target_version: 4,
            requires_backup: true,
            description: "full-text index over notes with backfill",
            apply: migrate_v4,
        },
        MigrationStep {
            target_version: 5,
            requires_backup: true,
            description: "practice bank and card scheduling rewrite",
            apply: migrate_v5,
        },
        MigrationStep {
            target_version: 6,
            requires_backup: false,
            description: "index cards by due date",
            apply: migrate_v6,
        },
    ]
}

/// Result of a completed migration run
#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    pub from_version: i32,
    pub to_version: i32,
    pub steps_applied: usize,
    pub snapshots_created: usize,
}

/// Drives the registry walk against one store.
///
/// Owns nothing global: the database and backup service are injected, so
/// several independent stores can migrate in the same test process.
pub struct MigrationRunner<'a> {
    db: &'a mut Database,
    backups: BackupService,
    registry: Vec<MigrationStep>,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(db: &'a mut Database, backups: BackupService) -> Self {
        Self::with_registry(db, backups, registry())
    }

    pub fn with_registry(
        db: &'a mut Database,
        backups: BackupService,
        registry: Vec<MigrationStep>,
    ) -> Self {
        Self {
            db,
            backups,
            registry,
        }
    }

    /// Walk the registry from the store's current version to the newest
    /// registered step, strictly in order, one transaction per step.
    ///
    /// Contract: no step-level DDL atomicity is assumed. A backup-covered
    /// step that fails mid-way is recovered by restoring the pre-step
    /// snapshot, not by trusting the engine to roll DDL back. A halted run
    /// leaves the store durably at the last committed version; later steps
    /// are never attempted in that invocation.
    pub fn run(&mut self) -> Result<MigrationReport, DbError> {
        self.validate_registry()?;
        self.db.ensure_open()?;
        self.db.check_integrity()?;

        let mut report = MigrationReport {
            from_version: self.db.schema_version()?,
            ..MigrationReport::default()
        };

        if report.from_version == 0 {
            self.apply_baseline()?;
        }

        let latest = self
            .registry
            .last()
            .map_or(BASE_VERSION, |s| s.target_version);

        let mut version = self.db.schema_version()?;
        if version > latest {
            tracing::warn!(
                version,
                latest,
                "store version is newer than this build; downgrades are not supported"
            );
        }

        while version < latest {
            let step = self.step_for(version + 1)?;
            tracing::info!(
                target_version = step.target_version,
                description = step.description,
                requires_backup = step.requires_backup,
                "applying migration step"
            );

            let snapshot = if step.requires_backup {
                Some(self.snapshot_before_step()?)
            } else {
                None
            };

            let took_snapshot = snapshot.is_some();
            if let Err(step_err) = self.apply_step(step) {
                return Err(self.roll_back(step_err, snapshot));
            }

            report.steps_applied += 1;
            if took_snapshot {
                report.snapshots_created += 1;
            }
            version = self.db.schema_version()?;
            tracing::info!(version, "migration step committed");
        }

        report.to_version = version;
        Ok(report)
    }

    /// Version 0 means a brand-new file: create the baseline schema and stamp
    /// it as version 1 in a single transaction.
    fn apply_baseline(&self) -> Result<(), DbError> {
        tracing::info!("creating baseline schema");
        let conn = self.db.conn()?;
        let tx = conn.unchecked_transaction()?;
        conn.execute_batch(BASELINE_SCHEMA)?;
        self.db.set_schema_version(BASE_VERSION)?;
        tx.commit()?;
        Ok(())
    }

    /// Flush the WAL and copy the store file. A failure aborts the whole run
    /// before the step touches anything.
    fn snapshot_before_step(&self) -> Result<Snapshot, DbError> {
        self.db.checkpoint()?;
        Ok(self.backups.create_snapshot(self.db.path())?)
    }

    /// Step body plus version bump in one transaction; the bump is the last
    /// statement before commit.
    fn apply_step(&self, step: &MigrationStep) -> Result<(), DbError> {
        let conn = self.db.conn()?;
        let tx = conn.unchecked_transaction()?;
        (step.apply)(conn)?;
        self.db.set_schema_version(step.target_version)?;
        tx.commit()?;
        Ok(())
    }

    /// Recover from a failed step. With a snapshot in hand: close, restore,
    /// reopen, and rethrow the step's own error. Without one, the error
    /// propagates untouched. A failed restore is fatal and loud -- the store
    /// may then be in an undefined state and this must never be swallowed.
    fn roll_back(&mut self, step_err: DbError, snapshot: Option<Snapshot>) -> DbError {
        let Some(snapshot) = snapshot else {
            return step_err;
        };

        tracing::error!(
            %step_err,
            snapshot = %snapshot.path.display(),
            "migration step failed, restoring pre-step snapshot"
        );

        self.db.close();
        let target = self.db.path().to_path_buf();

        if let Err(restore_err) = self.backups.restore_snapshot(&snapshot.path, &target) {
            return DbError::Restore(format!(
                "step failed ({step_err}) and restoring {} also failed: {restore_err}",
                snapshot.path.display()
            ));
        }
        if let Err(reopen_err) = self.db.reopen() {
            return DbError::Restore(format!(
                "step failed ({step_err}) and reopening after restore failed: {reopen_err}"
            ));
        }

        tracing::info!("store restored to pre-step snapshot");
        step_err
    }

    fn step_for(&self, target: i32) -> Result<&MigrationStep, DbError> {
        self.registry
            .iter()
            .find(|s| s.target_version == target)
            .ok_or_else(|| DbError::Migration(format!("no step registered for version {target}")))
    }

    /// The registry must be gapless and ordered, starting just above the
    /// baseline. A store several versions behind walks every intermediate
    /// step; none may be skipped.
    fn validate_registry(&self) -> Result<(), DbError> {
        let mut expected = BASE_VERSION + 1;
        for step in &self.registry {
            if step.target_version != expected {
                return Err(DbError::Migration(format!(
                    "registry must be gapless from version {}: found step targeting {} where {} was expected",
                    BASE_VERSION + 1,
                    step.target_version,
                    expected
                )));
            }
            expected += 1;
        }
        Ok(())
    }
}

/// Top-level entry point, invoked exactly once at application startup right
/// after the initial open. Either the store ends at the latest version or an
/// error comes back; callers must refuse to proceed on error rather than
/// query a store of unknown version.
///
/// There is no cross-process mutual exclusion here: two processes opening the
/// same store would both attempt to migrate it. Wrap this call in an advisory
/// file lock scoped to the store path when that can happen.
pub fn run_migrations(db: &mut Database) -> Result<MigrationReport, DbError> {
    let backups_dir = db
        .path()
        .parent()
        .map(|p| p.join("backups"))
        .unwrap_or_else(|| PathBuf::from("backups"));
    let backups = BackupService::new(backups_dir);
    MigrationRunner::new(db, backups).run()
}

/// Version 1: captured sources, curated notes, review cards.
const BASELINE_SCHEMA: &str = r#"
    -- Captured sources awaiting curation
    CREATE TABLE IF NOT EXISTS source_items (
        id TEXT PRIMARY KEY,
        title TEXT,
        sourceType TEXT NOT NULL,
        content TEXT,
        status TEXT NOT NULL DEFAULT 'inbox',
        createdAt TEXT NOT NULL,
        updatedAt TEXT NOT NULL
    );

    -- Curated notes
    CREATE TABLE IF NOT EXISTS notes (
        id TEXT PRIMARY KEY,
        sourceItemId TEXT,
        title TEXT,
        content TEXT NOT NULL,
        createdAt TEXT NOT NULL,
        updatedAt TEXT NOT NULL,
        FOREIGN KEY (sourceItemId) REFERENCES source_items(id) ON DELETE SET NULL
    );

    -- Review cards
    CREATE TABLE IF NOT EXISTS cards (
        id TEXT PRIMARY KEY,
        noteId TEXT,
        front TEXT NOT NULL,
        back TEXT NOT NULL,
        createdAt TEXT NOT NULL,
        updatedAt TEXT NOT NULL,
        FOREIGN KEY (noteId) REFERENCES notes(id) ON DELETE CASCADE
    );
"#;

/// v2: track where a captured item came from. Strictly additive.
fn migrate_v2(conn: &Connection) -> Result<(), DbError> {
    if !db::column_exists(conn, "source_items", "sourceName")? {
        conn.execute_batch("ALTER TABLE source_items ADD COLUMN sourceName TEXT;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_source_items_created ON source_items(createdAt DESC);",
    )?;
    Ok(())
}

/// v3: knowledge entities extracted from notes, plus their cross links.
fn migrate_v3(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            entityType TEXT NOT NULL,
            noteId TEXT,
            createdAt TEXT NOT NULL,
            FOREIGN KEY (noteId) REFERENCES notes(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS entity_links (
            sourceEntityId TEXT NOT NULL,
            targetEntityId TEXT NOT NULL,
            linkType TEXT NOT NULL,
            createdAt TEXT NOT NULL,
            PRIMARY KEY (sourceEntityId, targetEntityId, linkType),
            FOREIGN KEY (sourceEntityId) REFERENCES knowledge_entities(id) ON DELETE CASCADE,
            FOREIGN KEY (targetEntityId) REFERENCES knowledge_entities(id) ON DELETE CASCADE
        );
        "#,
    )?;
    Ok(())
}

/// v4: full-text search over notes. The backfill indexes every note that
/// already exists; the triggers keep the index in sync afterwards.
fn migrate_v4(conn: &Connection) -> Result<(), DbError> {
    if db::table_exists(conn, "notes_fts")? {
        return Ok(());
    }
    conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE notes_fts USING fts5(
            title, content,
            content='notes',
            tokenize='porter unicode61'
        );

        -- Sync triggers (external-content FTS5 via rowid)
        CREATE TRIGGER notes_ai AFTER INSERT ON notes BEGIN
            INSERT INTO notes_fts(rowid, title, content)
            VALUES (new.rowid, new.title, new.content);
        END;

        CREATE TRIGGER notes_ad AFTER DELETE ON notes BEGIN
            INSERT INTO notes_fts(notes_fts, rowid, title, content)
            VALUES ('delete', old.rowid, old.title, old.content);
        END;

        CREATE TRIGGER notes_au AFTER UPDATE ON notes BEGIN
            INSERT INTO notes_fts(notes_fts, rowid, title, content)
            VALUES ('delete', old.rowid, old.title, old.content);
            INSERT INTO notes_fts(rowid, title, content)
            VALUES (new.rowid, new.title, new.content);
        END;

        -- Backfill from rows that predate the index
        INSERT INTO notes_fts(rowid, title, content)
        SELECT rowid, title, content FROM notes;
        "#,
    )?;
    Ok(())
}

/// v5: practice-bank flashcards, and scheduling state on cards. SQLite cannot
/// add columns with the constraints we need here, so cards is rebuilt through
/// a copy.
fn migrate_v5(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS practice_flashcards (
            id TEXT PRIMARY KEY,
            bankName TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            explanation TEXT,
            importedAt TEXT NOT NULL
        );
        "#,
    )?;

    if db::column_exists(conn, "cards", "dueAt")? {
        // A prior attempt already rebuilt the table.
        return Ok(());
    }

    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS cards_new;

        CREATE TABLE cards_new (
            id TEXT PRIMARY KEY,
            noteId TEXT,
            front TEXT NOT NULL,
            back TEXT NOT NULL,
            easeFactor REAL NOT NULL DEFAULT 2.5,
            intervalDays INTEGER NOT NULL DEFAULT 0,
            dueAt TEXT,
            createdAt TEXT NOT NULL,
            updatedAt TEXT NOT NULL,
            FOREIGN KEY (noteId) REFERENCES notes(id) ON DELETE CASCADE
        );

        INSERT INTO cards_new (id, noteId, front, back, createdAt, updatedAt)
        SELECT id, noteId, front, back, createdAt, updatedAt FROM cards;

        DROP TABLE cards;
        ALTER TABLE cards_new RENAME TO cards;
        "#,
    )?;
    Ok(())
}

/// v6: review queue lookups sort by due date. Strictly additive.
fn migrate_v6(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_cards_due ON cards(dueAt);")?;
    Ok(())
}
