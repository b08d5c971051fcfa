//! Database connection and schema management
//!
//! The ledger and the hash tracker share one SQLite database per storage
//! directory. The schema carries the constraints the rest of the crate leans
//! on:
//!
//! - `UNIQUE(store_id, version)` on checkpoints, checked at commit time, so two
//!   racing allocations cannot both succeed
//! - `UNIQUE(checkpoint_id, path)` on file versions
//! - `ON DELETE CASCADE` from file versions to their checkpoint
//! - a per-store high-water mark so deleted versions are never handed out again

use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// File name of the ledger database inside the storage directory
pub const DATABASE_FILE: &str = "ledger.db";

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper
///
/// Owns one SQLite connection behind a mutex so the ledger and tracker can
/// share it across threads.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (or create) the database at `path` and initialize the schema
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL keeps readers from blocking the single writer.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Journal mode: {}", mode);
        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.init_schema()?;
        info!("Opened ledger database at {:?}", path);
        Ok(db)
    }

    /// Open an in-memory database for testing
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Location of the database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock the underlying connection
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stores (
                store_id TEXT PRIMARY KEY,
                last_version INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                store_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                message TEXT,
                created_at TEXT NOT NULL,
                parent_version INTEGER,
                UNIQUE(store_id, version)
            );

            CREATE TABLE IF NOT EXISTS file_versions (
                checkpoint_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                modified_ns INTEGER NOT NULL,
                UNIQUE(checkpoint_id, path),
                FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_file_versions_hash
                ON file_versions(content_hash);
            "#,
        )?;

        debug!("Ledger schema ready");
        Ok(())
    }
}
