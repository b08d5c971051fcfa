//! Version ledger
//!
//! The ledger is the persistent, per-store record of checkpoints. It is the
//! only component that hands out version numbers.
//!
//! ## Version Allocation
//!
//! A new version is `max(latest existing, high-water mark) + 1`, computed and
//! inserted inside one transaction. Races are settled at commit time by the
//! `UNIQUE(store_id, version)` constraint rather than by locking ahead: when
//! two writers both plan the same version, one commits and the other gets
//! [`RetraceError::Conflict`], which is safe to retry.
//!
//! The high-water mark is bumped with every allocation, so deleting the newest
//! checkpoint never makes its version available again.
//!
//! ## Example
//!
//! ```rust
//! use retrace::database::Database;
//! use retrace::ledger::Ledger;
//! use retrace::types::StoreId;
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! # fn main() -> retrace::Result<()> {
//! let db = Arc::new(Database::open_in_memory()?);
//! let ledger = Ledger::new(db, StoreId::new("docs"));
//!
//! let first = ledger.allocate_and_create(Some("Initial".to_string()), Utc::now())?;
//! let second = ledger.allocate_and_create(None, Utc::now())?;
//! assert_eq!(first.version, 1);
//! assert_eq!(second.parent_version, Some(1));
//! assert_eq!(ledger.latest()?.version, 2);
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::Checkpoint;
use crate::database::Database;
use crate::error::{Result, RetraceError};
use crate::types::StoreId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Persistent record of a store's checkpoints
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Arc<Database>,
    store_id: StoreId,
}

impl Ledger {
    /// Create a ledger view of `store_id` over a shared database
    pub fn new(db: Arc<Database>, store_id: StoreId) -> Self {
        Self { db, store_id }
    }

    /// Store this ledger belongs to
    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Allocate the next version and record a checkpoint for it
    ///
    /// # Errors
    ///
    /// - [`RetraceError::Conflict`] if another writer committed the same version first
    /// - [`RetraceError::Database`] for any other persistence failure
    pub fn allocate_and_create(
        &self,
        message: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        self.allocate_and_create_with(message, created_at, |_| Ok(()))
    }

    /// Allocate the next version, run `before_commit`, then commit
    ///
    /// The closure sees the checkpoint that is about to be committed. If it
    /// returns an error the row is rolled back and the error is returned
    /// unchanged. The repository uses this to publish a snapshot directory in
    /// the same step as the ledger row.
    #[instrument(skip(self, message, before_commit), fields(store = %self.store_id))]
    pub fn allocate_and_create_with<F>(
        &self,
        message: Option<String>,
        created_at: DateTime<Utc>,
        before_commit: F,
    ) -> Result<Checkpoint>
    where
        F: FnOnce(&Checkpoint) -> Result<()>,
    {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let version = next_version(&tx, &self.store_id)?;
        let parent_version = latest_version(&tx, &self.store_id)?;
        let checkpoint = Checkpoint {
            version,
            message,
            created_at,
            parent_version,
        };

        write_checkpoint(&tx, &self.store_id, &checkpoint)?;
        before_commit(&checkpoint)?;
        tx.commit().map_err(|e| write_error(e, version))?;

        info!("Allocated checkpoint v{} in store {}", version, self.store_id);
        Ok(checkpoint)
    }

    /// Get a checkpoint by version
    pub fn get(&self, version: u64) -> Result<Checkpoint> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT version, message, created_at, parent_version
             FROM checkpoints WHERE store_id = ?1 AND version = ?2",
            params![self.store_id.as_str(), version as i64],
            checkpoint_from_row,
        )
        .optional()?
        .ok_or(RetraceError::CheckpointNotFound(version))
    }

    /// List checkpoints, newest first, optionally capped at `limit`
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT version, message, created_at, parent_version
             FROM checkpoints WHERE store_id = ?1
             ORDER BY version DESC LIMIT ?2",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![self.store_id.as_str(), limit], checkpoint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All existing versions in ascending order
    pub fn versions(&self) -> Result<Vec<u64>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT version FROM checkpoints WHERE store_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![self.store_id.as_str()], |row| {
            row.get::<_, i64>(0).map(|v| v as u64)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of checkpoints in the store
    pub fn count(&self) -> Result<usize> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE store_id = ?1",
            params![self.store_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete a checkpoint and, by cascade, its file versions
    pub fn delete(&self, version: u64) -> Result<()> {
        let conn = self.db.conn();
        let removed = conn.execute(
            "DELETE FROM checkpoints WHERE store_id = ?1 AND version = ?2",
            params![self.store_id.as_str(), version as i64],
        )?;
        if removed == 0 {
            return Err(RetraceError::CheckpointNotFound(version));
        }
        debug!("Deleted ledger row for v{}", version);
        Ok(())
    }

    /// Newest checkpoint in the store
    ///
    /// # Errors
    ///
    /// - [`RetraceError::NoCheckpoints`] if the store is empty
    pub fn latest(&self) -> Result<Checkpoint> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT version, message, created_at, parent_version
             FROM checkpoints WHERE store_id = ?1
             ORDER BY version DESC LIMIT 1",
            params![self.store_id.as_str()],
            checkpoint_from_row,
        )
        .optional()?
        .ok_or(RetraceError::NoCheckpoints)
    }
}

/// Next version to hand out for `store_id`
fn next_version(conn: &Connection, store_id: &StoreId) -> Result<u64> {
    let next: i64 = conn.query_row(
        "SELECT MAX(
             COALESCE((SELECT MAX(version) FROM checkpoints WHERE store_id = ?1), 0),
             COALESCE((SELECT last_version FROM stores WHERE store_id = ?1), 0)
         ) + 1",
        params![store_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(next as u64)
}

fn latest_version(conn: &Connection, store_id: &StoreId) -> Result<Option<u64>> {
    let latest: Option<i64> = conn.query_row(
        "SELECT MAX(version) FROM checkpoints WHERE store_id = ?1",
        params![store_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(latest.map(|v| v as u64))
}

/// Insert the checkpoint row and raise the store's high-water mark
fn write_checkpoint(conn: &Connection, store_id: &StoreId, checkpoint: &Checkpoint) -> Result<()> {
    let version = checkpoint.version as i64;
    conn.execute(
        "INSERT INTO checkpoints (store_id, version, message, created_at, parent_version)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            store_id.as_str(),
            version,
            checkpoint.message,
            checkpoint.created_at.to_rfc3339(),
            checkpoint.parent_version.map(|v| v as i64),
        ],
    )
    .map_err(|e| write_error(e, checkpoint.version))?;

    conn.execute(
        "INSERT INTO stores (store_id, last_version) VALUES (?1, ?2)
         ON CONFLICT(store_id) DO UPDATE
         SET last_version = MAX(last_version, excluded.last_version)",
        params![store_id.as_str(), version],
    )
    .map_err(|e| write_error(e, checkpoint.version))?;

    Ok(())
}

/// Map a failed allocation write to `Conflict` when another writer won
fn write_error(err: rusqlite::Error, version: u64) -> RetraceError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            debug!("Allocation of v{} lost a race: {}", version, err);
            RetraceError::Conflict { version }
        }
        _ => RetraceError::Database(err),
    }
}

/// Internal row id of a checkpoint, used by the file-version tables
pub(crate) fn checkpoint_row_id(
    conn: &Connection,
    store_id: &StoreId,
    version: u64,
) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM checkpoints WHERE store_id = ?1 AND version = ?2",
        params![store_id.as_str(), version as i64],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(RetraceError::CheckpointNotFound(version))
}

fn checkpoint_from_row(row: &Row) -> rusqlite::Result<Checkpoint> {
    let version: i64 = row.get(0)?;
    let message: Option<String> = row.get(1)?;
    let created_at: String = row.get(2)?;
    let parent_version: Option<i64> = row.get(3)?;

    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                2,
                "created_at".to_string(),
                rusqlite::types::Type::Text,
            )
        })?;

    Ok(Checkpoint {
        version: version as u64,
        message,
        created_at,
        parent_version: parent_version.map(|v| v as u64),
    })
}
