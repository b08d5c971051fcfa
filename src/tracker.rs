//! Content hash tracking
//!
//! The tracker computes a SHA-256 digest for every regular file under a
//! materialized tree and persists those digests per checkpoint.
//!
//! ## Incremental Hashing
//!
//! Hashing accepts the previous checkpoint's [`FileVersion`]s as a baseline.
//! When a file's current `(size, modification time)` pair equals the recorded
//! pair exactly, the recorded digest is reused and the file is never opened.
//! Recorded digests are never recomputed, even when used this way.
//!
//! ## Parallelism
//!
//! The file list is enumerated up front and then hashed on a fixed-size rayon
//! pool (4 workers by default). Every file owns one result slot, so workers
//! never share mutable state. Results are sorted by path afterwards, which
//! makes the output independent of scheduling.
//!
//! ## Failure Handling
//!
//! A file that cannot be read (permission denied, removed mid-pass) is
//! recorded in [`HashReport::failures`] and left out of the digest list. It
//! never aborts the pass. Persisting digests, on the other hand, is all or
//! nothing: [`FileVersionStore::record`] runs in a single transaction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use retrace::tracker::HashTracker;
//! use std::path::Path;
//!
//! # fn main() -> retrace::Result<()> {
//! let tracker = HashTracker::new().with_workers(8);
//! let first = tracker.hash_tree(Path::new("./project"), None)?;
//! println!("{} files, {} failures", first.digests.len(), first.failures.len());
//! # Ok(())
//! # }
//! ```

use crate::database::Database;
use crate::error::{Result, RetraceError};
use crate::ledger::checkpoint_row_id;
use crate::types::{
    FileDigest, FileVersion, HashFailure, HashReport, StoreId, DEFAULT_HASH_WORKERS,
    DEFAULT_IGNORED_DIRS,
};
use crate::utils;
use rayon::prelude::*;
use rusqlite::{params, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Computes per-file digests for a tree
#[derive(Debug, Clone)]
pub struct HashTracker {
    /// Directory names skipped during enumeration (exact match)
    ignored_dirs: HashSet<String>,
    /// Size of the worker pool
    workers: usize,
}

/// What happened to a single file slot
#[derive(Debug)]
enum SlotOutcome {
    Hashed(FileDigest, u64),
    Reused(FileDigest),
    Failed(HashFailure),
}

impl HashTracker {
    /// Create a tracker with the default ignored directories and 4 workers
    pub fn new() -> Self {
        Self {
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
            workers: DEFAULT_HASH_WORKERS,
        }
    }

    /// Replace the set of ignored directory names
    pub fn with_ignored_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the worker pool size (minimum 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Worker pool size
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enumerate regular files under `root` as relative paths
    ///
    /// Directories whose name is in the ignore set are pruned. Entries that
    /// cannot be read are returned as failures.
    pub fn enumerate(&self, root: &Path) -> (Vec<PathBuf>, Vec<HashFailure>) {
        let mut files = Vec::new();
        let mut failures = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && self
                        .ignored_dirs
                        .contains(entry.file_name().to_string_lossy().as_ref()))
            });

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if let Ok(relative) = entry.path().strip_prefix(root) {
                        files.push(relative.to_path_buf());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| p.strip_prefix(root).ok())
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    warn!("Skipping unreadable entry {:?}: {}", path, e);
                    failures.push(HashFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        (files, failures)
    }

    /// Enumerate and hash every regular file under `root`
    ///
    /// `previous` is the baseline for digest reuse, normally the parent
    /// checkpoint's file versions.
    pub fn hash_tree(&self, root: &Path, previous: Option<&[FileVersion]>) -> Result<HashReport> {
        let (files, enumerate_failures) = self.enumerate(root);
        let mut report = self.hash_files(root, &files, previous)?;
        if !enumerate_failures.is_empty() {
            report.failures.extend(enumerate_failures);
            report.failures.sort_by(|a, b| a.path.cmp(&b.path));
        }
        Ok(report)
    }

    /// Hash a fixed list of files relative to `root`
    ///
    /// The pass is synchronous: it returns only once every slot is filled.
    pub fn hash_files(
        &self,
        root: &Path,
        files: &[PathBuf],
        previous: Option<&[FileVersion]>,
    ) -> Result<HashReport> {
        let start = Instant::now();
        let baseline: HashMap<&Path, &FileVersion> = previous
            .unwrap_or_default()
            .iter()
            .map(|fv| (fv.path.as_path(), fv))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| RetraceError::ThreadPool(e.to_string()))?;

        let mut slots: Vec<Option<SlotOutcome>> = (0..files.len()).map(|_| None).collect();
        pool.install(|| {
            slots
                .par_iter_mut()
                .zip(files.par_iter())
                .for_each(|(slot, relative)| {
                    let recorded = baseline.get(relative.as_path()).copied();
                    *slot = Some(hash_one(root, relative, recorded));
                });
        });

        let mut report = HashReport::default();
        for outcome in slots.into_iter().flatten() {
            match outcome {
                SlotOutcome::Hashed(digest, bytes) => {
                    report.files_hashed += 1;
                    report.bytes_read += bytes;
                    report.digests.push(digest);
                }
                SlotOutcome::Reused(digest) => {
                    report.files_reused += 1;
                    report.digests.push(digest);
                }
                SlotOutcome::Failed(failure) => report.failures.push(failure),
            }
        }

        report.digests.sort_by(|a, b| a.path.cmp(&b.path));
        report.failures.sort_by(|a, b| a.path.cmp(&b.path));
        report.duration_ms = start.elapsed().as_millis() as u64;

        debug!(
            "Hashed {} files ({} reused, {} failed, {}) in {}ms",
            report.files_hashed,
            report.files_reused,
            report.failures.len(),
            utils::format_bytes(report.bytes_read),
            report.duration_ms
        );

        Ok(report)
    }
}

impl Default for HashTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_one(root: &Path, relative: &Path, previous: Option<&FileVersion>) -> SlotOutcome {
    let full_path = root.join(relative);
    let fail = |error: String| {
        warn!("Failed to hash {:?}: {}", relative, error);
        SlotOutcome::Failed(HashFailure {
            path: relative.to_path_buf(),
            error,
        })
    };

    let metadata = match utils::get_file_metadata(&full_path) {
        Ok(metadata) => metadata,
        Err(e) => return fail(e.to_string()),
    };
    if !metadata.is_file {
        return fail("no longer a regular file".to_string());
    }

    if let Some(prev) = previous {
        if prev.size == metadata.size && prev.modified == metadata.modified {
            trace!("Reusing digest for {:?}", relative);
            return SlotOutcome::Reused(FileDigest {
                path: relative.to_path_buf(),
                content_hash: prev.content_hash.clone(),
                size: metadata.size,
                modified: metadata.modified,
                reused: true,
            });
        }
    }

    match utils::hash_file_content(&full_path) {
        Ok((content_hash, bytes_read)) => SlotOutcome::Hashed(
            FileDigest {
                path: relative.to_path_buf(),
                content_hash,
                size: metadata.size,
                modified: metadata.modified,
                reused: false,
            },
            bytes_read,
        ),
        Err(e) => fail(e.to_string()),
    }
}

/// Persistent per-checkpoint file digests
#[derive(Debug, Clone)]
pub struct FileVersionStore {
    db: Arc<Database>,
    store_id: StoreId,
}

impl FileVersionStore {
    /// Create a view of `store_id`'s file versions over a shared database
    pub fn new(db: Arc<Database>, store_id: StoreId) -> Self {
        Self { db, store_id }
    }

    /// Persist digests for a checkpoint in one transaction
    ///
    /// Either every row is written or none is.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::CheckpointNotFound`] if the checkpoint does not exist
    /// - [`RetraceError::Database`] if any insert fails (including a duplicate path)
    pub fn record(&self, version: u64, digests: &[FileDigest]) -> Result<usize> {
        let mut conn = self.db.conn();
        // Write lock before the row lookup
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let checkpoint_id = checkpoint_row_id(&tx, &self.store_id, version)?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO file_versions (checkpoint_id, path, content_hash, size, modified_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for digest in digests {
                stmt.execute(params![
                    checkpoint_id,
                    digest.path.to_string_lossy(),
                    digest.content_hash,
                    digest.size as i64,
                    utils::datetime_to_nanos(&digest.modified),
                ])?;
            }
        }

        tx.commit()?;
        info!("Recorded {} file versions for v{}", digests.len(), version);
        Ok(digests.len())
    }

    /// File versions of a checkpoint, sorted by path
    pub fn file_versions(&self, version: u64) -> Result<Vec<FileVersion>> {
        let conn = self.db.conn();
        let checkpoint_id = checkpoint_row_id(&conn, &self.store_id, version)?;
        let mut stmt = conn.prepare(
            "SELECT path, content_hash, size, modified_ns FROM file_versions
             WHERE checkpoint_id = ?1 ORDER BY path ASC",
        )?;
        let rows = stmt.query_map(params![checkpoint_id], |row| {
            Ok(FileVersion {
                checkpoint_version: version,
                path: PathBuf::from(row.get::<_, String>(0)?),
                content_hash: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
                modified: utils::nanos_to_datetime(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Versions containing a file with the given content hash, ascending
    pub fn checkpoints_containing_hash(&self, content_hash: &str) -> Result<Vec<u64>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.version FROM file_versions f
             JOIN checkpoints c ON c.id = f.checkpoint_id
             WHERE c.store_id = ?1 AND f.content_hash = ?2
             ORDER BY c.version ASC",
        )?;
        let rows = stmt.query_map(params![self.store_id.as_str(), content_hash], |row| {
            row.get::<_, i64>(0).map(|v| v as u64)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of files recorded for a checkpoint
    pub fn count_files(&self, version: u64) -> Result<usize> {
        let conn = self.db.conn();
        let checkpoint_id = checkpoint_row_id(&conn, &self.store_id, version)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_versions WHERE checkpoint_id = ?1",
            params![checkpoint_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Total size of the files recorded for a checkpoint
    pub fn total_size(&self, version: u64) -> Result<u64> {
        let conn = self.db.conn();
        let checkpoint_id = checkpoint_row_id(&conn, &self.store_id, version)?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM file_versions WHERE checkpoint_id = ?1",
            params![checkpoint_id],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}
