//! Main repository implementation
//!
//! [`Repository`] is the entry point for every checkpoint operation on one
//! store. It owns the store's ledger, file-version tables, hash tracker and
//! snapshot provider, and coordinates them so that each operation either
//! completes or leaves the previous state in place.
//!
//! ## Overview
//!
//! - **Ledger**: allocates versions and records checkpoints
//! - **Snapshot Provider**: clones, materializes and swaps file trees
//! - **Hash Tracker**: digests every file of a new checkpoint, reusing the
//!   parent's digests for files whose size and mtime did not change
//! - **Tree Diff**: compares trees by metadata for diffs and change detection
//!
//! ## Crash Safety
//!
//! Creating a checkpoint copies the live tree into a hidden staging directory
//! first. The ledger row is inserted and the staging directory renamed to its
//! final name inside the same transaction, before commit. Deleting removes the
//! ledger row first and the snapshot second. Either way a crash can only leave
//! an unreferenced snapshot, which is discarded the next time the repository
//! is opened.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use retrace::Repository;
//! use std::path::PathBuf;
//!
//! # fn main() -> retrace::Result<()> {
//! let repo = Repository::init(PathBuf::from("./project"), PathBuf::from("./.retrace"))?;
//!
//! let first = repo.create_checkpoint(Some("Initial".to_string()))?;
//! std::fs::write("./project/notes.txt", "more")?;
//! let second = repo.create_checkpoint(None)?;
//!
//! let diff = repo.diff(first.version, second.version)?;
//! println!("{} changes", diff.summary.total());
//!
//! repo.restore(first.version, true)?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::Checkpoint;
use crate::database::{Database, DATABASE_FILE};
use crate::diff;
use crate::error::{Result, RetraceError};
use crate::ledger::Ledger;
use crate::manifest::{Index, IndexBuilder};
use crate::snapshot::{self, CopySnapshotProvider, Materialized, SnapshotProvider, SwapObserver};
use crate::tracker::{FileVersionStore, HashTracker};
use crate::tree_diff::{self, PathFilter};
use crate::types::*;
use crate::utils;
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// File name of the storage metadata
pub const METADATA_FILE: &str = "metadata.json";

/// Current storage format
const FORMAT_VERSION: u32 = 1;

/// A versioned directory tree
///
/// # Examples
///
/// ```rust,no_run
/// use retrace::{Repository, RepositoryBuilder};
/// use std::path::PathBuf;
///
/// # fn main() -> retrace::Result<()> {
/// // Default configuration
/// let repo = Repository::init(PathBuf::from("./project"), PathBuf::from("./.retrace"))?;
///
/// // Custom configuration
/// let repo = RepositoryBuilder::new()
///     .ignore_patterns(vec!["*.log".to_string()])
///     .hash_workers(8)
///     .build(PathBuf::from("./other"), PathBuf::from("./.retrace-other"))?;
/// # Ok(())
/// # }
/// ```
pub struct Repository {
    /// Effective configuration
    config: StoreConfig,
    /// Checkpoint records
    ledger: Ledger,
    /// Per-checkpoint file digests
    file_versions: FileVersionStore,
    /// Digest computation
    tracker: HashTracker,
    /// Entries skipped by scans
    filter: PathFilter,
    /// On-disk tree states
    provider: Arc<dyn SnapshotProvider>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("store_id", &self.config.store_id)
            .field("root_path", &self.config.root_path)
            .field("storage_path", &self.config.storage_path)
            .field("provider", &self.provider)
            .finish()
    }
}

impl Repository {
    /// Initialize a repository with default settings
    ///
    /// Opens the existing store instead if `storage_path` already holds one.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::PreconditionFailed`] if the root does not exist
    /// - [`RetraceError::InvalidConfiguration`] if root and storage overlap
    pub fn init(root_path: PathBuf, storage_path: PathBuf) -> Result<Self> {
        RepositoryBuilder::new().build(root_path, storage_path)
    }

    /// Open an existing repository
    ///
    /// Settings are read from the storage metadata. The root may differ from
    /// the one the store was created with.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::StorageNotInitialized`] if there is no metadata
    #[instrument(skip(storage_path))]
    pub fn open(root_path: PathBuf, storage_path: PathBuf) -> Result<Self> {
        let metadata = read_metadata(&storage_path)?;
        info!(
            "Opening store {} (created by retrace {})",
            metadata.config.store_id, metadata.retrace_version
        );

        let mut config = metadata.config;
        config.root_path = root_path;
        config.storage_path = storage_path;
        Self::assemble(config, None, Vec::new())
    }

    fn assemble(
        config: StoreConfig,
        provider: Option<Arc<dyn SnapshotProvider>>,
        observers: Vec<Arc<dyn SwapObserver>>,
    ) -> Result<Self> {
        // Opening the copy provider recovers a root left detached by a crash
        let provider: Arc<dyn SnapshotProvider> = match provider {
            Some(provider) => provider,
            None => {
                let copy = CopySnapshotProvider::open(&config.root_path, &config.storage_path)?;
                for observer in observers {
                    copy.add_observer(observer);
                }
                Arc::new(copy)
            }
        };
        if !config.root_path.is_dir() {
            return Err(RetraceError::precondition(format!(
                "root path {:?} does not exist",
                config.root_path
            )));
        }

        let db = Arc::new(Database::open(&config.storage_path.join(DATABASE_FILE))?);
        let ledger = Ledger::new(Arc::clone(&db), config.store_id.clone());
        let file_versions = FileVersionStore::new(db, config.store_id.clone());
        let tracker = HashTracker::new()
            .with_ignored_dirs(config.ignored_dirs.iter().cloned())
            .with_workers(config.hash_workers);
        let filter = PathFilter::new(&config.ignored_dirs, &config.ignore_patterns)?;

        let repo = Self {
            config,
            ledger,
            file_versions,
            tracker,
            filter,
            provider,
        };
        repo.discard_orphaned_snapshots()?;
        Ok(repo)
    }

    /// Remove snapshots that have no ledger row
    ///
    /// A snapshot that cannot be removed stays orphaned until the next open.
    fn discard_orphaned_snapshots(&self) -> Result<()> {
        let known: HashSet<u64> = self.ledger.versions()?.into_iter().collect();
        for version in self.provider.versions_on_disk()? {
            if !known.contains(&version) {
                warn!("Discarding orphaned snapshot v{}", version);
                if let Err(e) = self.provider.discard(version) {
                    warn!("Orphaned snapshot v{} not removed: {}", version, e);
                }
            }
        }
        Ok(())
    }

    /// Effective configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Store identity
    pub fn store_id(&self) -> &StoreId {
        &self.config.store_id
    }

    /// Live root being versioned
    pub fn root_path(&self) -> &Path {
        &self.config.root_path
    }

    /// Create a checkpoint of the live tree
    ///
    /// Digests are computed from the published snapshot. If they cannot be
    /// persisted, the checkpoint row and its snapshot are removed again and
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::Conflict`] if another writer took the version first; safe to retry
    /// - [`RetraceError::PreconditionFailed`] if the live tree is unavailable
    /// - [`RetraceError::VerificationFailed`] if the copied tree does not match the live tree
    pub fn create_checkpoint(&self, message: Option<String>) -> Result<Checkpoint> {
        self.create_checkpoint_with_report(message).map(|(checkpoint, _)| checkpoint)
    }

    /// Create a checkpoint and return the hashing report for its files
    ///
    /// The report tells how many digests were carried over from the parent
    /// checkpoint and how many files had to be read.
    #[instrument(skip(self), fields(store = %self.config.store_id))]
    pub fn create_checkpoint_with_report(
        &self,
        message: Option<String>,
    ) -> Result<(Checkpoint, HashReport)> {
        let start = Instant::now();
        let staged = self.provider.stage_live()?;
        let stats = staged.stats();

        let mut staged = Some(staged);
        let mut published = None;
        let allocated = self
            .ledger
            .allocate_and_create_with(message, Utc::now(), |checkpoint| {
                let staged = staged
                    .take()
                    .ok_or_else(|| RetraceError::internal("staged snapshot already published"))?;
                self.provider.publish(staged, checkpoint.version)?;
                published = Some(checkpoint.version);
                Ok(())
            });

        let checkpoint = match allocated {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                if let Some(version) = published {
                    self.provider.discard(version)?;
                }
                return Err(e);
            }
        };

        let report = match self.record_digests(&checkpoint) {
            Ok(report) => report,
            Err(e) => {
                warn!("Rolling back v{}: {}", checkpoint.version, e);
                self.ledger.delete(checkpoint.version)?;
                self.provider.discard(checkpoint.version)?;
                return Err(e);
            }
        };

        info!(
            "Created checkpoint v{} ({} files, {}, {} hashed, {} reused, {} skipped) in {:?}",
            checkpoint.version,
            stats.file_count,
            utils::format_bytes(stats.total_size),
            report.files_hashed,
            report.files_reused,
            report.failures.len(),
            start.elapsed()
        );
        Ok((checkpoint, report))
    }

    fn record_digests(&self, checkpoint: &Checkpoint) -> Result<HashReport> {
        // A parent deleted since allocation only costs digest reuse
        let previous = match checkpoint.parent_version {
            Some(parent) => match self.file_versions.file_versions(parent) {
                Ok(previous) => Some(previous),
                Err(RetraceError::CheckpointNotFound(_)) => {
                    debug!("Parent v{} is gone, hashing v{} in full", parent, checkpoint.version);
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let snapshot = self.provider.materialize(checkpoint.version)?;
        let report = self.tracker.hash_tree(snapshot.path(), previous.as_deref())?;
        drop(snapshot);

        self.file_versions.record(checkpoint.version, &report.digests)?;
        Ok(report)
    }

    /// List checkpoints, newest first
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        self.ledger.list(limit)
    }

    /// Get a checkpoint by version
    pub fn get(&self, version: u64) -> Result<Checkpoint> {
        self.ledger.get(version)
    }

    /// Newest checkpoint
    pub fn latest(&self) -> Result<Checkpoint> {
        self.ledger.latest()
    }

    /// Delete a checkpoint and its snapshot
    ///
    /// The version number is not handed out again.
    #[instrument(skip(self), fields(store = %self.config.store_id))]
    pub fn delete(&self, version: u64) -> Result<()> {
        self.ledger.delete(version)?;
        if let Err(e) = self.provider.discard(version) {
            warn!("Snapshot v{} left for cleanup on next open: {}", version, e);
        }
        info!("Deleted checkpoint v{}", version);
        Ok(())
    }

    /// Replace the live tree with a checkpoint's state
    ///
    /// With `auto_checkpoint`, the live tree is saved first when it differs
    /// from the latest checkpoint. If the swap then fails, that save is
    /// removed again and the live tree is left as it was.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::CheckpointNotFound`] if the version does not exist
    /// - [`RetraceError::PreconditionFailed`] if its snapshot or the live tree is missing
    /// - [`RetraceError::VerificationFailed`] if the restored copy does not match
    #[instrument(skip(self), fields(store = %self.config.store_id))]
    pub fn restore(&self, version: u64, auto_checkpoint: bool) -> Result<RestoreResult> {
        let start = Instant::now();
        self.ledger.get(version)?;
        if !self.provider.has_version(version) {
            return Err(RetraceError::precondition(format!(
                "snapshot for v{} is missing on disk",
                version
            )));
        }
        self.provider.materialize_live()?;

        let pre_restore_checkpoint = if auto_checkpoint && self.has_changes()? {
            let message = format!("Auto-save before restore to v{}", version);
            let saved = self.create_checkpoint(Some(message))?;
            debug!("Saved live tree as v{} before restoring", saved.version);
            Some(saved.version)
        } else {
            None
        };

        let report = match self.provider.swap_active(version) {
            Ok(report) => report,
            Err(e) => {
                if let Some(saved) = pre_restore_checkpoint {
                    self.delete(saved)?;
                }
                return Err(e);
            }
        };

        let result = RestoreResult {
            version,
            pre_restore_checkpoint,
            files_restored: report.file_count,
            bytes_restored: report.total_size,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Restored v{} ({} files, {})",
            version,
            result.files_restored,
            utils::format_bytes(result.bytes_restored)
        );
        Ok(result)
    }

    /// Materialize one side of a comparison; version 0 is the live tree
    fn side(&self, version: u64) -> Result<Materialized> {
        if version == 0 {
            return Ok(Materialized::new(self.provider.materialize_live()?));
        }
        self.ledger.get(version)?;
        self.provider.materialize(version)
    }

    /// Compare two versions; 0 denotes the live tree on either side
    #[instrument(skip(self), fields(store = %self.config.store_id))]
    pub fn diff(&self, from_version: u64, to_version: u64) -> Result<TreeDiff> {
        let from = self.side(from_version)?;
        let to = self.side(to_version)?;
        let changes = tree_diff::diff_trees(from.path(), to.path(), &self.filter);
        let summary = ChangeSummary::from_changes(&changes);
        debug!(
            "Diff v{} -> v{}: {} added, {} modified, {} deleted",
            from_version, to_version, summary.added, summary.modified, summary.deleted
        );
        Ok(TreeDiff {
            from_version,
            to_version,
            changes,
            summary,
        })
    }

    /// Line diff of one file between two versions; 0 denotes the live tree
    ///
    /// # Errors
    ///
    /// - [`RetraceError::PreconditionFailed`] if `path` is empty, absolute, leaves the
    ///   root or names a directory
    /// - [`RetraceError::FileNotFound`] if the file exists in neither version
    #[instrument(skip(self), fields(store = %self.config.store_id))]
    pub fn diff_file(&self, from_version: u64, to_version: u64, path: &Path) -> Result<FileDiff> {
        let plain = path.components().all(|c| matches!(c, Component::Normal(_)));
        if path.as_os_str().is_empty() || !plain {
            return Err(RetraceError::precondition(format!(
                "{:?} is not a plain relative path",
                path
            )));
        }
        let from = self.side(from_version)?;
        let to = self.side(to_version)?;
        diff::diff_file(
            path,
            from.path(),
            to.path(),
            (from_version, to_version),
            &self.config.diff_options,
        )
    }

    /// Whether the live tree differs from the latest checkpoint
    ///
    /// Compares metadata only; nothing is hashed. A store without
    /// checkpoints has changes unless the live tree is empty.
    pub fn has_changes(&self) -> Result<bool> {
        let live = self.provider.materialize_live()?;
        let latest = match self.ledger.latest() {
            Ok(latest) => latest,
            Err(RetraceError::NoCheckpoints) => {
                return Ok(!tree_diff::scan(&live, &self.filter).is_empty());
            }
            Err(e) => return Err(e),
        };

        let snapshot = self.provider.materialize(latest.version)?;
        let from = tree_diff::scan(snapshot.path(), &self.filter);
        let to = tree_diff::scan(&live, &self.filter);
        Ok(!tree_diff::classify(&from, &to).is_empty())
    }

    /// Versions containing a file with this content hash, ascending
    pub fn find_by_hash(&self, content_hash: &str) -> Result<Vec<u64>> {
        self.file_versions.checkpoints_containing_hash(content_hash)
    }

    /// Digests recorded for a checkpoint, sorted by path
    pub fn file_versions(&self, version: u64) -> Result<Vec<FileVersion>> {
        self.file_versions.file_versions(version)
    }

    /// Build the browsing index for every checkpoint
    pub fn build_index(&self) -> Result<Index> {
        IndexBuilder::new(&self.ledger, self.provider.as_ref(), &self.filter)
            .build(&self.config.root_path)
    }
}

fn read_metadata(storage_path: &Path) -> Result<StorageMetadata> {
    let path = storage_path.join(METADATA_FILE);
    if !path.exists() {
        return Err(RetraceError::StorageNotInitialized(storage_path.to_path_buf()));
    }
    let content = fs::read(&path)?;
    Ok(serde_json::from_slice(&content)?)
}

fn write_metadata(config: &StoreConfig) -> Result<()> {
    fs::create_dir_all(&config.storage_path)?;
    let metadata = StorageMetadata {
        format_version: FORMAT_VERSION,
        retrace_version: env!("CARGO_PKG_VERSION").to_string(),
        created_at: Utc::now(),
        config: config.clone(),
    };
    let content = serde_json::to_vec_pretty(&metadata)?;
    utils::atomic_write(&config.storage_path.join(METADATA_FILE), &content)
}

/// Builder for configuring a [`Repository`]
///
/// # Default Values
///
/// - `store_id`: a random UUID
/// - `ignored_dirs`: version-control metadata, dependency caches and build output
/// - `ignore_patterns`: `.DS_Store`, `*.swp`, `*~`
/// - `hash_workers`: 4
/// - `diff_options`: 3 context lines, 10 MiB size limit
pub struct RepositoryBuilder {
    store_id: Option<StoreId>,
    ignored_dirs: Vec<String>,
    ignore_patterns: Vec<String>,
    hash_workers: usize,
    diff_options: DiffOptions,
    provider: Option<Arc<dyn SnapshotProvider>>,
    observers: Vec<Arc<dyn SwapObserver>>,
}

impl std::fmt::Debug for RepositoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryBuilder")
            .field("store_id", &self.store_id)
            .field("ignored_dirs", &self.ignored_dirs)
            .field("ignore_patterns", &self.ignore_patterns)
            .field("hash_workers", &self.hash_workers)
            .field("diff_options", &self.diff_options)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl RepositoryBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            store_id: None,
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
            ignore_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            hash_workers: DEFAULT_HASH_WORKERS,
            diff_options: DiffOptions::default(),
            provider: None,
            observers: Vec::new(),
        }
    }

    /// Set the store identity
    pub fn store_id(mut self, store_id: StoreId) -> Self {
        self.store_id = Some(store_id);
        self
    }

    /// Replace the directory names skipped when hashing and scanning
    ///
    /// Names are matched exactly against each path component.
    pub fn ignored_dirs(mut self, dirs: Vec<String>) -> Self {
        self.ignored_dirs = dirs;
        self
    }

    /// Replace the file name patterns skipped when scanning
    ///
    /// ```rust
    /// use retrace::RepositoryBuilder;
    ///
    /// let builder = RepositoryBuilder::new()
    ///     .ignore_patterns(vec!["*.log".to_string(), "Thumbs.db".to_string()]);
    /// ```
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    /// Set the hashing pool size (minimum 1)
    pub fn hash_workers(mut self, count: usize) -> Self {
        self.hash_workers = count.max(1);
        self
    }

    /// Set line diff options
    pub fn diff_options(mut self, options: DiffOptions) -> Self {
        self.diff_options = options;
        self
    }

    /// Use a custom snapshot provider instead of full copies
    ///
    /// Swap observers only apply to the built-in provider.
    pub fn snapshot_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a hook notified at each phase of a restore swap
    pub fn swap_observer(mut self, observer: Arc<dyn SwapObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the repository
    ///
    /// An existing store at `storage_path` is opened with its persisted
    /// settings; otherwise a new store is created with this builder's.
    #[instrument(skip(self, storage_path))]
    pub fn build(self, root_path: PathBuf, storage_path: PathBuf) -> Result<Repository> {
        let config = if storage_path.join(METADATA_FILE).exists() {
            let mut config = read_metadata(&storage_path)?.config;
            config.root_path = root_path;
            config.storage_path = storage_path;
            config
        } else {
            // Validate patterns before anything is written to disk
            PathFilter::new(&self.ignored_dirs, &self.ignore_patterns)?;
            let config = StoreConfig {
                store_id: self.store_id.unwrap_or_else(StoreId::generate),
                root_path,
                storage_path,
                ignored_dirs: self.ignored_dirs,
                ignore_patterns: self.ignore_patterns,
                hash_workers: self.hash_workers,
                diff_options: self.diff_options,
            };
            if !config.root_path.is_dir() {
                return Err(RetraceError::precondition(format!(
                    "root path {:?} does not exist",
                    config.root_path
                )));
            }
            snapshot::ensure_disjoint(&config.root_path, &config.storage_path)?;
            info!("Initializing store {} for {:?}", config.store_id, config.root_path);
            write_metadata(&config)?;
            config
        };

        Repository::assemble(config, self.provider, self.observers)
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
