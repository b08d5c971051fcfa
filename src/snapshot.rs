//! Snapshot provider
//!
//! The provider owns the on-disk state behind every checkpoint. The rest of
//! the crate only talks to it through [`SnapshotProvider`], so any mechanism
//! that keeps size, modification time, permission bits and symlink targets
//! intact can sit behind it (copy-on-write clones, a block store, or the full
//! recursive copy implemented here).
//!
//! ## Layout
//!
//! ```text
//! storage_root/
//! ├── metadata.json
//! ├── ledger.db
//! └── snapshots/
//!     ├── v00000001/        # published snapshot
//!     ├── v00000002/
//!     ├── .staging-XXXX/    # copy in progress, swept on open
//!     └── .trash-XXXX/      # discarded snapshot being removed, swept on open
//! ```
//!
//! A snapshot only appears under its final `vNNNNNNNN` name through a single
//! rename, so a crash never leaves a half-written directory that looks
//! published.
//!
//! ## Swapping
//!
//! [`CopySnapshotProvider::swap_active`] replaces the live tree as follows:
//!
//! 1. copy the snapshot into a hidden sibling of the live root
//! 2. verify file count and total size of the copy
//! 3. rename the live root aside
//! 4. rename the copy into place
//! 5. verify again, then remove the old tree
//!
//! Any failure after step 3 renames the old tree back. If the process dies
//! between steps 3 and 4, the next [`CopySnapshotProvider::open`] finds the
//! live root missing and restores it from the backup.

use crate::error::{Result, RetraceError};
use crate::types::SwapReport;
use crate::utils::{self, TreeStats};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, trace, warn};

/// Directory under the storage root holding published snapshots
pub const SNAPSHOTS_DIR: &str = "snapshots";

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Source state for [`SnapshotProvider::clone_version`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// The current working tree
    Live,
    /// A published checkpoint
    Version(u64),
}

/// A navigable directory for one checkpoint
///
/// Dropping the guard runs its release action exactly once. Two guards are
/// fully independent: releasing one never waits on the other.
pub struct Materialized {
    path: PathBuf,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Materialized {
    /// A materialization that needs no cleanup
    pub fn new(path: PathBuf) -> Self {
        Self { path, release: None }
    }

    /// A materialization with a release action run on drop
    pub fn with_release<F>(path: PathBuf, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            path,
            release: Some(Box::new(release)),
        }
    }

    /// Root of the materialized tree
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for Materialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materialized")
            .field("path", &self.path)
            .field("pending_release", &self.release.is_some())
            .finish()
    }
}

impl Drop for Materialized {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            trace!("Releasing materialized tree {:?}", self.path);
            release();
        }
    }
}

/// Hidden working directory removed on drop, read-only subdirectories included
#[derive(Debug)]
struct ScratchDir(TempDir);

impl ScratchDir {
    fn new_in(parent: &Path, prefix: &str) -> Result<Self> {
        Ok(Self(tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?))
    }

    fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = utils::remove_tree(self.0.path()) {
            warn!("Leaving {:?} for the next sweep: {}", self.0.path(), e);
        }
    }
}

/// A copy of the live tree waiting for a version number
///
/// Dropping it without publishing removes the copy.
#[derive(Debug)]
pub struct StagedSnapshot {
    dir: ScratchDir,
    stats: TreeStats,
}

impl StagedSnapshot {
    /// Location of the staged copy
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// File count and total size of the staged copy
    pub fn stats(&self) -> TreeStats {
        self.stats
    }
}

/// Phase reached by an in-progress swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    /// The replacement tree is copied and verified; live is untouched
    Staged,
    /// The live tree has been moved aside
    LiveDetached,
    /// The replacement tree is in place and verified
    Swapped,
}

/// Hook notified as a swap progresses
///
/// Returning an error aborts the swap and rolls the live tree back.
pub trait SwapObserver: Send + Sync {
    /// Called when the swap for `version` reaches `phase`
    fn on_phase(&self, phase: SwapPhase, version: u64) -> Result<()>;
}

/// Operations the repository needs from the snapshot mechanism
pub trait SnapshotProvider: Send + Sync + fmt::Debug {
    /// Produce a navigable directory for a checkpoint's recorded state
    fn materialize(&self, version: u64) -> Result<Materialized>;

    /// The current working tree; callers must not mutate it while reading
    fn materialize_live(&self) -> Result<PathBuf>;

    /// Duplicate `source` into the slot for `destination`
    fn clone_version(&self, source: SnapshotSource, destination: u64) -> Result<TreeStats>;

    /// Replace the live tree with `version`'s state, all or nothing
    fn swap_active(&self, version: u64) -> Result<SwapReport>;

    /// Copy the live tree into an unpublished staging area
    fn stage_live(&self) -> Result<StagedSnapshot>;

    /// Make a staged copy visible as `version`
    fn publish(&self, staged: StagedSnapshot, version: u64) -> Result<()>;

    /// Remove the snapshot for `version`; a missing snapshot is not an error
    fn discard(&self, version: u64) -> Result<()>;

    /// Whether a snapshot exists for `version`
    fn has_version(&self, version: u64) -> bool;

    /// Versions with a published snapshot, ascending
    fn versions_on_disk(&self) -> Result<Vec<u64>>;
}

/// Snapshot provider backed by full recursive copies
pub struct CopySnapshotProvider {
    root: PathBuf,
    snapshots_dir: PathBuf,
    observers: Mutex<Vec<Arc<dyn SwapObserver>>>,
}

impl fmt::Debug for CopySnapshotProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopySnapshotProvider")
            .field("root", &self.root)
            .field("snapshots_dir", &self.snapshots_dir)
            .field("observers", &format!("<{} observers>", self.observers.lock().len()))
            .finish()
    }
}

impl CopySnapshotProvider {
    /// Open the provider for a live root and storage directory
    ///
    /// Recovers a live tree left detached by an interrupted swap, then sweeps
    /// leftover staging, trash and swap directories. Leftovers that cannot be
    /// removed are logged and retried on the next open.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::InvalidConfiguration`] if one directory contains the other
    /// - [`RetraceError::PreconditionFailed`] if the live root does not exist
    pub fn open(root: &Path, storage: &Path) -> Result<Self> {
        let root = canonical_root(root)?;

        let provider = Self {
            root: root.clone(),
            snapshots_dir: PathBuf::new(),
            observers: Mutex::new(Vec::new()),
        };
        provider.recover_interrupted_swap()?;

        if !root.is_dir() {
            return Err(RetraceError::precondition(format!(
                "live root {:?} is not available",
                root
            )));
        }

        ensure_disjoint(&root, storage)?;
        fs::create_dir_all(storage)?;
        let storage = storage.canonicalize()?;

        let snapshots_dir = storage.join(SNAPSHOTS_DIR);
        fs::create_dir_all(&snapshots_dir)?;

        let provider = Self {
            snapshots_dir,
            ..provider
        };
        if let Err(e) = provider.sweep() {
            warn!("Sweeping leftovers in {:?} failed: {}", provider.snapshots_dir, e);
        }
        debug!("Snapshot provider ready at {:?}", provider.snapshots_dir);
        Ok(provider)
    }

    /// Register a swap observer
    pub fn add_observer(&self, observer: Arc<dyn SwapObserver>) {
        self.observers.lock().push(observer);
    }

    /// Live root this provider swaps
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a published snapshot
    pub fn snapshot_path(&self, version: u64) -> PathBuf {
        self.snapshots_dir.join(format!("v{:08}", version))
    }

    fn swap_sibling(&self, kind: &str) -> Result<(PathBuf, String)> {
        let parent = self
            .root
            .parent()
            .ok_or_else(|| RetraceError::internal("live root has no parent"))?;
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok((parent.to_path_buf(), format!(".{}.retrace-{}", name, kind)))
    }

    fn backup_path(&self) -> Result<PathBuf> {
        let (parent, name) = self.swap_sibling("backup")?;
        Ok(parent.join(name))
    }

    fn recover_interrupted_swap(&self) -> Result<()> {
        let backup = self.backup_path()?;
        if !backup.exists() {
            return Ok(());
        }
        if self.root.exists() {
            debug!("Removing stale swap backup {:?}", backup);
            if let Err(e) = utils::remove_tree(&backup) {
                warn!("Failed to remove stale swap backup {:?}: {}", backup, e);
            }
        } else {
            warn!("Live root missing after interrupted swap, restoring from {:?}", backup);
            fs::rename(&backup, &self.root)?;
        }
        Ok(())
    }

    /// Remove leftover staging, trash and swap directories
    ///
    /// Keeps going past entries that cannot be removed and reports the first
    /// failure.
    fn sweep(&self) -> Result<()> {
        let mut leftovers = Vec::new();
        for entry in fs::read_dir(&self.snapshots_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                leftovers.push(entry.path());
            }
        }

        let (parent, swap_prefix) = self.swap_sibling("swap")?;
        for entry in fs::read_dir(&parent)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&swap_prefix) {
                leftovers.push(entry.path());
            }
        }

        let mut first_error = None;
        for path in leftovers {
            info!("Removing leftover {:?}", path);
            if let Err(e) = utils::remove_tree(&path) {
                warn!("Could not remove leftover {:?}: {}", path, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn staging_dir(&self) -> Result<ScratchDir> {
        ScratchDir::new_in(&self.snapshots_dir, STAGING_PREFIX)
    }

    fn notify(&self, phase: SwapPhase, version: u64) -> Result<()> {
        let observers: Vec<_> = self.observers.lock().iter().cloned().collect();
        for observer in observers {
            observer.on_phase(phase, version)?;
        }
        Ok(())
    }

    fn live_path(&self) -> Result<PathBuf> {
        if self.root.is_dir() {
            Ok(self.root.clone())
        } else {
            Err(RetraceError::precondition(format!(
                "live root {:?} is not available",
                self.root
            )))
        }
    }

    fn source_path(&self, source: SnapshotSource) -> Result<PathBuf> {
        match source {
            SnapshotSource::Live => self.live_path(),
            SnapshotSource::Version(version) => self.published(version),
        }
    }

    fn published(&self, version: u64) -> Result<PathBuf> {
        let path = self.snapshot_path(version);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(RetraceError::precondition(format!(
                "snapshot for v{} is missing on disk",
                version
            )))
        }
    }

    /// Copy `source` into `dest` and check the result against the source
    fn copy_verified(source: &Path, dest: &Path) -> Result<TreeStats> {
        let expected = utils::tree_stats(source)?;
        utils::copy_tree(source, dest)?;
        verify_stats(dest, expected)?;
        Ok(expected)
    }

    /// Undo a swap after the live root has been detached
    fn roll_back(&self, backup: &Path, version: u64) -> Result<()> {
        warn!("Rolling back swap to v{}", version);
        if self.root.exists() {
            let trash = ScratchDir::new_in(&self.snapshots_dir, TRASH_PREFIX)?;
            let displaced = trash.path().join("displaced");
            fs::rename(&self.root, &displaced)?;
            fs::rename(backup, &self.root)?;
            drop(trash);
        } else {
            fs::rename(backup, &self.root)?;
        }
        Ok(())
    }
}

/// Canonical live root, resolved through its parent when the root itself is
/// missing after an interrupted swap
fn canonical_root(root: &Path) -> Result<PathBuf> {
    if root.exists() {
        return Ok(root.canonicalize()?);
    }
    let name = root
        .file_name()
        .ok_or_else(|| RetraceError::InvalidConfiguration(format!("{:?} has no name", root)))?;
    let parent = match root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(parent.canonicalize()?.join(name))
}

/// Reject a storage directory inside the live root, or the reverse
///
/// Neither path has to exist; missing components are resolved against their
/// nearest existing ancestor.
pub(crate) fn ensure_disjoint(root: &Path, storage: &Path) -> Result<()> {
    let root = resolve_existing_prefix(root)?;
    let storage = resolve_existing_prefix(storage)?;
    if storage.starts_with(&root) || root.starts_with(&storage) {
        return Err(RetraceError::InvalidConfiguration(format!(
            "storage {:?} and root {:?} must not contain each other",
            storage, root
        )));
    }
    Ok(())
}

fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut rest = Vec::new();
    let mut existing = path.as_path();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    resolved.extend(rest.iter().rev());
    Ok(resolved)
}

fn verify_stats(path: &Path, expected: TreeStats) -> Result<()> {
    let actual = utils::tree_stats(path)?;
    if actual != expected {
        return Err(RetraceError::verification(format!(
            "expected {} files ({} bytes) in {:?}, found {} files ({} bytes)",
            expected.file_count, expected.total_size, path, actual.file_count, actual.total_size
        )));
    }
    Ok(())
}

impl SnapshotProvider for CopySnapshotProvider {
    fn materialize(&self, version: u64) -> Result<Materialized> {
        let path = self.published(version)?;
        trace!("Materialized v{} at {:?}", version, path);
        Ok(Materialized::new(path))
    }

    fn materialize_live(&self) -> Result<PathBuf> {
        self.live_path()
    }

    fn clone_version(&self, source: SnapshotSource, destination: u64) -> Result<TreeStats> {
        let source_path = self.source_path(source)?;
        let dest = self.snapshot_path(destination);
        if dest.exists() {
            return Err(RetraceError::precondition(format!(
                "snapshot for v{} already exists",
                destination
            )));
        }

        let staging = self.staging_dir()?;
        let stats = Self::copy_verified(&source_path, staging.path())?;
        fs::rename(staging.path(), &dest)?;
        debug!("Cloned {:?} into v{} ({} files)", source, destination, stats.file_count);
        Ok(stats)
    }

    fn swap_active(&self, version: u64) -> Result<SwapReport> {
        let snapshot = self.published(version)?;
        self.live_path()?;

        let (parent, swap_prefix) = self.swap_sibling("swap-")?;
        let staged = ScratchDir::new_in(&parent, &swap_prefix)?;
        let expected = Self::copy_verified(&snapshot, staged.path())?;
        self.notify(SwapPhase::Staged, version)?;

        let backup = self.backup_path()?;
        utils::remove_tree(&backup)?;
        fs::rename(&self.root, &backup)?;
        debug!("Detached live tree to {:?}", backup);

        let installed = self
            .notify(SwapPhase::LiveDetached, version)
            .and_then(|_| Ok(fs::rename(staged.path(), &self.root)?))
            .and_then(|_| verify_stats(&self.root, expected))
            .and_then(|_| self.notify(SwapPhase::Swapped, version));

        if let Err(e) = installed {
            self.roll_back(&backup, version)?;
            return Err(e);
        }

        if let Err(e) = utils::remove_tree(&backup) {
            warn!("Failed to remove swap backup {:?}: {}", backup, e);
        }

        info!(
            "Swapped live tree to v{} ({} files, {})",
            version,
            expected.file_count,
            utils::format_bytes(expected.total_size)
        );
        Ok(SwapReport {
            file_count: expected.file_count,
            total_size: expected.total_size,
        })
    }

    fn stage_live(&self) -> Result<StagedSnapshot> {
        let live = self.live_path()?;
        let dir = self.staging_dir()?;
        let stats = Self::copy_verified(&live, dir.path())?;
        trace!("Staged live tree in {:?}", dir.path());
        Ok(StagedSnapshot { dir, stats })
    }

    fn publish(&self, staged: StagedSnapshot, version: u64) -> Result<()> {
        let dest = self.snapshot_path(version);
        if dest.exists() {
            return Err(RetraceError::precondition(format!(
                "snapshot for v{} already exists",
                version
            )));
        }
        fs::rename(staged.path(), &dest)?;
        debug!("Published snapshot v{}", version);
        Ok(())
    }

    fn discard(&self, version: u64) -> Result<()> {
        let path = self.snapshot_path(version);
        if !path.exists() {
            return Ok(());
        }
        let trash = ScratchDir::new_in(&self.snapshots_dir, TRASH_PREFIX)?;
        fs::rename(&path, trash.path().join("snapshot"))?;
        utils::remove_tree(trash.path())?;
        debug!("Discarded snapshot v{}", version);
        Ok(())
    }

    fn has_version(&self, version: u64) -> bool {
        self.snapshot_path(version).is_dir()
    }

    fn versions_on_disk(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.snapshots_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(version) = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}
