//! Core data types used throughout the Retrace library
//!
//! This module contains fundamental data structures that are shared across
//! different components of the library.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **File System State**: `FileInfo`, `FileVersion`, `FileDigest` - files and their metadata
//! - **Operations**: `Change`, `TreeDiff`, `HashReport`, `RestoreResult` - results of operations
//! - **Configuration**: `StoreConfig`, `StorageMetadata` - repository parameters
//!
//! ## Examples
//!
//! ```rust
//! use retrace::types::{ChangeKind, ChangeSummary};
//!
//! let kinds = [ChangeKind::Added, ChangeKind::Added, ChangeKind::Deleted];
//! let summary = ChangeSummary::from_kinds(kinds.iter().copied());
//! assert_eq!(summary.added, 2);
//! assert_eq!(summary.deleted, 1);
//! assert_eq!(summary.total(), 3);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identity of a store
///
/// Every ledger row is keyed by the store it belongs to, so several stores can
/// share one database file without seeing each other's checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of one tracked entity in a materialized tree
///
/// Only regular files and symlinks are tracked. Directories are implied by
/// the paths beneath them and never get an entry of their own, so
/// `is_directory` is false in every scan and manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the tree root
    pub path: PathBuf,
    /// Size in bytes (link length for symlinks)
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Unix permission bits
    pub permissions: u32,
    /// Whether this entry is a directory
    pub is_directory: bool,
    /// Whether this entry is a symbolic link
    pub is_symlink: bool,
    /// Target of the symlink, if `is_symlink`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<PathBuf>,
}

/// Classification of a single path-level change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only on the "to" side
    Added,
    /// Present on both sides with differing size, mtime or symlink target
    Modified,
    /// Present only on the "from" side
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => f.write_str("added"),
            ChangeKind::Modified => f.write_str("modified"),
            ChangeKind::Deleted => f.write_str("deleted"),
        }
    }
}

/// A classified change between two trees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Path relative to both roots
    pub path: PathBuf,
    /// What happened to the path
    pub kind: ChangeKind,
    /// Entry on the "from" side (absent for `Added`)
    pub old_info: Option<FileInfo>,
    /// Entry on the "to" side (absent for `Deleted`)
    pub new_info: Option<FileInfo>,
}

/// Added/modified/deleted counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Number of added paths
    pub added: usize,
    /// Number of modified paths
    pub modified: usize,
    /// Number of deleted paths
    pub deleted: usize,
}

impl ChangeSummary {
    /// Tally a sequence of change kinds
    pub fn from_kinds(kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        let mut summary = Self::default();
        for kind in kinds {
            match kind {
                ChangeKind::Added => summary.added += 1,
                ChangeKind::Modified => summary.modified += 1,
                ChangeKind::Deleted => summary.deleted += 1,
            }
        }
        summary
    }

    /// Tally a change list
    pub fn from_changes(changes: &[Change]) -> Self {
        Self::from_kinds(changes.iter().map(|c| c.kind))
    }

    /// Total number of changed paths
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Result of comparing two versions
///
/// Version `0` denotes the live tree on either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDiff {
    /// Source version (0 = live)
    pub from_version: u64,
    /// Target version (0 = live)
    pub to_version: u64,
    /// Changes sorted by path
    pub changes: Vec<Change>,
    /// Counts per change kind
    pub summary: ChangeSummary,
}

impl TreeDiff {
    /// Paths with the given change kind, in path order
    pub fn paths(&self, kind: ChangeKind) -> Vec<PathBuf> {
        self.changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.path.clone())
            .collect()
    }

    /// Aggregated display status of a directory (see [`crate::tree_diff::directory_status`])
    pub fn directory_status(&self, dir: &std::path::Path) -> Option<ChangeKind> {
        crate::tree_diff::directory_status(&self.changes, dir)
    }
}

/// A digest computed (or reused) for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Path relative to the hashed root
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the file content
    pub content_hash: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time at hashing
    pub modified: DateTime<Utc>,
    /// Whether the digest was taken from the previous checkpoint without reading bytes
    pub reused: bool,
}

/// A persisted per-checkpoint file digest
///
/// Write-once; removed together with its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Checkpoint the row belongs to
    pub checkpoint_version: u64,
    /// Path relative to the store root
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the file content
    pub content_hash: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time at capture
    pub modified: DateTime<Utc>,
}

/// A file the tracker could not hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashFailure {
    /// Path relative to the hashed root
    pub path: PathBuf,
    /// Rendered error
    pub error: String,
}

/// Outcome of a hashing pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashReport {
    /// Successfully hashed files, sorted by path
    pub digests: Vec<FileDigest>,
    /// Files that failed, sorted by path
    pub failures: Vec<HashFailure>,
    /// Number of files whose bytes were read
    pub files_hashed: usize,
    /// Number of files whose digest was reused
    pub files_reused: usize,
    /// Total bytes streamed through the digest
    pub bytes_read: u64,
    /// Duration of the pass in milliseconds
    pub duration_ms: u64,
}

impl HashReport {
    /// Sum of the sizes of all hashed files
    pub fn total_size(&self) -> u64 {
        self.digests.iter().map(|d| d.size).sum()
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Version that is now live
    pub version: u64,
    /// Checkpoint taken automatically before restoring, if any
    pub pre_restore_checkpoint: Option<u64>,
    /// Number of files in the restored tree
    pub files_restored: usize,
    /// Total size of the restored tree
    pub bytes_restored: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Result of a successful swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReport {
    /// Entities in the new live tree
    pub file_count: usize,
    /// Total size of the new live tree
    pub total_size: u64,
}

/// Options for line-level diffs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Unchanged lines shown around each change
    pub context_lines: usize,
    /// Compare lines with leading/trailing whitespace trimmed
    pub ignore_whitespace: bool,
    /// Files above this size are summarized instead of diffed
    pub max_file_size: u64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context_lines: 3,
            ignore_whitespace: false,
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

/// One line of a diff hunk, with its 1-based line number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineChange {
    /// Line present in both versions (old line number)
    Context(usize, String),
    /// Line only in the old version
    Deleted(usize, String),
    /// Line only in the new version
    Added(usize, String),
}

/// A contiguous block of changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    /// First line in the old version (1-based)
    pub from_line: usize,
    /// Number of old lines covered
    pub from_count: usize,
    /// First line in the new version (1-based)
    pub to_line: usize,
    /// Number of new lines covered
    pub to_count: usize,
    /// Lines in order
    pub changes: Vec<LineChange>,
}

/// Comparison of one file between two versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path relative to both roots
    pub path: PathBuf,
    /// Source version (0 = live)
    pub from_version: u64,
    /// Target version (0 = live)
    pub to_version: u64,
    /// Size on the "from" side, `None` if absent
    pub from_size: Option<u64>,
    /// Size on the "to" side, `None` if absent
    pub to_size: Option<u64>,
    /// Whether either side was judged binary
    pub is_binary: bool,
    /// Whether content was not compared because a side exceeded the size limit
    pub too_large: bool,
    /// Line hunks (empty for binary or oversized files)
    pub hunks: Vec<DiffHunk>,
    /// Lines added
    pub lines_added: usize,
    /// Lines deleted
    pub lines_deleted: usize,
}

/// Configuration of a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store identity
    pub store_id: StoreId,
    /// Live tree being versioned
    pub root_path: PathBuf,
    /// Location of the ledger database and snapshots
    pub storage_path: PathBuf,
    /// Directory names skipped when hashing and scanning (exact match)
    pub ignored_dirs: Vec<String>,
    /// File name patterns skipped by the diff engine (exact or `*`/`?` wildcard)
    pub ignore_patterns: Vec<String>,
    /// Size of the hashing worker pool
    pub hash_workers: usize,
    /// Line diff options
    pub diff_options: DiffOptions,
}

/// Default worker pool size for hashing
pub const DEFAULT_HASH_WORKERS: usize = 4;

/// Directory names skipped when hashing unless configured otherwise
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "build",
    "dist",
    "__pycache__",
    ".venv",
];

/// File name patterns skipped when diffing unless configured otherwise
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[".DS_Store", "*.swp", "*~"];

/// Metadata stored with the storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Version of storage format
    pub format_version: u32,
    /// Retrace version that created the storage
    pub retrace_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Configuration
    pub config: StoreConfig,
}
