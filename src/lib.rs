//! # Retrace - Point-in-time versioning for directory trees
//!
//! Retrace gives an ordinary directory Git-like checkpoints without asking
//! anything of the programs that write to it. Files are not tracked at write
//! time; a checkpoint is a snapshot of the whole tree plus a ledger row and a
//! set of per-file digests.
//!
//! ## Overview
//!
//! - Create checkpoints with monotonically increasing version numbers that
//!   are never reused, even after deletion
//! - Restore the live tree to any checkpoint, all or nothing
//! - Diff any two versions (or a version against the live tree) by metadata,
//!   and diff single files line by line
//! - Find every checkpoint that contained a given file content
//! - Build a JSON index of manifests and deltas for a browsing UI
//!
//! ## Architecture
//!
//! - **Version Ledger** ([`ledger`]): SQLite-backed checkpoint records; version
//!   races are settled by a commit-time uniqueness constraint
//! - **Snapshot Provider** ([`snapshot`]): clones, materializes and swaps
//!   trees behind a narrow trait
//! - **Content Hash Tracker** ([`tracker`]): parallel SHA-256 digests with
//!   reuse of unchanged files' recorded digests
//! - **Tree Diff Engine** ([`tree_diff`], [`diff`]): change classification,
//!   directory aggregation and unified line diffs
//! - **Manifest/Delta Builder** ([`manifest`]): the derived browsing index
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use retrace::{Repository, ChangeKind};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> retrace::Result<()> {
//! let repo = Repository::init(
//!     PathBuf::from("./my_project"),    // Directory to version
//!     PathBuf::from("./.retrace_store") // Ledger and snapshots
//! )?;
//!
//! let v1 = repo.create_checkpoint(Some("Initial state".to_string()))?;
//!
//! // ...edit files...
//!
//! if repo.has_changes()? {
//!     let v2 = repo.create_checkpoint(Some("After edits".to_string()))?;
//!     let diff = repo.diff(v1.version, v2.version)?;
//!     for path in diff.paths(ChangeKind::Modified) {
//!         let file = repo.diff_file(v1.version, v2.version, &path)?;
//!         print!("{}", retrace::diff::render_unified(&file));
//!     }
//! }
//!
//! // Back to the first checkpoint, saving the current state first
//! let result = repo.restore(v1.version, true)?;
//! println!("Restored {} files", result.files_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Versions
//!
//! Versions start at 1. Version `0` is never allocated; diff operations use
//! it to mean the live tree.
//!
//! ### Change Detection
//!
//! Two entries are the same when size, modification time and symlink target
//! all match. Content is only read when hashing a new checkpoint, and even
//! then files matching the parent's recorded size and mtime reuse its digest.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`](error::Result) with a
//! [`RetraceError`]. Only [`RetraceError::Conflict`] is worth retrying; the
//! library itself never retries.
//!
//! ## Module Organization
//!
//! - [`repository`]: the [`Repository`] entry point and its builder
//! - [`checkpoint`]: checkpoint records
//! - [`ledger`] and [`database`]: persistent version ledger
//! - [`snapshot`]: snapshot provider trait and the copy-based provider
//! - [`tracker`]: content hashing and file-version persistence
//! - [`tree_diff`] and [`diff`]: tree and line comparison
//! - [`manifest`]: manifests, deltas and the browsing index
//! - [`types`]: shared data types
//! - [`error`]: error types

// Public API modules
pub mod checkpoint;
pub mod database;
pub mod diff;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod repository;
pub mod snapshot;
pub mod tracker;
pub mod tree_diff;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use checkpoint::Checkpoint;
pub use error::{Result, RetraceError};
pub use manifest::{Delta, Index, Manifest};
pub use repository::{Repository, RepositoryBuilder};
pub use snapshot::{CopySnapshotProvider, Materialized, SnapshotProvider, SwapObserver, SwapPhase};
pub use types::*;
