//! Error types for the Retrace library
//!
//! This module defines all error types that can occur during Retrace operations.
//! The variants follow the taxonomy the rest of the crate relies on:
//!
//! - **Not found**: an absent checkpoint or version
//! - **Conflict**: a lost version-allocation race; retryable by the caller
//! - **Precondition failed**: restore target missing on disk, live tree unavailable
//! - **I/O failure**: underlying hash, copy or materialize errors
//! - **Verification failure**: post-copy count/size mismatch during a swap
//!
//! The diff engine and hash tracker never surface per-file failures through this
//! type; they record and skip them. The ledger and the restore path return the
//! first integrity violation and leave prior state untouched.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Retrace library
pub type Result<T> = std::result::Result<T, RetraceError>;

/// Main error type for all Retrace operations
#[derive(Debug, Error)]
pub enum RetraceError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors reported by the relational store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Checkpoint not found in the ledger
    #[error("Checkpoint not found: version {0}")]
    CheckpointNotFound(u64),

    /// The store has no checkpoints yet
    #[error("Store has no checkpoints")]
    NoCheckpoints,

    /// Another writer committed the same version first
    #[error("Version {version} was allocated concurrently by another writer")]
    Conflict {
        /// Version this caller attempted to allocate
        version: u64,
    },

    /// An operation's precondition does not hold
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A copied tree does not match its source
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// File is not present in a materialized tree
    #[error("File not found in version {version}: {path:?}")]
    FileNotFound {
        /// Version that was searched (0 = live)
        version: u64,
        /// Relative path of the file
        path: PathBuf,
    },

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RetraceError {
    /// Create a precondition error with a custom message
    pub fn precondition(msg: impl Into<String>) -> Self {
        RetraceError::PreconditionFailed(msg.into())
    }

    /// Create a verification error with a custom message
    pub fn verification(msg: impl Into<String>) -> Self {
        RetraceError::VerificationFailed(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RetraceError::Internal(msg.into())
    }

    /// Check if this error is recoverable by retrying the same call
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RetraceError::Conflict { .. })
    }

    /// Check if this error means the requested checkpoint or file is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RetraceError::CheckpointNotFound(_)
                | RetraceError::NoCheckpoints
                | RetraceError::FileNotFound { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RetraceError::CheckpointNotFound(version) => {
                format!(
                    "Checkpoint v{} not found. Use 'list()' to see available checkpoints.",
                    version
                )
            }
            RetraceError::NoCheckpoints => {
                "No checkpoints exist yet. Create one with 'create_checkpoint()'.".to_string()
            }
            RetraceError::Conflict { version } => {
                format!(
                    "Another checkpoint claimed version {} at the same time. Retry the operation.",
                    version
                )
            }
            RetraceError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Build a repository there first.", path)
            }
            _ => self.to_string(),
        }
    }
}
