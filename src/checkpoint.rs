//! Checkpoint definitions
//!
//! A checkpoint is an immutable, versioned snapshot of a store's file tree.
//! Versions are positive integers allocated by the [`Ledger`](crate::ledger::Ledger);
//! they strictly increase within a store and are never reused, even after the
//! checkpoint that held them is deleted.
//!
//! ## Examples
//!
//! ```rust
//! use retrace::checkpoint::Checkpoint;
//! use chrono::Utc;
//!
//! let checkpoint = Checkpoint {
//!     version: 3,
//!     message: Some("Before refactor".to_string()),
//!     created_at: Utc::now(),
//!     parent_version: Some(2),
//! };
//! assert_eq!(checkpoint.label(), "v3");
//! assert!(!checkpoint.is_root());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A checkpoint recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Version number, unique and strictly increasing per store
    pub version: u64,
    /// Optional user-provided message
    pub message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Latest version at the time this checkpoint was created
    pub parent_version: Option<u64>,
}

impl Checkpoint {
    /// Short human-readable label, e.g. `v12`
    pub fn label(&self) -> String {
        format!("v{}", self.version)
    }

    /// Whether this checkpoint was created in an empty store
    pub fn is_root(&self) -> bool {
        self.parent_version.is_none()
    }

    /// Message or a placeholder for display
    pub fn display_message(&self) -> &str {
        self.message.as_deref().unwrap_or("(no message)")
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.label(),
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.display_message()
        )
    }
}
