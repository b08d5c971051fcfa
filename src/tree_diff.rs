//! Tree comparison
//!
//! Compares two materialized trees by metadata alone. Only regular files and
//! symlinks are tracked; directories show up through the paths beneath them.
//!
//! A path present on both sides is `Modified` when its size, modification
//! time or symlink target differs. Content is never read, which is why the
//! snapshot provider has to preserve all three exactly.
//!
//! ## Directory Aggregation
//!
//! The browsing UI shows one indicator per directory, computed from every
//! change beneath it:
//!
//! | changes under the directory | indicator  |
//! |-----------------------------|------------|
//! | Added and Deleted           | `Modified` |
//! | any Added                   | `Added`    |
//! | any Deleted                 | `Deleted`  |
//! | any Modified                | `Modified` |
//! | none                        | none       |
//!
//! The first row is a display convention: a directory that both gained and
//! lost files reads as modified.

use crate::error::{Result, RetraceError};
use crate::types::{Change, ChangeKind, FileInfo};
use crate::utils;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Path → metadata for one tree, ordered by path
pub type TreeScan = BTreeMap<PathBuf, FileInfo>;

/// Decides which entries a scan skips
///
/// Directory names are matched exactly; file name patterns accept `*` and `?`.
#[derive(Debug, Clone)]
pub struct PathFilter {
    dirs: HashSet<String>,
    patterns: GlobSet,
}

impl PathFilter {
    /// Build a filter from ignored directory names and file name patterns
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::InvalidPattern`] for a malformed pattern.
    pub fn new<D, P>(ignored_dirs: D, patterns: P) -> Result<Self>
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern.as_ref())
                .map_err(|e| RetraceError::InvalidPattern(format!("{}: {}", pattern.as_ref(), e)))?;
            builder.add(glob);
        }
        let patterns = builder
            .build()
            .map_err(|e| RetraceError::InvalidPattern(e.to_string()))?;

        Ok(Self {
            dirs: ignored_dirs.into_iter().map(|d| d.as_ref().to_string()).collect(),
            patterns,
        })
    }

    /// A filter that skips nothing
    pub fn none() -> Self {
        Self {
            dirs: HashSet::new(),
            patterns: GlobSet::empty(),
        }
    }

    /// Whether an entry with this name is skipped
    pub fn is_ignored(&self, name: &OsStr, is_dir: bool) -> bool {
        let name = name.to_string_lossy();
        if is_dir {
            self.dirs.contains(name.as_ref())
        } else {
            self.patterns.is_match(name.as_ref())
        }
    }
}

/// Walk `root` and collect metadata for every file and symlink
///
/// Unreadable entries are skipped. A missing root scans as empty.
pub fn scan(root: &Path, filter: &PathFilter) -> TreeScan {
    let mut entries = TreeScan::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !filter.is_ignored(e.file_name(), e.file_type().is_dir())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable path during scan: {}", e);
                continue;
            }
        };

        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        match file_info(entry.path(), relative) {
            Ok(info) => {
                entries.insert(relative.to_path_buf(), info);
            }
            Err(e) => debug!("Skipping {:?}: {}", relative, e),
        }
    }

    trace!("Scanned {} entries under {:?}", entries.len(), root);
    entries
}

fn file_info(full_path: &Path, relative: &Path) -> Result<FileInfo> {
    let metadata = utils::get_file_metadata(full_path)?;
    let symlink_target = if metadata.is_symlink {
        Some(utils::read_symlink(full_path)?)
    } else {
        None
    };

    Ok(FileInfo {
        path: relative.to_path_buf(),
        size: metadata.size,
        modified: metadata.modified,
        permissions: metadata.permissions,
        is_directory: false,
        is_symlink: metadata.is_symlink,
        symlink_target,
    })
}

fn is_modified(old: &FileInfo, new: &FileInfo) -> bool {
    old.size != new.size
        || old.modified != new.modified
        || old.is_symlink != new.is_symlink
        || old.symlink_target != new.symlink_target
}

/// Classify the differences between two scans, sorted by path
pub fn classify(from: &TreeScan, to: &TreeScan) -> Vec<Change> {
    let mut changes = Vec::new();

    for (path, old) in from {
        match to.get(path) {
            Some(new) if is_modified(old, new) => changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Modified,
                old_info: Some(old.clone()),
                new_info: Some(new.clone()),
            }),
            Some(_) => {}
            None => changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Deleted,
                old_info: Some(old.clone()),
                new_info: None,
            }),
        }
    }

    for (path, new) in to {
        if !from.contains_key(path) {
            changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Added,
                old_info: None,
                new_info: Some(new.clone()),
            });
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

/// Scan two roots and classify their differences
pub fn diff_trees(from_root: &Path, to_root: &Path, filter: &PathFilter) -> Vec<Change> {
    let from = scan(from_root, filter);
    let to = scan(to_root, filter);
    let changes = classify(&from, &to);
    debug!(
        "Compared {:?} ({} entries) with {:?} ({} entries): {} changes",
        from_root,
        from.len(),
        to_root,
        to.len(),
        changes.len()
    );
    changes
}

/// Change kinds seen under one directory
#[derive(Debug, Clone, Copy, Default)]
struct SeenKinds {
    added: bool,
    modified: bool,
    deleted: bool,
}

impl SeenKinds {
    fn record(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Added => self.added = true,
            ChangeKind::Modified => self.modified = true,
            ChangeKind::Deleted => self.deleted = true,
        }
    }

    fn status(self) -> Option<ChangeKind> {
        if self.added && self.deleted {
            Some(ChangeKind::Modified)
        } else if self.added {
            Some(ChangeKind::Added)
        } else if self.deleted {
            Some(ChangeKind::Deleted)
        } else if self.modified {
            Some(ChangeKind::Modified)
        } else {
            None
        }
    }
}

/// Display status of `dir` from the changes beneath it
///
/// `dir` is relative to the compared roots; an empty path means the root.
pub fn directory_status(changes: &[Change], dir: &Path) -> Option<ChangeKind> {
    let mut seen = SeenKinds::default();
    for change in changes {
        if change.path != dir && change.path.starts_with(dir) {
            seen.record(change.kind);
        }
    }
    seen.status()
}

/// Display status of every directory that has a change beneath it
pub fn aggregate_directories(changes: &[Change]) -> BTreeMap<PathBuf, ChangeKind> {
    let mut seen: BTreeMap<PathBuf, SeenKinds> = BTreeMap::new();
    for change in changes {
        for ancestor in change.path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            seen.entry(ancestor.to_path_buf())
                .or_default()
                .record(change.kind);
        }
    }

    seen.into_iter()
        .filter_map(|(dir, kinds)| kinds.status().map(|status| (dir, status)))
        .collect()
}
