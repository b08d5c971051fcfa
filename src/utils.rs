//! Utility functions for Retrace
//!
//! This module provides common utility functions used throughout the library:
//!
//! ### File Operations
//! - File content hashing (SHA-256), streamed through a fixed buffer
//! - File metadata extraction without following symlinks
//! - Metadata-preserving recursive tree copies
//! - Permission handling and symbolic link helpers
//!
//! ### Time Conversion
//! - `SystemTime` → `DateTime<Utc>` and nanosecond round-trips for persistence
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{hash_file_content, copy_tree};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (hash, bytes_read) = hash_file_content(Path::new("example.txt"))?;
//! println!("{} ({} bytes)", hash, bytes_read);
//!
//! let stats = copy_tree(Path::new("project"), Path::new("/tmp/project-copy"))?;
//! println!("Copied {} entries", stats.file_count);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Buffer size used when streaming file content
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hash file content using SHA-256
///
/// Streams the file through the digest so memory use stays bounded for
/// large files.
///
/// # Returns
///
/// The hex-encoded digest and the number of bytes read.
///
/// # Errors
///
/// - [`RetraceError::Io`](crate::error::RetraceError::Io) if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// File metadata container
///
/// Extracted with `symlink_metadata`, so a symlink describes the link itself
/// rather than its target.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Size in bytes
    pub size: u64,
    /// Unix-style permissions (e.g., 0o644)
    pub permissions: u32,
    /// Last modification timestamp
    pub modified: DateTime<Utc>,
    /// Whether this is a symbolic link
    pub is_symlink: bool,
    /// Whether this is a regular file
    pub is_file: bool,
}

/// Get file metadata without following symlinks
pub fn get_file_metadata(path: &Path) -> Result<FileMetadata> {
    let metadata = fs::symlink_metadata(path)?;
    Ok(metadata_from(&metadata)?)
}

/// Convert std metadata into [`FileMetadata`]
pub fn metadata_from(metadata: &fs::Metadata) -> std::io::Result<FileMetadata> {
    Ok(FileMetadata {
        size: metadata.len(),
        permissions: get_permissions(metadata),
        modified: to_datetime(metadata.modified()?),
        is_symlink: metadata.file_type().is_symlink(),
        is_file: metadata.file_type().is_file(),
    })
}

/// Get Unix permissions from metadata
#[cfg(unix)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permissions from metadata (Windows implementation)
#[cfg(windows)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (Windows implementation)
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly((mode & 0o200) == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Read symlink target
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Convert a `SystemTime` to a UTC timestamp, keeping nanoseconds
pub fn to_datetime(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Encode a timestamp as nanoseconds since the Unix epoch
///
/// Timestamps outside the representable range (roughly 1677–2262) saturate.
pub fn datetime_to_nanos(time: &DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(if time.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Decode nanoseconds since the Unix epoch
pub fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec).unwrap_or_default()
}

/// Number of tracked entities and their total size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Regular files plus symlinks
    pub file_count: usize,
    /// Sum of their sizes
    pub total_size: u64,
}

/// Count regular files and symlinks under `root`
///
/// Used to verify that a copy matches its source. Symlinks are not followed.
pub fn tree_stats(root: &Path) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_file() || file_type.is_symlink() {
            stats.file_count += 1;
            stats.total_size += entry.metadata()?.len();
        }
    }
    Ok(stats)
}

/// Recursively copy `src` into `dst`, preserving metadata
///
/// Size, modification time, permission bits and symlink targets are carried
/// over; change detection depends on all four. `dst` is created if missing.
/// Directory times and modes are applied after their children are written.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<TreeStats> {
    fs::create_dir_all(dst)?;
    let mut stats = TreeStats::default();

    for entry in WalkDir::new(src).follow_links(false).contents_first(true) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).map_err(|_| {
            crate::error::RetraceError::internal(format!(
                "walked path {:?} outside of {:?}",
                entry.path(),
                src
            ))
        })?;
        let target = dst.join(relative);
        let metadata = entry.metadata()?;
        let mtime = FileTime::from_last_modification_time(&metadata);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            set_permissions(&target, get_permissions(&metadata))?;
            filetime::set_file_mtime(&target, mtime)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            let link_target = read_symlink(entry.path())?;
            create_symlink(&link_target, &target)?;
            let atime = FileTime::from_last_access_time(&metadata);
            filetime::set_symlink_file_times(&target, atime, mtime)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            set_permissions(&target, get_permissions(&metadata))?;
            filetime::set_file_mtime(&target, mtime)?;
        } else {
            trace!("Skipping special file {:?}", entry.path());
            continue;
        }

        stats.file_count += 1;
        stats.total_size += metadata.len();
    }

    Ok(stats)
}

/// Remove a directory tree if it exists
///
/// Snapshots keep the modes of the directories they copy, so a read-only
/// directory blocks removal of its children. On a permission error every
/// directory in the tree is made owner-writable and removal is retried.
pub fn remove_tree(path: &Path) -> Result<()> {
    match remove_dir_if_present(path) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("Making {:?} writable before removal", path);
            make_tree_writable(path);
            Ok(remove_dir_if_present(path)?)
        }
        other => Ok(other?),
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Give the owner full access to every directory under `root`
///
/// Entries that cannot be read or changed are skipped.
pub fn make_tree_writable(root: &Path) {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) if entry.file_type().is_dir() => entry,
            Ok(_) => continue,
            Err(e) => {
                trace!("Skipping {:?} while making writable: {}", e.path(), e);
                continue;
            }
        };
        let mode = match entry.metadata() {
            Ok(metadata) => get_permissions(&metadata),
            Err(_) => continue,
        };
        if mode & 0o700 != 0o700 {
            if let Err(e) = set_permissions(entry.path(), mode | 0o700) {
                trace!("Could not make {:?} writable: {}", entry.path(), e);
            }
        }
    }
}

/// Write a file atomically via a temporary sibling and rename
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
