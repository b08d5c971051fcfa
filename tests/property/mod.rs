//! Property-based testing for Retrace
//!
//! Uses proptest to verify invariants across randomly generated trees,
//! edit sequences and ledger operations.

use ::retrace::database::Database;
use ::retrace::ledger::Ledger;
use ::retrace::*;
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Strategy for generating file operations
#[derive(Debug, Clone)]
pub enum FileOperation {
    Create { path: PathBuf, content: Vec<u8> },
    Modify { path: PathBuf, content: Vec<u8> },
    Delete { path: PathBuf },
}

fn file_operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        (path_strategy(), content_strategy())
            .prop_map(|(path, content)| FileOperation::Create { path, content }),
        (path_strategy(), content_strategy())
            .prop_map(|(path, content)| FileOperation::Modify { path, content }),
        path_strategy().prop_map(|path| FileOperation::Delete { path }),
    ]
}

/// Generate relative file paths
///
/// Directory names never contain a dot and file names always do, so a path
/// can never need a file and a directory at the same location.
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dir_strategy = prop::collection::vec("d[a-z]{1,4}", 0..=3);
    let filename_strategy = prop_oneof![
        "file[0-9]{1,2}\\.txt",
        "[a-z]{1,6}\\.(txt|rs|md)",
    ];

    (dir_strategy, filename_strategy).prop_map(|(dirs, filename)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            path.push(dir);
        }
        path.join(filename)
    })
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-zA-Z0-9 \n]{0,400}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 1..2000),
    ]
}

fn apply_operation(root: &Path, op: &FileOperation) -> anyhow::Result<()> {
    match op {
        FileOperation::Create { path, content } => {
            let full_path = root.join(path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full_path, content)?;
        }
        FileOperation::Modify { path, content } => {
            let full_path = root.join(path);
            if full_path.exists() {
                fs::write(full_path, content)?;
            }
        }
        FileOperation::Delete { path } => {
            let full_path = root.join(path);
            if full_path.exists() {
                fs::remove_file(full_path)?;
            }
        }
    }
    Ok(())
}

/// Hash of every regular file's path and content under `root`
fn compute_directory_hash(root: &Path) -> anyhow::Result<String> {
    use sha2::{Digest, Sha256};
    use walkdir::WalkDir;

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root)?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(fs::read(entry.path())?);
            hasher.update(b"\0");
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

/// Synthetic tree entry; `stamp` stands in for size and mtime together
fn entry(path: &Path, stamp: u8) -> FileInfo {
    FileInfo {
        path: path.to_path_buf(),
        size: stamp as u64,
        modified: timestamp(stamp as i64),
        permissions: 0o644,
        is_directory: false,
        is_symlink: false,
        symlink_target: None,
    }
}

/// Generate a synthetic tree scan over a small path universe
fn scan_strategy() -> impl Strategy<Value = BTreeMap<PathBuf, FileInfo>> {
    prop::collection::btree_map(path_strategy(), 0u8..4, 0..24).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(path, stamp)| {
                let info = entry(&path, stamp);
                (path, info)
            })
            .collect()
    })
}

#[derive(Debug, Clone)]
enum LedgerOp {
    Create,
    DeleteNth(usize),
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every path lands in exactly one bucket, in path order
    #[test]
    fn classify_partitions_paths(from in scan_strategy(), to in scan_strategy()) {
        let changes = tree_diff::classify(&from, &to);

        let paths: Vec<&PathBuf> = changes.iter().map(|c| &c.path).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(&paths, &sorted);

        for change in &changes {
            let in_from = from.get(&change.path);
            let in_to = to.get(&change.path);
            match change.kind {
                ChangeKind::Added => prop_assert!(in_from.is_none() && in_to.is_some()),
                ChangeKind::Deleted => prop_assert!(in_from.is_some() && in_to.is_none()),
                ChangeKind::Modified => prop_assert_ne!(in_from.unwrap(), in_to.unwrap()),
            }
        }

        let changed: BTreeSet<&PathBuf> = changes.iter().map(|c| &c.path).collect();
        for (path, info) in &from {
            if !changed.contains(path) {
                prop_assert_eq!(Some(info), to.get(path));
            }
        }
        for path in to.keys() {
            prop_assert!(from.contains_key(path) || changed.contains(path));
        }
    }

    /// A delta carries a parent's path set to the child's and back
    #[test]
    fn delta_reconstructs_both_sides(from in scan_strategy(), to in scan_strategy()) {
        let parent = Manifest::from_scan(1, from);
        let child = Manifest::from_scan(2, to);
        let delta = Delta::between(&parent, &child);

        prop_assert_eq!(delta.apply(&parent.paths()), child.paths());
        prop_assert_eq!(delta.revert(&child.paths()), parent.paths());
        prop_assert_eq!(
            child.file_count() as i64 - parent.file_count() as i64,
            delta.added.len() as i64 - delta.deleted.len() as i64
        );
    }

    /// Directory status is only reported for directories with changes beneath
    #[test]
    fn directory_status_matches_aggregate(from in scan_strategy(), to in scan_strategy()) {
        let changes = tree_diff::classify(&from, &to);
        let aggregated = tree_diff::aggregate_directories(&changes);

        for (dir, kind) in &aggregated {
            prop_assert_eq!(tree_diff::directory_status(&changes, dir), Some(*kind));
        }
        for change in &changes {
            for ancestor in change.path.ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                prop_assert!(aggregated.contains_key(ancestor));
            }
        }
    }

    /// Hunks account for every added and deleted line
    #[test]
    fn line_diff_counts_balance(old in "[abc\n]{0,80}", new in "[abc\n]{0,80}") {
        let options = DiffOptions::default();
        let hunks = diff::compute_line_diff(old.as_bytes(), new.as_bytes(), &options);

        let mut added = 0i64;
        let mut deleted = 0i64;
        for hunk in &hunks {
            for change in &hunk.changes {
                match change {
                    LineChange::Added(..) => added += 1,
                    LineChange::Deleted(..) => deleted += 1,
                    LineChange::Context(..) => {}
                }
            }
        }

        let old_lines = old.lines().count() as i64;
        let new_lines = new.lines().count() as i64;
        prop_assert_eq!(added - deleted, new_lines - old_lines);
        prop_assert_eq!(hunks.is_empty(), old.lines().eq(new.lines()));
    }

    /// Versions strictly increase and are never handed out twice
    #[test]
    fn versions_strictly_increase(
        ops in prop::collection::vec(
            prop_oneof![
                3 => Just(LedgerOp::Create),
                1 => (0usize..8).prop_map(LedgerOp::DeleteNth),
            ],
            1..40
        )
    ) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ledger = Ledger::new(db, StoreId::new("prop"));
        let mut issued: Vec<u64> = Vec::new();
        let mut live: Vec<u64> = Vec::new();

        for op in &ops {
            match op {
                LedgerOp::Create => {
                    let checkpoint = ledger.allocate_and_create(None, Utc::now()).unwrap();
                    if let Some(last) = issued.last() {
                        prop_assert!(checkpoint.version > *last);
                    }
                    prop_assert_eq!(checkpoint.parent_version, live.last().copied());
                    issued.push(checkpoint.version);
                    live.push(checkpoint.version);
                }
                LedgerOp::DeleteNth(n) => {
                    if !live.is_empty() {
                        let version = live.remove(n % live.len());
                        ledger.delete(version).unwrap();
                    }
                }
            }
        }

        prop_assert_eq!(ledger.versions().unwrap(), live);
        let unique: BTreeSet<u64> = issued.iter().copied().collect();
        prop_assert_eq!(unique.len(), issued.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Restoring a checkpoint reproduces its tree exactly
    #[test]
    fn checkpoint_restore_identity(
        operations in prop::collection::vec(file_operation_strategy(), 1..40),
        extra in prop::collection::vec(file_operation_strategy(), 1..20)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let repo = Repository::init(
            temp_dir.path().to_path_buf(),
            storage_dir.path().to_path_buf(),
        )
        .unwrap();

        for op in &operations {
            apply_operation(temp_dir.path(), op).unwrap();
        }
        let checkpoint = repo.create_checkpoint(Some("Test checkpoint".to_string())).unwrap();
        let original_hash = compute_directory_hash(temp_dir.path()).unwrap();

        for op in &extra {
            apply_operation(temp_dir.path(), op).unwrap();
        }
        fs::write(temp_dir.path().join("extra.marker"), "extra").unwrap();

        repo.restore(checkpoint.version, false).unwrap();
        prop_assert_eq!(original_hash, compute_directory_hash(temp_dir.path()).unwrap());
        prop_assert!(repo.diff(checkpoint.version, 0).unwrap().changes.is_empty());
    }

    /// Every checkpoint in a sequence can be restored independently
    #[test]
    fn checkpoint_independence(
        operation_sets in prop::collection::vec(
            prop::collection::vec(file_operation_strategy(), 1..10),
            2..5
        )
    ) {
        let temp_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let repo = Repository::init(
            temp_dir.path().to_path_buf(),
            storage_dir.path().to_path_buf(),
        )
        .unwrap();

        let mut hashes = BTreeMap::new();
        for (idx, operations) in operation_sets.iter().enumerate() {
            for op in operations {
                apply_operation(temp_dir.path(), op).unwrap();
            }
            let checkpoint = repo.create_checkpoint(Some(format!("Checkpoint {}", idx))).unwrap();
            hashes.insert(checkpoint.version, compute_directory_hash(temp_dir.path()).unwrap());
        }

        for (version, expected) in hashes.iter().rev() {
            repo.restore(*version, false).unwrap();
            prop_assert_eq!(&compute_directory_hash(temp_dir.path()).unwrap(), expected);
        }
    }
}
