//! Manifests, deltas and the browsing index
//!
//! Everything here is derived: a [`Manifest`] is a scan of one checkpoint's
//! snapshot, a [`Delta`] is the classified difference between two manifests,
//! and an [`Index`] bundles both for every checkpoint of a store. None of it
//! is persisted; rebuilding from the ledger and the snapshots always gives the
//! same document.
//!
//! Each checkpoint's summary is computed against its parent, the nearest lower
//! version that still exists. The first checkpoint is compared with an empty
//! tree, so every file in it counts as added.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::snapshot::SnapshotProvider;
use crate::tree_diff::{self, PathFilter, TreeScan};
use crate::types::{Change, ChangeKind, ChangeSummary, FileInfo, StoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Full file listing of one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Version the listing belongs to
    pub version: u64,
    /// Entries keyed by relative path
    pub files: BTreeMap<PathBuf, FileInfo>,
}

impl Manifest {
    /// Manifest with no files
    pub fn empty(version: u64) -> Self {
        Self {
            version,
            files: BTreeMap::new(),
        }
    }

    /// Manifest from a tree scan
    pub fn from_scan(version: u64, files: TreeScan) -> Self {
        Self { version, files }
    }

    /// Number of entries
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of entry sizes
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Set of listed paths
    pub fn paths(&self) -> BTreeSet<PathBuf> {
        self.files.keys().cloned().collect()
    }

    /// Look up one entry
    pub fn get(&self, path: &Path) -> Option<&FileInfo> {
        self.files.get(path)
    }
}

/// Path-level changes between two versions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Older side
    pub from_version: u64,
    /// Newer side
    pub to_version: u64,
    /// Paths only in the newer version
    pub added: Vec<PathBuf>,
    /// Paths whose size, mtime or link target changed
    pub modified: Vec<PathBuf>,
    /// Paths only in the older version
    pub deleted: Vec<PathBuf>,
}

impl Delta {
    /// Partition a classified change list
    pub fn from_changes(from_version: u64, to_version: u64, changes: &[Change]) -> Self {
        let mut delta = Self {
            from_version,
            to_version,
            ..Self::default()
        };
        for change in changes {
            let bucket = match change.kind {
                ChangeKind::Added => &mut delta.added,
                ChangeKind::Modified => &mut delta.modified,
                ChangeKind::Deleted => &mut delta.deleted,
            };
            bucket.push(change.path.clone());
        }
        delta
    }

    /// Delta between two manifests
    pub fn between(parent: &Manifest, child: &Manifest) -> Self {
        let changes = tree_diff::classify(&parent.files, &child.files);
        Self::from_changes(parent.version, child.version, &changes)
    }

    /// Counts per kind
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    /// Child path set from the parent path set
    pub fn apply(&self, parent: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut paths = parent.clone();
        for path in &self.deleted {
            paths.remove(path);
        }
        paths.extend(self.added.iter().cloned());
        paths
    }

    /// Parent path set from the child path set
    pub fn revert(&self, child: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut paths = child.clone();
        for path in &self.added {
            paths.remove(path);
        }
        paths.extend(self.deleted.iter().cloned());
        paths
    }

    /// Key of this delta in [`Index::deltas`]
    pub fn label(&self) -> String {
        delta_label(self.from_version, self.to_version)
    }
}

/// Key of a delta in [`Index::deltas`], e.g. `2:3`
pub fn delta_label(from_version: u64, to_version: u64) -> String {
    format!("{}:{}", from_version, to_version)
}

/// Key of a manifest in [`Index::manifests`], e.g. `v3`
pub fn manifest_label(version: u64) -> String {
    format!("v{}", version)
}

/// One checkpoint as listed in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// Version number
    pub version: u64,
    /// User message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Files in the snapshot
    pub file_count: usize,
    /// Version this one is compared against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u64>,
    /// Changes relative to the parent
    pub summary: ChangeSummary,
}

/// Document served to the browsing UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Store identity
    pub store_id: StoreId,
    /// Live root of the store
    pub root: PathBuf,
    /// When the document was built
    pub generated_at: DateTime<Utc>,
    /// Checkpoints in ascending version order
    pub checkpoints: Vec<CheckpointSummary>,
    /// Manifest per version label
    pub manifests: BTreeMap<String, Manifest>,
    /// Delta per `from:to` label, one for each adjacent pair
    pub deltas: BTreeMap<String, Delta>,
}

impl Index {
    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Manifest of a version, if indexed
    pub fn manifest(&self, version: u64) -> Option<&Manifest> {
        self.manifests.get(&manifest_label(version))
    }

    /// Delta between two adjacent versions, if indexed
    pub fn delta(&self, from_version: u64, to_version: u64) -> Option<&Delta> {
        self.deltas.get(&delta_label(from_version, to_version))
    }
}

/// Builds an [`Index`] from the ledger and the snapshots
pub struct IndexBuilder<'a> {
    ledger: &'a Ledger,
    provider: &'a dyn SnapshotProvider,
    filter: &'a PathFilter,
}

impl<'a> IndexBuilder<'a> {
    /// Create a builder over a store's ledger and snapshots
    pub fn new(
        ledger: &'a Ledger,
        provider: &'a dyn SnapshotProvider,
        filter: &'a PathFilter,
    ) -> Self {
        Self {
            ledger,
            provider,
            filter,
        }
    }

    /// Scan one checkpoint's snapshot
    pub fn manifest(&self, version: u64) -> Result<Manifest> {
        let snapshot = self.provider.materialize(version)?;
        let files = tree_diff::scan(snapshot.path(), self.filter);
        Ok(Manifest::from_scan(version, files))
    }

    /// Build the index document for every checkpoint
    #[instrument(skip(self), fields(store = %self.ledger.store_id()))]
    pub fn build(&self, root: &Path) -> Result<Index> {
        let mut checkpoints: Vec<Checkpoint> = self.ledger.list(None)?;
        checkpoints.reverse();

        let mut index = Index {
            store_id: self.ledger.store_id().clone(),
            root: root.to_path_buf(),
            generated_at: Utc::now(),
            checkpoints: Vec::with_capacity(checkpoints.len()),
            manifests: BTreeMap::new(),
            deltas: BTreeMap::new(),
        };

        let mut parent = Manifest::empty(0);
        let mut parent_version = None;
        for checkpoint in &checkpoints {
            let manifest = self.manifest(checkpoint.version)?;
            let delta = Delta::between(&parent, &manifest);
            debug!(
                "v{}: {} files, {} changes against {:?}",
                checkpoint.version,
                manifest.file_count(),
                delta.summary().total(),
                parent_version
            );

            index.checkpoints.push(CheckpointSummary {
                version: checkpoint.version,
                message: checkpoint.message.clone(),
                created_at: checkpoint.created_at,
                file_count: manifest.file_count(),
                parent_version,
                summary: delta.summary(),
            });
            if parent_version.is_some() {
                index.deltas.insert(delta.label(), delta);
            }
            index
                .manifests
                .insert(manifest_label(checkpoint.version), manifest.clone());

            parent_version = Some(checkpoint.version);
            parent = manifest;
        }

        info!(
            "Built index with {} checkpoints and {} deltas",
            index.checkpoints.len(),
            index.deltas.len()
        );
        Ok(index)
    }
}
