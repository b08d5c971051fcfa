//! Chaos testing for Retrace
//!
//! Injects failures at every phase of a restore swap, interrupts swaps
//! between processes, races writers on one store and damages snapshots on
//! disk, then checks that the live tree and the ledger come out intact.

use ::retrace::database::{Database, DATABASE_FILE};
use ::retrace::ledger::Ledger;
use ::retrace::snapshot::SNAPSHOTS_DIR;
use ::retrace::*;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};

/// Swap observer that fails once the armed phase is reached
#[derive(Default)]
pub struct FaultInjector {
    armed: Mutex<Option<SwapPhase>>,
    seen: Mutex<Vec<SwapPhase>>,
}

impl FaultInjector {
    pub fn arm(&self, phase: SwapPhase) {
        *self.armed.lock() = Some(phase);
    }

    pub fn disarm(&self) {
        *self.armed.lock() = None;
    }

    pub fn seen(&self) -> Vec<SwapPhase> {
        self.seen.lock().clone()
    }
}

impl SwapObserver for FaultInjector {
    fn on_phase(&self, phase: SwapPhase, version: u64) -> Result<()> {
        self.seen.lock().push(phase);
        if *self.armed.lock() == Some(phase) {
            warn!("Injecting failure at {:?} while restoring v{}", phase, version);
            return Err(RetraceError::internal(format!("injected failure at {:?}", phase)));
        }
        Ok(())
    }
}

/// Chaos testing harness
pub struct RetraceChaosTest {
    pub repo: Repository,
    pub temp_dir: TempDir,
    pub storage_dir: TempDir,
    pub faults: Arc<FaultInjector>,
    pub rng: StdRng,
}

impl RetraceChaosTest {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let faults = Arc::new(FaultInjector::default());

        let repo = RepositoryBuilder::new()
            .store_id(StoreId::new("chaos"))
            .swap_observer(faults.clone())
            .build(
                temp_dir.path().to_path_buf(),
                storage_dir.path().to_path_buf(),
            )
            .unwrap();

        Self {
            repo,
            temp_dir,
            storage_dir,
            faults,
            rng: StdRng::seed_from_u64(42),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn storage(&self) -> &Path {
        self.storage_dir.path()
    }

    /// Write a batch of random files and checkpoint them
    pub fn create_test_checkpoints(&mut self, count: usize) -> anyhow::Result<Vec<u64>> {
        let mut versions = Vec::new();
        for i in 0..count {
            let dir = self.root().join(format!("batch_{}", i % 3));
            fs::create_dir_all(&dir)?;
            for j in 0..5 {
                let size = self.rng.random_range(16..512);
                let mut content = vec![0u8; size];
                self.rng.fill(&mut content[..]);
                fs::write(dir.join(format!("file_{}_{}.bin", i, j)), content)?;
            }
            let checkpoint = self.repo.create_checkpoint(Some(format!("Chaos {}", i)))?;
            versions.push(checkpoint.version);
        }
        Ok(versions)
    }

    /// Path and content of every regular file under the live root
    pub fn live_state(&self) -> Vec<(PathBuf, Vec<u8>)> {
        let mut state = Vec::new();
        for entry in walkdir::WalkDir::new(self.root()).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let relative = entry.path().strip_prefix(self.root()).unwrap().to_path_buf();
                state.push((relative, fs::read(entry.path()).unwrap()));
            }
        }
        state
    }

    pub fn ledger_state(&self) -> Vec<(u64, Option<String>)> {
        self.repo
            .list(None)
            .unwrap()
            .into_iter()
            .map(|c| (c.version, c.message))
            .collect()
    }

    /// Swap leftovers next to the live root
    pub fn swap_leftovers(&self) -> Vec<PathBuf> {
        let root = self.root().canonicalize().unwrap();
        let prefix = format!(".{}.retrace-", root.file_name().unwrap().to_string_lossy());
        fs::read_dir(root.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .collect()
    }

    pub fn snapshot_dir(&self, version: u64) -> PathBuf {
        self.storage()
            .join(SNAPSHOTS_DIR)
            .join(format!("v{:08}", version))
    }
}

const PHASES: [SwapPhase; 3] = [SwapPhase::Staged, SwapPhase::LiveDetached, SwapPhase::Swapped];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_swap_failure_at_every_phase() {
        let mut chaos = RetraceChaosTest::new();
        let versions = chaos.create_test_checkpoints(3).unwrap();
        fs::write(chaos.root().join("unsaved.txt"), "work in progress").unwrap();

        let live_before = chaos.live_state();
        let ledger_before = chaos.ledger_state();

        for phase in PHASES {
            info!("Failing restore at {:?}", phase);
            chaos.faults.arm(phase);

            let err = chaos.repo.restore(versions[0], false).unwrap_err();
            assert!(matches!(err, RetraceError::Internal(_)), "unexpected error: {}", err);
            assert_eq!(
                chaos.live_state(),
                live_before,
                "live tree changed after failure at {:?}",
                phase
            );
            assert_eq!(chaos.ledger_state(), ledger_before);
            assert!(chaos.swap_leftovers().is_empty());
        }

        chaos.faults.disarm();
        chaos.repo.restore(versions[0], false).unwrap();
        assert!(!chaos.root().join("unsaved.txt").exists());
        assert!(chaos.swap_leftovers().is_empty());
    }

    #[test]
    fn test_swap_failure_discards_auto_checkpoint() {
        let mut chaos = RetraceChaosTest::new();
        let versions = chaos.create_test_checkpoints(2).unwrap();
        fs::write(chaos.root().join("unsaved.txt"), "work in progress").unwrap();

        let live_before = chaos.live_state();
        let ledger_before = chaos.ledger_state();

        for phase in PHASES {
            chaos.faults.arm(phase);
            assert!(chaos.repo.restore(versions[0], true).is_err());
            assert_eq!(chaos.live_state(), live_before);
            assert_eq!(chaos.ledger_state(), ledger_before);
        }

        // Three auto-saves were allocated and removed; their versions stay retired
        chaos.faults.disarm();
        let result = chaos.repo.restore(versions[0], true).unwrap();
        assert_eq!(result.pre_restore_checkpoint, Some(6));
        assert!(!chaos.snapshot_dir(3).exists());
        assert!(chaos.snapshot_dir(6).exists());
    }

    #[test]
    fn test_observer_sees_phases_in_order() {
        let mut chaos = RetraceChaosTest::new();
        let versions = chaos.create_test_checkpoints(2).unwrap();

        chaos.repo.restore(versions[0], false).unwrap();
        assert_eq!(chaos.faults.seen(), PHASES.to_vec());

        chaos.faults.arm(SwapPhase::Staged);
        assert!(chaos.repo.restore(versions[1], false).is_err());
        assert_eq!(chaos.faults.seen().len(), 4);
    }

    #[test]
    fn test_interrupted_swap_recovered_on_open() {
        let mut chaos = RetraceChaosTest::new();
        let versions = chaos.create_test_checkpoints(2).unwrap();
        let live_before = chaos.live_state();

        // Simulate a crash right after the live tree was moved aside
        let root = chaos.root().canonicalize().unwrap();
        let backup = root.parent().unwrap().join(format!(
            ".{}.retrace-backup",
            root.file_name().unwrap().to_string_lossy()
        ));
        fs::rename(&root, &backup).unwrap();
        assert!(!root.exists());

        let reopened = Repository::open(root.clone(), chaos.storage().to_path_buf()).unwrap();
        assert!(!backup.exists());
        assert_eq!(chaos.live_state(), live_before);
        assert_eq!(reopened.latest().unwrap().version, versions[1]);
        assert!(!reopened.has_changes().unwrap());
    }

    #[test]
    fn test_stale_backup_removed_when_live_present() {
        let chaos = RetraceChaosTest::new();
        let root = chaos.root().canonicalize().unwrap();
        let backup = root.parent().unwrap().join(format!(
            ".{}.retrace-backup",
            root.file_name().unwrap().to_string_lossy()
        ));
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("old.txt"), "old").unwrap();

        Repository::open(root, chaos.storage().to_path_buf()).unwrap();
        assert!(!backup.exists());
    }

    #[test]
    fn test_leftovers_cleaned_on_open() {
        let mut chaos = RetraceChaosTest::new();
        chaos.create_test_checkpoints(1).unwrap();

        let snapshots = chaos.storage().join(SNAPSHOTS_DIR);
        fs::create_dir_all(snapshots.join(".staging-crashed/sub")).unwrap();
        fs::write(snapshots.join(".staging-crashed/sub/partial.bin"), [0u8; 64]).unwrap();
        fs::create_dir_all(chaos.snapshot_dir(9)).unwrap();
        fs::write(chaos.snapshot_dir(9).join("orphan.txt"), "orphan").unwrap();

        let reopened = Repository::open(
            chaos.root().to_path_buf(),
            chaos.storage().to_path_buf(),
        )
        .unwrap();

        assert!(!snapshots.join(".staging-crashed").exists());
        assert!(!chaos.snapshot_dir(9).exists());
        assert!(chaos.snapshot_dir(1).exists());
        assert_eq!(reopened.create_checkpoint(None).unwrap().version, 2);
    }

    #[test]
    fn test_missing_snapshot_is_precondition_failure() {
        let mut chaos = RetraceChaosTest::new();
        let versions = chaos.create_test_checkpoints(2).unwrap();
        let live_before = chaos.live_state();

        fs::remove_dir_all(chaos.snapshot_dir(versions[0])).unwrap();

        let err = chaos.repo.restore(versions[0], true).unwrap_err();
        assert!(matches!(err, RetraceError::PreconditionFailed(_)));
        assert_eq!(chaos.live_state(), live_before);
        assert_eq!(chaos.ledger_state().len(), 2);

        assert!(matches!(
            chaos.repo.diff(versions[0], versions[1]),
            Err(RetraceError::PreconditionFailed(_))
        ));
        assert!(chaos.repo.restore(versions[1], false).is_ok());
    }

    #[test]
    fn test_missing_live_root_is_precondition_failure() {
        let mut chaos = RetraceChaosTest::new();
        let versions = chaos.create_test_checkpoints(1).unwrap();

        fs::remove_dir_all(chaos.root()).unwrap();
        assert!(matches!(
            chaos.repo.create_checkpoint(None),
            Err(RetraceError::PreconditionFailed(_))
        ));
        assert!(matches!(
            chaos.repo.restore(versions[0], false),
            Err(RetraceError::PreconditionFailed(_))
        ));
        assert_eq!(chaos.ledger_state().len(), 1);
    }

    #[test]
    fn test_lost_allocation_race_is_retryable() {
        let mut chaos = RetraceChaosTest::new();
        chaos.create_test_checkpoints(4).unwrap();

        // A second writer on the same store holds its allocation open
        let other = Ledger::new(
            Arc::new(Database::open(&chaos.storage().join(DATABASE_FILE)).unwrap()),
            StoreId::new("chaos"),
        );
        let mut lost = None;
        let winner = other
            .allocate_and_create_with(Some("other writer".to_string()), Utc::now(), |planned| {
                assert_eq!(planned.version, 5);
                lost = Some(chaos.repo.create_checkpoint(Some("loser".to_string())));
                Ok(())
            })
            .unwrap();
        assert_eq!(winner.version, 5);

        let err = lost.unwrap().unwrap_err();
        assert!(matches!(err, RetraceError::Conflict { version: 5 }), "unexpected error: {}", err);
        assert!(err.is_recoverable());
        assert!(!chaos.snapshot_dir(5).exists());

        let retried = chaos.repo.create_checkpoint(Some("loser".to_string())).unwrap();
        assert_eq!(retried.version, 6);
        assert_eq!(retried.parent_version, Some(5));

        // The winner wrote a ledger row but no snapshot
        assert!(matches!(
            chaos.repo.restore(5, false),
            Err(RetraceError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_on_one_store() {
        let chaos = RetraceChaosTest::new();
        fs::write(chaos.root().join("shared.txt"), "shared").unwrap();

        let handles: Vec<Arc<Repository>> = (0..3)
            .map(|_| {
                Arc::new(
                    Repository::open(chaos.root().to_path_buf(), chaos.storage().to_path_buf())
                        .unwrap(),
                )
            })
            .collect();

        let threads: Vec<_> = handles
            .iter()
            .enumerate()
            .map(|(writer, repo)| {
                let repo = Arc::clone(repo);
                thread::spawn(move || {
                    let mut versions = Vec::new();
                    let mut conflicts = 0;
                    for round in 0..3 {
                        loop {
                            let message = format!("writer {} round {}", writer, round);
                            match repo.create_checkpoint(Some(message)) {
                                Ok(checkpoint) => {
                                    versions.push(checkpoint.version);
                                    break;
                                }
                                Err(e) if e.is_recoverable() && conflicts < 100 => conflicts += 1,
                                Err(e) => panic!("writer {} failed: {}", writer, e),
                            }
                        }
                    }
                    versions
                })
            })
            .collect();

        let mut all = Vec::new();
        for thread in threads {
            all.extend(thread.join().unwrap());
        }

        let unique: BTreeSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), 9, "duplicate versions: {:?}", all);
        assert_eq!(chaos.ledger_state().len(), 9);
        for version in &unique {
            assert!(chaos.snapshot_dir(*version).exists(), "v{} has no snapshot", version);
            assert_eq!(chaos.repo.file_versions(*version).unwrap().len(), 1);
        }
    }
}
