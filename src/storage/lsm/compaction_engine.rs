//! Background compaction, one thread per storage directory
//!
//! ## Cycle
//! For every store of the directory that is writable (and whose region is
//! active when the store is distributed):
//! 1. ask the merge strategy for a task and execute it
//! 2. let the region coordinator split or merge the region
//!
//! Errors of one store are logged and the cycle moves on. Cycles of one
//! directory never overlap.
//!
//! ## Thread Management
//! - The thread holds a `Weak` reference to the registry
//! - Shutdown closes the stop channel, which ends the wait immediately

use super::compaction::{execute_merge_task, MergeStrategy, MergeTaskType};
use super::manager::TupleStoreManager;
use crate::storage::registry::TupleStoreManagerRegistry;
use crate::types::TupleStoreName;
use crate::Result;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Split/merge hook for distributed stores
pub trait RegionCoordinator: Send + Sync {
    /// Whether the region behind `name` takes part in maintenance
    fn is_region_active(&self, name: &TupleStoreName) -> bool;

    /// Split or merge the region of `manager` if its size asks for it
    fn check_split_and_merge(&self, manager: &Arc<TupleStoreManager>) -> Result<()>;
}

/// Outcome of one compaction cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub stores_checked: usize,
    pub stores_skipped: usize,
    pub compactions: usize,
    pub failures: usize,
}

/// Compaction logic of one storage directory
pub struct CompactionWorker {
    directory: PathBuf,
    registry: Weak<TupleStoreManagerRegistry>,
    strategy: Arc<dyn MergeStrategy>,
    max_sstable_size: u64,
    cycle_lock: Mutex<()>,
    cycles: AtomicU64,
}

impl CompactionWorker {
    pub fn new(
        directory: PathBuf,
        registry: Weak<TupleStoreManagerRegistry>,
        strategy: Arc<dyn MergeStrategy>,
        max_sstable_size: u64,
    ) -> Self {
        Self {
            directory,
            registry,
            strategy,
            max_sstable_size,
            cycle_lock: Mutex::new(()),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn strategy(&self) -> &Arc<dyn MergeStrategy> {
        &self.strategy
    }

    pub fn completed_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Process every store of the directory once
    pub fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock();
        let mut report = CycleReport::default();

        let Some(registry) = self.registry.upgrade() else {
            return report;
        };
        let coordinator = registry.region_coordinator();

        for manager in registry.stores_in_directory(&self.directory) {
            if manager.is_read_only() {
                report.stores_skipped += 1;
                continue;
            }

            let coordinated = coordinator
                .as_ref()
                .filter(|_| manager.name().is_distributed());

            if let Some(coordinator) = coordinated {
                if !coordinator.is_region_active(manager.name()) {
                    report.stores_skipped += 1;
                    continue;
                }
            }

            report.stores_checked += 1;
            match self.compact_store(&manager) {
                Ok(true) => report.compactions += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(store = %manager.name(), error = %e, "compaction failed");
                    continue;
                }
            }

            if let Some(coordinator) = coordinated {
                if let Err(e) = coordinator.check_split_and_merge(&manager) {
                    report.failures += 1;
                    tracing::error!(store = %manager.name(), error = %e, "region split/merge failed");
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        report
    }

    fn compact_store(&self, manager: &TupleStoreManager) -> Result<bool> {
        let task = self.strategy.merge_task(&manager.sstables());
        if task.task_type == MergeTaskType::None {
            return Ok(false);
        }
        let stats = execute_merge_task(manager, &task, self.max_sstable_size)?;
        Ok(stats.is_some())
    }
}

/// Thread driving a `CompactionWorker`
pub struct CompactionEngine {
    worker: Arc<CompactionWorker>,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionEngine {
    pub fn start(worker: Arc<CompactionWorker>) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread_worker = Arc::clone(&worker);
        let name = format!("compaction-{}", worker.directory.display());

        let handle = thread::Builder::new().name(name).spawn(move || {
            tracing::info!(directory = %thread_worker.directory.display(), "compaction thread started");
            loop {
                match stop_rx.recv_timeout(thread_worker.strategy.compaction_delay()) {
                    Err(RecvTimeoutError::Timeout) => {
                        let report = thread_worker.run_cycle();
                        tracing::debug!(
                            directory = %thread_worker.directory.display(),
                            checked = report.stores_checked,
                            compactions = report.compactions,
                            failures = report.failures,
                            "compaction cycle done"
                        );
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::info!(directory = %thread_worker.directory.display(), "compaction thread stopped");
        })?;

        Ok(Self {
            worker,
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn worker(&self) -> &Arc<CompactionWorker> {
        &self.worker
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the thread and wait for a running cycle to end
    pub fn shutdown(&self) {
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            // the last registry handle may be dropped by the thread itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(directory = %self.worker.directory.display(), "compaction thread panicked");
            }
        }
    }
}

impl Drop for CompactionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, TupleStoreConfiguration};
    use crate::storage::lsm::SimpleMergeStrategy;
    use crate::types::{Hyperrectangle, Tuple};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn t(key: &str, version: i64) -> Tuple {
        Tuple::with_version(key, Hyperrectangle::full_space(), b"v".to_vec(), version)
    }

    fn registry(dir: &Path) -> Arc<TupleStoreManagerRegistry> {
        TupleStoreManagerRegistry::open(StoreConfig::for_testing(dir)).unwrap()
    }

    fn worker(dir: &Path, registry: &Arc<TupleStoreManagerRegistry>) -> CompactionWorker {
        let config = StoreConfig::for_testing(dir);
        CompactionWorker::new(
            dir.to_path_buf(),
            Arc::downgrade(registry),
            Arc::new(SimpleMergeStrategy::from_config(&config)),
            config.max_sstable_size,
        )
    }

    fn two_runs(manager: &TupleStoreManager) {
        manager.put(t("a", 1)).unwrap();
        manager.flush().unwrap();
        manager.put(t("b", 1)).unwrap();
        manager.flush().unwrap();
    }

    #[test]
    fn test_cycle_compacts_and_skips_read_only() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path());
        let writable = registry
            .create_store(&TupleStoreName::new("g", "writable").unwrap(), TupleStoreConfiguration::default())
            .unwrap();
        let frozen = registry
            .create_store(&TupleStoreName::new("g", "frozen").unwrap(), TupleStoreConfiguration::default())
            .unwrap();
        two_runs(&writable);
        two_runs(&frozen);
        frozen.set_read_only();

        let report = worker(dir.path(), &registry).run_cycle();
        assert_eq!(report.compactions, 1);
        assert_eq!(report.stores_skipped, 1);
        assert_eq!(writable.sstables().len(), 1);
        assert_eq!(frozen.sstables().len(), 2);
    }

    struct CountingCoordinator {
        active: bool,
        checks: AtomicUsize,
    }

    impl RegionCoordinator for CountingCoordinator {
        fn is_region_active(&self, _name: &TupleStoreName) -> bool {
            self.active
        }

        fn check_split_and_merge(&self, _manager: &Arc<TupleStoreManager>) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Err(crate::StorageError::Partitioner("zookeeper gone".into()))
        }
    }

    #[test]
    fn test_coordinator_errors_do_not_stop_cycle() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path());
        let coordinator = Arc::new(CountingCoordinator {
            active: true,
            checks: AtomicUsize::new(0),
        });
        registry.set_region_coordinator(Some(coordinator.clone()));

        for region in 1..=2 {
            let name = TupleStoreName::new("g", "t").unwrap().with_region(region);
            let manager = registry.create_store(&name, TupleStoreConfiguration::default()).unwrap();
            two_runs(&manager);
        }

        let report = worker(dir.path(), &registry).run_cycle();
        assert_eq!(report.compactions, 2);
        assert_eq!(report.failures, 2);
        assert_eq!(coordinator.checks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_inactive_region_is_skipped() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path());
        registry.set_region_coordinator(Some(Arc::new(CountingCoordinator {
            active: false,
            checks: AtomicUsize::new(0),
        })));

        let name = TupleStoreName::new("g", "t").unwrap().with_region(7);
        let manager = registry.create_store(&name, TupleStoreConfiguration::default()).unwrap();
        two_runs(&manager);

        let report = worker(dir.path(), &registry).run_cycle();
        assert_eq!(report.stores_skipped, 1);
        assert_eq!(manager.sstables().len(), 2);
    }

    #[test]
    fn test_engine_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path());
        let config = StoreConfig::for_testing(dir.path());
        let strategy = SimpleMergeStrategy::new(
            config.small_table_threshold(),
            Duration::from_secs(3600),
            Duration::from_millis(10),
            10,
        );
        let worker = Arc::new(CompactionWorker::new(
            dir.path().to_path_buf(),
            Arc::downgrade(&registry),
            Arc::new(strategy),
            config.max_sstable_size,
        ));

        let engine = CompactionEngine::start(worker.clone()).unwrap();
        for _ in 0..200 {
            if worker.completed_cycles() > 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.completed_cycles() > 2);

        engine.shutdown();
        assert!(!engine.is_running());
    }
}
