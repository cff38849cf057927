//! Tuple store manager: write buffer plus sorted runs of one store
//!
//! ## Read path
//! Active memtable, then memtables waiting for flush (newest first), then
//! every sorted run. All versions found are returned; version resolution is
//! the caller's business.
//!
//! ## Write path
//! Writes go to the active memtable. A full memtable is moved to the
//! unflushed queue and a background thread turns it into a new sorted run.
//! A failed flush switches the store to read only; the memtable stays in
//! the queue so its tuples remain readable.
//!
//! ## Thread management
//! The flush thread only holds a `Weak` reference to the manager and exits
//! when the command channel is closed.

use super::format::{self, SST_FILE_SUFFIX, SST_INDEX_SUFFIX, SST_META_SUFFIX};
use super::sorted_run::{AcquiredRuns, SortedRun};
use super::sstable::{RunFiles, SSTableWriter};
use super::{DuplicateResolver, Memtable};
use crate::config::{StoreConfig, TupleStoreConfiguration};
use crate::types::{Hyperrectangle, Tuple, TupleStoreName};
use crate::{Result, StorageError};
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Attempts to take a consistent snapshot of the run set
const MAX_ACQUIRE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    ReadWrite,
    /// Entered on split/merge or fatal I/O errors; rejects writes
    ReadOnly,
}

enum FlushCommand {
    Flush,
}

pub struct TupleStoreManager {
    name: TupleStoreName,
    directory: PathBuf,
    prefix: String,
    configuration: TupleStoreConfiguration,
    resolver: Arc<dyn DuplicateResolver>,

    memtable_max_entries: usize,
    memtable_max_bytes: usize,
    key_cache_entries: usize,

    /// Memtable accepting writes
    active: RwLock<Arc<Memtable>>,

    /// Memtables waiting for flush, oldest first
    unflushed: RwLock<VecDeque<Arc<Memtable>>>,

    /// Visible runs, replaced as a whole (copy on write)
    runs: RwLock<Arc<Vec<Arc<SortedRun>>>>,

    state: RwLock<StoreState>,
    next_table_number: AtomicU64,

    /// Serializes flushes so runs are created in memtable order
    flush_lock: Mutex<()>,

    flush_sender: Mutex<Option<Sender<FlushCommand>>>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TupleStoreManager {
    /// Open (or create) the store below `storage_dir`, loading existing runs
    pub fn open(
        storage_dir: &Path,
        name: TupleStoreName,
        configuration: TupleStoreConfiguration,
        config: &StoreConfig,
    ) -> Result<Arc<Self>> {
        let directory = name.directory(storage_dir);
        std::fs::create_dir_all(&directory)?;

        let prefix = format::table_prefix(&name.to_string());
        let (runs, next_table_number) =
            Self::recover_runs(&directory, &prefix, config.key_cache_entries)?;

        tracing::info!(store = %name, runs = runs.len(), "opened tuple store");

        let manager = Arc::new(Self {
            resolver: configuration.duplicate_resolver(),
            name,
            directory,
            prefix,
            configuration,
            memtable_max_entries: config.memtable_max_entries,
            memtable_max_bytes: config.memtable_max_bytes,
            key_cache_entries: config.key_cache_entries,
            active: RwLock::new(Arc::new(Memtable::new(
                config.memtable_max_entries,
                config.memtable_max_bytes,
            ))),
            unflushed: RwLock::new(VecDeque::new()),
            runs: RwLock::new(Arc::new(runs)),
            state: RwLock::new(StoreState::ReadWrite),
            next_table_number: AtomicU64::new(next_table_number),
            flush_lock: Mutex::new(()),
            flush_sender: Mutex::new(None),
            flush_thread: Mutex::new(None),
        });

        manager.start_flush_thread()?;
        Ok(manager)
    }

    /// Load committed runs, drop incomplete ones, return the next table number
    fn recover_runs(
        directory: &Path,
        prefix: &str,
        key_cache_entries: usize,
    ) -> Result<(Vec<Arc<SortedRun>>, u64)> {
        let mut committed = BTreeSet::new();
        let mut seen = BTreeSet::new();

        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            if let Some(number) = format::parse_table_number(file_name, prefix, SST_META_SUFFIX) {
                committed.insert(number);
                seen.insert(number);
            } else if let Some(number) = format::parse_table_number(file_name, prefix, SST_FILE_SUFFIX)
                .or_else(|| format::parse_table_number(file_name, prefix, SST_INDEX_SUFFIX))
            {
                seen.insert(number);
            }
        }

        let mut runs = Vec::new();
        for number in &seen {
            let files = RunFiles::new(directory, prefix, *number);
            if !committed.contains(number) {
                tracing::warn!(file = %files.data.display(), "removing uncommitted sorted run");
                files.delete()?;
                continue;
            }

            match SortedRun::open(files.clone(), *number, key_cache_entries) {
                Ok(run) => runs.push(Arc::new(run)),
                Err(e) => {
                    tracing::error!(file = %files.data.display(), error = %e, "removing unreadable sorted run");
                    files.delete()?;
                }
            }
        }

        let next = seen.iter().next_back().map(|n| n + 1).unwrap_or(0);
        Ok((runs, next))
    }

    fn start_flush_thread(self: &Arc<Self>) -> Result<()> {
        let (sender, receiver) = channel::unbounded::<FlushCommand>();
        let weak: Weak<TupleStoreManager> = Arc::downgrade(self);
        let thread_name = format!("flush-{}", self.name);

        let handle = thread::Builder::new().name(thread_name).spawn(move || {
            while let Ok(FlushCommand::Flush) = receiver.recv() {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = manager.flush_pending() {
                    tracing::error!(store = %manager.name, error = %e, "background flush failed");
                }
            }
        })?;

        *self.flush_sender.lock() = Some(sender);
        *self.flush_thread.lock() = Some(handle);
        Ok(())
    }

    pub fn name(&self) -> &TupleStoreName {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn configuration(&self) -> &TupleStoreConfiguration {
        &self.configuration
    }

    pub fn duplicate_resolver(&self) -> Arc<dyn DuplicateResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn key_cache_entries(&self) -> usize {
        self.key_cache_entries
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    pub fn is_read_only(&self) -> bool {
        self.state() == StoreState::ReadOnly
    }

    /// Reject all further writes; there is no way back to read-write
    pub fn set_read_only(&self) {
        let mut state = self.state.write();
        if *state != StoreState::ReadOnly {
            tracing::info!(store = %self.name, "tuple store switched to read only");
            *state = StoreState::ReadOnly;
        }
    }

    /// Insert a tuple, flushing to disk in the background when needed
    pub fn put(&self, tuple: Tuple) -> Result<()> {
        self.put_with(tuple, true, true)
    }

    /// Insert a tuple
    ///
    /// - `store_on_disk = false` keeps the write buffer in memory only
    /// - `allow_unflushed = false` returns only after the tuple is on disk
    pub fn put_with(&self, tuple: Tuple, store_on_disk: bool, allow_unflushed: bool) -> Result<()> {
        let memtable = {
            // set_read_only waits for writes holding the state guard, rotation
            // for writes holding the active guard
            let state = self.state.read();
            if *state == StoreState::ReadOnly {
                return Err(StorageError::ReadOnly(self.name.to_string()));
            }
            let active = self.active.read();
            active.put(tuple);
            active.clone()
        };

        if !allow_unflushed {
            return self.flush();
        }

        if store_on_disk && memtable.is_full() && self.rotate_memtable(&memtable) {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Store a tombstone for `key`
    pub fn delete(&self, key: &str, version: i64) -> Result<()> {
        self.put(Tuple::tombstone(key, version))
    }

    /// Move `expected` to the unflushed queue if it is still the active memtable
    fn rotate_memtable(&self, expected: &Arc<Memtable>) -> bool {
        let mut active = self.active.write();
        if !Arc::ptr_eq(&active, expected) || active.is_empty() {
            return false;
        }
        let mut unflushed = self.unflushed.write();
        let old = std::mem::replace(
            &mut *active,
            Arc::new(Memtable::new(self.memtable_max_entries, self.memtable_max_bytes)),
        );
        unflushed.push_back(old);
        true
    }

    fn schedule_flush(&self) {
        let sender = self.flush_sender.lock();
        let sent = sender
            .as_ref()
            .map(|s| s.send(FlushCommand::Flush).is_ok())
            .unwrap_or(false);
        if !sent {
            tracing::warn!(store = %self.name, "flush thread not running, memtable stays in memory");
        }
    }

    /// Flush the active memtable and everything queued, synchronously
    pub fn flush(&self) -> Result<()> {
        let active = self.active.read().clone();
        self.rotate_memtable(&active);
        self.flush_pending()
    }

    /// Write every queued memtable to a new run, oldest first
    fn flush_pending(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();

        loop {
            let Some(memtable) = self.unflushed.read().front().cloned() else {
                return Ok(());
            };

            match self.write_run(&memtable.sorted_tuples()) {
                Ok(run) => {
                    tracing::debug!(
                        store = %self.name,
                        table_number = run.table_number(),
                        tuples = run.tuple_count(),
                        "memtable flushed"
                    );
                    {
                        let mut runs = self.runs.write();
                        let mut updated = runs.as_ref().clone();
                        updated.push(run);
                        *runs = Arc::new(updated);
                    }
                    let mut unflushed = self.unflushed.write();
                    if unflushed.front().map(|m| Arc::ptr_eq(m, &memtable)).unwrap_or(false) {
                        unflushed.pop_front();
                    }
                }
                Err(e) => {
                    tracing::error!(store = %self.name, error = %e, "flush failed, store becomes read only");
                    self.set_read_only();
                    return Err(e);
                }
            }
        }
    }

    /// Next table number for a new run
    pub fn allocate_table_number(&self) -> u64 {
        self.next_table_number.fetch_add(1, Ordering::SeqCst)
    }

    /// File names of run `table_number`
    pub fn run_files(&self, table_number: u64) -> RunFiles {
        RunFiles::new(&self.directory, &self.prefix, table_number)
    }

    /// Write sorted tuples to a new committed run
    pub fn write_run(&self, tuples: &[Tuple]) -> Result<Arc<SortedRun>> {
        let table_number = self.allocate_table_number();
        let mut writer = SSTableWriter::new(self.run_files(table_number))?;
        for tuple in tuples {
            if let Err(e) = writer.add(tuple) {
                writer.abort();
                return Err(e);
            }
        }
        let (files, _) = writer.finish()?;
        self.open_run(files, table_number)
    }

    /// Open a freshly committed run; its files are removed if that fails
    pub fn open_run(&self, files: RunFiles, table_number: u64) -> Result<Arc<SortedRun>> {
        match SortedRun::open(files.clone(), table_number, self.key_cache_entries) {
            Ok(run) => Ok(Arc::new(run)),
            Err(e) => {
                if let Err(cleanup) = files.delete() {
                    tracing::warn!(
                        store = %self.name,
                        table_number,
                        error = %cleanup,
                        "could not remove files of unreadable run"
                    );
                }
                Err(e)
            }
        }
    }

    /// Snapshot of the visible runs (not acquired)
    pub fn sstables(&self) -> Arc<Vec<Arc<SortedRun>>> {
        self.runs.read().clone()
    }

    /// Acquire every visible run; retried while compactions swap the set
    pub fn acquire_sstables(&self) -> Result<AcquiredRuns> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let snapshot = self.sstables();
            if let Some(acquired) = AcquiredRuns::try_acquire(&snapshot) {
                return Ok(acquired);
            }
        }
        Err(StorageError::ResourceExhausted(format!(
            "unable to acquire sstables of {}",
            self.name
        )))
    }

    fn memtables(&self) -> Vec<Arc<Memtable>> {
        let mut memtables = vec![self.active.read().clone()];
        memtables.extend(self.unflushed.read().iter().rev().cloned());
        memtables
    }

    /// Every stored version of `key`, newest first
    pub fn get(&self, key: &str) -> Result<Vec<Tuple>> {
        let mut result = Vec::new();
        for memtable in self.memtables() {
            result.extend(memtable.get(key));
        }

        let acquired = self.acquire_sstables()?;
        for run in acquired.runs() {
            result.extend(run.get(key)?);
        }

        Ok(normalize(result))
    }

    /// Every stored version whose bounding box intersects `bbox`
    pub fn query_box(&self, bbox: &Hyperrectangle) -> Result<Vec<Tuple>> {
        let mut result = Vec::new();
        self.for_each_tuple(|tuple| {
            if tuple.bounding_box().intersects(bbox) {
                result.push(tuple.clone());
            }
            Ok(())
        })?;
        Ok(normalize(result))
    }

    /// Visit every stored tuple version (memtables first, then runs)
    pub fn for_each_tuple<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Tuple) -> Result<()>,
    {
        for memtable in self.memtables() {
            for tuple in memtable.sorted_tuples() {
                f(&tuple)?;
            }
        }

        let acquired = self.acquire_sstables()?;
        for run in acquired.runs() {
            for tuple in run.iter() {
                f(&tuple?)?;
            }
        }
        Ok(())
    }

    /// Swap `old_runs` for `new_runs` in one step, then retire the old runs
    pub fn replace_compacted_sstables(
        &self,
        new_runs: Vec<Arc<SortedRun>>,
        old_runs: &[Arc<SortedRun>],
    ) -> Result<()> {
        {
            let mut runs = self.runs.write();
            let missing = old_runs
                .iter()
                .find(|old| !runs.iter().any(|r| Arc::ptr_eq(r, old)));
            if let Some(old) = missing {
                return Err(StorageError::IllegalState(format!(
                    "run {} of {} is no longer visible",
                    old.table_number(),
                    self.name
                )));
            }

            let mut updated: Vec<Arc<SortedRun>> = runs
                .iter()
                .filter(|r| !old_runs.iter().any(|old| Arc::ptr_eq(r, old)))
                .cloned()
                .collect();
            updated.extend(new_runs);
            updated.sort_by_key(|r| r.table_number());
            *runs = Arc::new(updated);
        }

        for old in old_runs {
            old.delete_on_close();
        }
        Ok(())
    }

    /// Stored bytes (runs plus write buffers)
    pub fn size(&self) -> u64 {
        let on_disk: u64 = self.sstables().iter().map(|r| r.size()).sum();
        let in_memory: usize = self.memtables().iter().map(|m| m.size()).sum();
        on_disk + in_memory as u64
    }

    /// Stored tuple versions (runs plus write buffers)
    pub fn tuple_count(&self) -> u64 {
        let on_disk: u64 = self.sstables().iter().map(|r| r.tuple_count()).sum();
        let in_memory: usize = self.memtables().iter().map(|m| m.len()).sum();
        on_disk + in_memory as u64
    }

    fn stop_flush_thread(&self) {
        self.flush_sender.lock().take();
        if let Some(handle) = self.flush_thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(store = %self.name, "flush thread panicked");
            }
        }
    }

    /// Stop background work, flushing buffered tuples unless read only
    pub fn shutdown(&self) -> Result<()> {
        self.stop_flush_thread();
        if self.is_read_only() {
            return Ok(());
        }
        self.flush()
    }

    /// Drop all data of this store; files in use are removed on release
    pub fn delete_all(&self) -> Result<()> {
        self.set_read_only();
        self.stop_flush_thread();

        let _guard = self.flush_lock.lock();
        *self.active.write() = Arc::new(Memtable::new(self.memtable_max_entries, self.memtable_max_bytes));
        self.unflushed.write().clear();

        let old = std::mem::replace(&mut *self.runs.write(), Arc::new(Vec::new()));
        for run in old.iter() {
            run.delete_on_close();
        }

        if let Err(e) = std::fs::remove_dir(&self.directory) {
            tracing::debug!(store = %self.name, error = %e, "store directory not removed yet");
        }
        tracing::info!(store = %self.name, "tuple store deleted");
        Ok(())
    }
}

impl Drop for TupleStoreManager {
    fn drop(&mut self) {
        // closing the channel ends the flush thread
        self.flush_sender.get_mut().take();
    }
}

/// Sort newest first per key and drop repeated (key, version) pairs
fn normalize(mut tuples: Vec<Tuple>) -> Vec<Tuple> {
    tuples.sort_by(|a, b| a.storage_order(b));
    tuples.dedup_by(|a, b| a.key() == b.key() && a.version() == b.version());
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_name() -> TupleStoreName {
        TupleStoreName::new("grp", "tbl").unwrap().with_region(1)
    }

    fn open(dir: &Path, config: &StoreConfig) -> Arc<TupleStoreManager> {
        TupleStoreManager::open(dir, store_name(), TupleStoreConfiguration::with_duplicates(), config).unwrap()
    }

    fn tuple(key: &str, version: i64, value: &str) -> Tuple {
        Tuple::with_version(key, Hyperrectangle::from_bounds(&[0.0, 1.0]).unwrap(), value.as_bytes().to_vec(), version)
    }

    #[test]
    fn test_put_get_memtable_and_runs() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));

        manager.put(tuple("k", 1, "old")).unwrap();
        manager.flush().unwrap();
        manager.put(tuple("k", 2, "new")).unwrap();

        let versions: Vec<i64> = manager.get("k").unwrap().iter().map(|t| t.version()).collect();
        assert_eq!(versions, vec![2, 1]);
        assert_eq!(manager.sstables().len(), 1);
    }

    #[test]
    fn test_background_flush_on_full_memtable() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::for_testing(dir.path());
        config.memtable_max_entries = 10;
        let manager = open(dir.path(), &config);

        for i in 0..25 {
            manager.put(tuple(&format!("key{:03}", i), 1, "v")).unwrap();
        }

        for _ in 0..200 {
            if manager.sstables().len() >= 2 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(manager.sstables().len(), 2);
        for i in 0..25 {
            assert_eq!(manager.get(&format!("key{:03}", i)).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_synchronous_put() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));
        manager.put_with(tuple("k", 1, "v"), true, false).unwrap();
        assert_eq!(manager.sstables().len(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));
        manager.set_read_only();
        assert!(matches!(manager.put(tuple("k", 1, "v")), Err(StorageError::ReadOnly(_))));
    }

    #[test]
    fn test_flush_failure_switches_to_read_only() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));
        manager.put(tuple("k", 1, "v")).unwrap();

        // occupy the file name of the next run so the writer cannot create it
        let blocked = manager.run_files(manager.next_table_number.load(Ordering::SeqCst));
        std::fs::write(&blocked.data, b"x").unwrap();

        assert!(manager.flush().is_err());
        assert!(manager.is_read_only());
        assert_eq!(manager.get("k").unwrap().len(), 1);
    }

    #[test]
    fn test_recovery_after_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        {
            let manager = open(dir.path(), &config);
            manager.put(tuple("a", 1, "v")).unwrap();
            manager.flush().unwrap();
            manager.put(tuple("b", 1, "v")).unwrap();
            manager.shutdown().unwrap();
        }

        // leftover of an interrupted write
        let prefix = format::table_prefix(&store_name().to_string());
        let orphan = RunFiles::new(&store_name().directory(dir.path()), &prefix, 99);
        std::fs::write(&orphan.data, b"partial").unwrap();

        let manager = open(dir.path(), &config);
        assert_eq!(manager.sstables().len(), 2);
        assert_eq!(manager.get("a").unwrap().len(), 1);
        assert_eq!(manager.get("b").unwrap().len(), 1);
        assert!(!orphan.data.exists());
        assert_eq!(manager.allocate_table_number(), 100);
    }

    #[test]
    fn test_replace_compacted_sstables() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));
        let a = manager.write_run(&[tuple("a", 1, "v")]).unwrap();
        let b = manager.write_run(&[tuple("b", 1, "v")]).unwrap();
        manager.replace_compacted_sstables(vec![a.clone(), b.clone()], &[]).unwrap();

        let held = AcquiredRuns::try_acquire(&[a.clone()]).unwrap();
        let merged = manager.write_run(&[tuple("a", 1, "v"), tuple("b", 1, "v")]).unwrap();
        manager.replace_compacted_sstables(vec![merged], &[a.clone(), b.clone()]).unwrap();

        assert_eq!(manager.sstables().len(), 1);
        assert!(a.files().data.exists());
        assert!(!b.files().data.exists());
        drop(held);
        assert!(!a.files().data.exists());

        assert!(manager.replace_compacted_sstables(vec![], &[a]).is_err());
    }

    #[test]
    fn test_query_box() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));
        manager
            .put(Tuple::with_version("near", Hyperrectangle::from_bounds(&[0.0, 1.0]).unwrap(), b"v".to_vec(), 1))
            .unwrap();
        manager.flush().unwrap();
        manager
            .put(Tuple::with_version("far", Hyperrectangle::from_bounds(&[10.0, 11.0]).unwrap(), b"v".to_vec(), 1))
            .unwrap();

        let found = manager.query_box(&Hyperrectangle::from_bounds(&[0.5, 0.7]).unwrap()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), "near");
    }

    #[test]
    fn test_delete_all() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));
        manager.put(tuple("a", 1, "v")).unwrap();
        manager.flush().unwrap();
        let directory = manager.directory().to_path_buf();

        manager.delete_all().unwrap();
        assert!(manager.is_read_only());
        assert!(!directory.exists());
    }

    #[test]
    fn test_rotation_waits_for_in_flight_write() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));

        // a writer that already holds the active memtable
        let in_flight = manager.active.read();
        let flusher = {
            let manager = manager.clone();
            thread::spawn(move || manager.flush())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!flusher.is_finished());
        assert!(manager.sstables().is_empty());

        in_flight.put(tuple("k", 1, "v"));
        drop(in_flight);
        flusher.join().unwrap().unwrap();

        let runs = manager.sstables();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].tuple_count(), 1);
        assert!(manager.active.read().is_empty());
        assert!(manager.unflushed.read().is_empty());
    }

    #[test]
    fn test_read_only_switch_waits_for_in_flight_write() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));

        // a writer past the state check
        let state = manager.state.read();
        let freezer = {
            let manager = manager.clone();
            thread::spawn(move || manager.set_read_only())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!freezer.is_finished());

        manager.active.read().put(tuple("k", 1, "v"));
        drop(state);
        freezer.join().unwrap();

        assert!(matches!(manager.put(tuple("k", 2, "v")), Err(StorageError::ReadOnly(_))));
        manager.flush().unwrap();
        let versions: Vec<i64> = manager.get("k").unwrap().iter().map(|t| t.version()).collect();
        assert_eq!(versions, vec![1]);
        assert_eq!(manager.sstables().iter().map(|r| r.tuple_count()).sum::<u64>(), 1);
    }

    #[test]
    fn test_acknowledged_writes_survive_freeze_and_flush() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::for_testing(dir.path());
        config.memtable_max_entries = 16;
        let manager = open(dir.path(), &config);

        let writer = {
            let manager = manager.clone();
            thread::spawn(move || {
                let mut acknowledged = 0u64;
                for i in 0..20_000 {
                    match manager.put(tuple(&format!("k{:06}", i), 1, "v")) {
                        Ok(()) => acknowledged += 1,
                        Err(StorageError::ReadOnly(_)) => break,
                        Err(e) => panic!("unexpected error {}", e),
                    }
                }
                acknowledged
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        manager.set_read_only();
        manager.flush().unwrap();
        let acknowledged = writer.join().unwrap();

        assert!(manager.active.read().is_empty());
        assert!(manager.unflushed.read().is_empty());
        let on_disk: u64 = manager.sstables().iter().map(|r| r.tuple_count()).sum();
        assert_eq!(on_disk, acknowledged);
    }

    #[test]
    fn test_unreadable_run_reports_open_error() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), &StoreConfig::for_testing(dir.path()));

        let files = manager.run_files(77);
        std::fs::write(&files.meta, b"not json").unwrap();
        // a directory in place of the data file cannot be removed with remove_file
        std::fs::create_dir(&files.data).unwrap();
        std::fs::write(files.data.join("keep"), b"x").unwrap();

        assert!(matches!(manager.open_run(files.clone(), 77), Err(StorageError::Serialization(_))));
        assert!(!files.meta.exists());
        assert!(files.data.exists());
    }
}
