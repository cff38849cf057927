//! Sorted runs with reference counted lifetime
//!
//! A `SortedRun` wraps one committed SSTable. Readers `acquire()` it before
//! use and `release()` it afterwards. `delete_on_close()` marks the run as
//! obsolete; the files are removed once the usage count drops to zero, so
//! a scan that started before a compaction swap can still finish.

use super::format::RunMetadata;
use super::sstable::{RunFiles, SSTableIterator, SSTableReader};
use crate::types::Tuple;
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Default)]
struct Usage {
    count: usize,
    delete_pending: bool,
    deleted: bool,
}

pub struct SortedRun {
    table_number: u64,
    metadata: RunMetadata,
    reader: Arc<SSTableReader>,
    usage: Mutex<Usage>,
}

impl SortedRun {
    /// Open a committed run
    pub fn open(files: RunFiles, table_number: u64, key_cache_entries: usize) -> Result<Self> {
        let metadata = RunMetadata::read_from(&files.meta)?;
        let reader = SSTableReader::open(files, key_cache_entries)?;

        if reader.tuple_count() as u64 != metadata.tuples {
            return Err(crate::StorageError::Corruption(format!(
                "run {} holds {} records but metadata says {}",
                table_number,
                reader.tuple_count(),
                metadata.tuples
            )));
        }

        Ok(Self {
            table_number,
            metadata,
            reader: Arc::new(reader),
            usage: Mutex::new(Usage::default()),
        })
    }

    pub fn table_number(&self) -> u64 {
        self.table_number
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn tuple_count(&self) -> u64 {
        self.metadata.tuples
    }

    pub fn size(&self) -> u64 {
        self.reader.data_size()
    }

    pub fn files(&self) -> &RunFiles {
        self.reader.files()
    }

    /// Modification time of the data file
    pub fn last_modified(&self) -> SystemTime {
        std::fs::metadata(&self.files().data)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now())
    }

    /// Register a reader; fails once the run is scheduled for deletion
    pub fn acquire(&self) -> bool {
        let mut usage = self.usage.lock();
        if usage.delete_pending || usage.deleted {
            return false;
        }
        usage.count += 1;
        true
    }

    /// Unregister a reader; removes the files if this was the last one
    pub fn release(&self) {
        let delete_now = {
            let mut usage = self.usage.lock();
            if usage.count == 0 {
                tracing::warn!(table_number = self.table_number, "release without acquire");
                return;
            }
            usage.count -= 1;
            Self::take_deletion(&mut usage)
        };

        if delete_now {
            self.delete_files();
        }
    }

    /// Schedule the run for deletion once no reader uses it
    pub fn delete_on_close(&self) {
        let delete_now = {
            let mut usage = self.usage.lock();
            usage.delete_pending = true;
            Self::take_deletion(&mut usage)
        };

        if delete_now {
            self.delete_files();
        }
    }

    fn take_deletion(usage: &mut Usage) -> bool {
        if usage.count == 0 && usage.delete_pending && !usage.deleted {
            usage.deleted = true;
            return true;
        }
        false
    }

    fn delete_files(&self) {
        tracing::debug!(table_number = self.table_number, file = %self.files().data.display(), "deleting sorted run");
        if let Err(e) = self.files().delete() {
            tracing::error!(table_number = self.table_number, error = %e, "failed to delete sorted run");
        }
    }

    pub fn usage_count(&self) -> usize {
        self.usage.lock().count
    }

    pub fn is_deleted(&self) -> bool {
        self.usage.lock().deleted
    }

    pub fn is_delete_pending(&self) -> bool {
        self.usage.lock().delete_pending
    }

    /// All versions of `key` (caller holds an acquisition)
    pub fn get(&self, key: &str) -> Result<Vec<Tuple>> {
        self.reader.get(key)
    }

    /// Scan in storage order (caller holds an acquisition)
    pub fn iter(&self) -> SSTableIterator {
        self.reader.iter()
    }
}

impl std::fmt::Debug for SortedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedRun")
            .field("table_number", &self.table_number)
            .field("tuples", &self.metadata.tuples)
            .finish()
    }
}

/// A set of acquired runs, released on drop
pub struct AcquiredRuns {
    runs: Vec<Arc<SortedRun>>,
}

impl AcquiredRuns {
    /// Acquire every run of `runs`, or none of them
    pub fn try_acquire(runs: &[Arc<SortedRun>]) -> Option<Self> {
        let mut acquired: Vec<Arc<SortedRun>> = Vec::with_capacity(runs.len());
        for run in runs {
            if !run.acquire() {
                for taken in &acquired {
                    taken.release();
                }
                return None;
            }
            acquired.push(Arc::clone(run));
        }
        Some(Self { runs: acquired })
    }

    pub fn runs(&self) -> &[Arc<SortedRun>] {
        &self.runs
    }
}

impl Drop for AcquiredRuns {
    fn drop(&mut self) {
        for run in &self.runs {
            run.release();
        }
    }
}
