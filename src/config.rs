//! Instance and table configuration
//!
//! `StoreConfig` carries the knobs of one storage node (write buffer sizes,
//! compaction cadence, query limits). `TupleStoreConfiguration` is attached
//! to every table and decides how duplicate versions are resolved.

use crate::storage::lsm::{DuplicateResolver, KeepAllResolver, NewestVersionResolver, TtlAndVersionsResolver};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage directories (one compaction engine per directory)
    pub storage_directories: Vec<PathBuf>,

    /// Maximum tuples in a write buffer before it is flushed
    pub memtable_max_entries: usize,

    /// Maximum bytes in a write buffer before it is flushed
    pub memtable_max_bytes: usize,

    /// Maximum size of a single SSTable produced by compaction (bytes)
    pub max_sstable_size: u64,

    /// Delay between two compaction cycles (seconds)
    pub compaction_delay_secs: u64,

    /// Runs not modified for this long are major compaction candidates (seconds)
    pub sstable_untouched_secs: u64,

    /// Upper bound of runs merged by one minor compaction
    pub max_merge_tables_per_job: usize,

    /// Number of keys cached per SSTable reader
    pub key_cache_entries: usize,

    /// Worker threads serving queries of one client connection
    pub max_queries_per_connection: usize,

    /// Pending queries accepted per connection before rejecting
    pub query_queue_capacity: usize,

    /// Interval of the per-connection maintenance loop (milliseconds)
    pub maintenance_interval_ms: u64,

    /// Tuples per result page for paged queries
    pub tuples_per_page: usize,

    /// Default wait used by client futures (milliseconds)
    pub future_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_directories: vec![PathBuf::from("data")],
            memtable_max_entries: 10_000,
            memtable_max_bytes: 64 * 1024 * 1024,
            max_sstable_size: 256 * 1024 * 1024,
            compaction_delay_secs: 30,
            sstable_untouched_secs: 60 * 60,
            max_merge_tables_per_job: 10,
            key_cache_entries: 1000,
            max_queries_per_connection: 4,
            query_queue_capacity: 16,
            maintenance_interval_ms: 200,
            tuples_per_page: 100,
            future_timeout_ms: 60_000,
        }
    }
}

impl StoreConfig {
    /// Small buffers and short delays, for tests and local experiments
    pub fn for_testing<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            storage_directories: vec![dir.as_ref().to_path_buf()],
            memtable_max_entries: 100,
            memtable_max_bytes: 1024 * 1024,
            max_sstable_size: 4 * 1024 * 1024,
            compaction_delay_secs: 1,
            sstable_untouched_secs: 60,
            key_cache_entries: 64,
            maintenance_interval_ms: 20,
            tuples_per_page: 10,
            future_timeout_ms: 5_000,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file; missing fields use defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_directories.is_empty() {
            return Err(StorageError::InvalidArgument("no storage directory configured".into()));
        }
        if self.memtable_max_entries == 0 || self.memtable_max_bytes == 0 {
            return Err(StorageError::InvalidArgument("memtable limits must be positive".into()));
        }
        if self.max_merge_tables_per_job < 2 {
            return Err(StorageError::InvalidArgument(
                "max_merge_tables_per_job must be at least 2".into(),
            ));
        }
        if self.max_queries_per_connection == 0 || self.tuples_per_page == 0 {
            return Err(StorageError::InvalidArgument("query limits must be positive".into()));
        }
        Ok(())
    }

    /// Runs with at least this many tuples count as "big" for the merge strategy
    pub fn small_table_threshold(&self) -> u64 {
        5 * self.memtable_max_entries as u64
    }

    pub fn compaction_delay(&self) -> Duration {
        Duration::from_secs(self.compaction_delay_secs)
    }

    pub fn sstable_untouched_threshold(&self) -> Duration {
        Duration::from_secs(self.sstable_untouched_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn future_timeout(&self) -> Duration {
        Duration::from_millis(self.future_timeout_ms)
    }
}

/// Per table configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleStoreConfiguration {
    /// Keep several versions of one key
    pub allow_duplicates: bool,

    /// Maximum versions kept when duplicates are allowed (0 = unlimited)
    pub versions: u32,

    /// Versions older than this are dropped when duplicates are allowed (0 = never)
    pub ttl_micros: u64,
}

impl Default for TupleStoreConfiguration {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
            versions: 0,
            ttl_micros: 0,
        }
    }
}

impl TupleStoreConfiguration {
    pub fn with_duplicates() -> Self {
        Self {
            allow_duplicates: true,
            ..Self::default()
        }
    }

    /// Build the duplicate resolver for this table
    pub fn duplicate_resolver(&self) -> Arc<dyn DuplicateResolver> {
        if !self.allow_duplicates {
            return Arc::new(NewestVersionResolver);
        }

        if self.versions == 0 && self.ttl_micros == 0 {
            Arc::new(KeepAllResolver)
        } else {
            Arc::new(TtlAndVersionsResolver::new(self.ttl_micros, self.versions))
        }
    }
}
