//! LSM tuple store
//!
//! ## Architecture
//! - **Memtable**: sorted in-memory write buffer
//! - **SSTable**: immutable sorted run on disk (data + index + meta file)
//! - **SortedRun**: reference counted run with deferred deletion
//! - **Compaction**: background merge of runs per storage directory

mod compaction;
mod compaction_engine;
mod duplicate_resolver;
pub mod format;
mod manager;
mod memtable;
mod merging_iterator;
mod sorted_run;
mod sstable;

pub use compaction::{
    execute_merge_task, force_major_compaction, CompactionStats, MergeStrategy, MergeTask, MergeTaskType,
    SSTableCompactor, SimpleMergeStrategy,
};
pub use compaction_engine::{CompactionEngine, CompactionWorker, CycleReport, RegionCoordinator};
pub use duplicate_resolver::{DuplicateResolver, KeepAllResolver, NewestVersionResolver, TtlAndVersionsResolver};
pub use manager::{StoreState, TupleStoreManager};
pub use memtable::Memtable;
pub use merging_iterator::{MergingIterator, TupleSource};
pub use sorted_run::{AcquiredRuns, SortedRun};
pub use sstable::{RunFiles, SSTableIterator, SSTableReader, SSTableWriter};
