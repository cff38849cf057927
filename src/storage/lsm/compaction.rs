//! Sorted run compaction
//!
//! ## Task selection
//! - MAJOR: a large run that was not modified for a while exists, so all
//!   runs of the store are merged and tombstones may be purged
//! - MINOR: up to `max_merge_tables_per_job` small runs; upgraded to MAJOR
//!   when they happen to be the whole run set
//! - NONE: fewer than two runs selected
//!
//! ## Merge
//! Inputs are merged with `MergingIterator`, each key group passes the
//! store's duplicate resolver, and the result is streamed into output runs
//! of at most `max_sstable_size` bytes. A failed merge removes every output
//! file and leaves the inputs untouched.

use super::manager::TupleStoreManager;
use super::merging_iterator::{MergingIterator, TupleSource};
use super::sorted_run::{AcquiredRuns, SortedRun};
use super::sstable::{RunFiles, SSTableWriter};
use crate::config::StoreConfig;
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTaskType {
    Major,
    Minor,
    None,
}

/// Runs selected for one compaction
#[derive(Debug, Clone)]
pub struct MergeTask {
    pub task_type: MergeTaskType,
    pub runs: Vec<Arc<SortedRun>>,
}

impl MergeTask {
    pub fn none() -> Self {
        Self {
            task_type: MergeTaskType::None,
            runs: Vec::new(),
        }
    }

    pub fn is_major(&self) -> bool {
        self.task_type == MergeTaskType::Major
    }
}

pub trait MergeStrategy: Send + Sync {
    /// Pick the runs to merge from the visible run set
    fn merge_task(&self, runs: &[Arc<SortedRun>]) -> MergeTask;

    /// Pause between two compaction cycles
    fn compaction_delay(&self) -> Duration;
}

/// Size and age based strategy
#[derive(Debug, Clone)]
pub struct SimpleMergeStrategy {
    small_table_threshold: u64,
    untouched_threshold: Duration,
    delay: Duration,
    max_tables_per_job: usize,
}

impl SimpleMergeStrategy {
    pub fn new(
        small_table_threshold: u64,
        untouched_threshold: Duration,
        delay: Duration,
        max_tables_per_job: usize,
    ) -> Self {
        Self {
            small_table_threshold,
            untouched_threshold,
            delay,
            max_tables_per_job,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.small_table_threshold(),
            config.sstable_untouched_threshold(),
            config.compaction_delay(),
            config.max_merge_tables_per_job,
        )
    }

    fn is_untouched(&self, run: &SortedRun, now: SystemTime) -> bool {
        now.duration_since(run.last_modified())
            .map(|age| age > self.untouched_threshold)
            .unwrap_or(false)
    }
}

impl MergeStrategy for SimpleMergeStrategy {
    fn merge_task(&self, runs: &[Arc<SortedRun>]) -> MergeTask {
        if runs.len() < 2 {
            return MergeTask::none();
        }

        let now = SystemTime::now();
        let major_candidate = runs
            .iter()
            .any(|r| r.tuple_count() >= self.small_table_threshold && self.is_untouched(r, now));

        if major_candidate {
            return MergeTask {
                task_type: MergeTaskType::Major,
                runs: runs.to_vec(),
            };
        }

        let small: Vec<Arc<SortedRun>> = runs
            .iter()
            .filter(|r| r.tuple_count() < self.small_table_threshold)
            .take(self.max_tables_per_job)
            .cloned()
            .collect();

        if small.len() < 2 {
            return MergeTask::none();
        }

        let task_type = if small.len() == runs.len() {
            MergeTaskType::Major
        } else {
            MergeTaskType::Minor
        };
        MergeTask { task_type, runs: small }
    }

    fn compaction_delay(&self) -> Duration {
        self.delay
    }
}

/// Counters of one compaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub read_tuples: u64,
    pub written_tuples: u64,
    pub purged_tombstones: u64,
    pub output_runs: usize,
}

/// Merges a fixed set of acquired runs of one store
pub struct SSTableCompactor<'a> {
    manager: &'a TupleStoreManager,
    inputs: &'a AcquiredRuns,
    major: bool,
    max_sstable_size: u64,
    stats: CompactionStats,
}

impl<'a> SSTableCompactor<'a> {
    pub fn new(
        manager: &'a TupleStoreManager,
        inputs: &'a AcquiredRuns,
        major: bool,
        max_sstable_size: u64,
    ) -> Self {
        Self {
            manager,
            inputs,
            major,
            max_sstable_size,
            stats: CompactionStats::default(),
        }
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// Merge the inputs into new committed runs
    pub fn execute_compactation(&mut self) -> Result<Vec<Arc<SortedRun>>> {
        let mut finished: Vec<(RunFiles, u64)> = Vec::new();
        let mut writer: Option<(SSTableWriter, u64)> = None;

        if let Err(e) = self.merge_into(&mut finished, &mut writer) {
            if let Some((mut w, _)) = writer.take() {
                w.abort();
            }
            Self::discard(&finished);
            return Err(e);
        }

        let mut outputs = Vec::with_capacity(finished.len());
        for (index, (files, table_number)) in finished.iter().enumerate() {
            match self.manager.open_run(files.clone(), *table_number) {
                Ok(run) => outputs.push(run),
                Err(e) => {
                    // open_run already removed the failed one
                    for run in &outputs {
                        run.delete_on_close();
                    }
                    Self::discard(&finished[index + 1..]);
                    return Err(e);
                }
            }
        }

        self.stats.output_runs = outputs.len();
        Ok(outputs)
    }

    fn merge_into(
        &mut self,
        finished: &mut Vec<(RunFiles, u64)>,
        writer: &mut Option<(SSTableWriter, u64)>,
    ) -> Result<()> {
        let sources: Vec<TupleSource> = self
            .inputs
            .runs()
            .iter()
            .map(|run| Box::new(run.iter()) as TupleSource)
            .collect();
        let merger = MergingIterator::new(sources)?;

        let resolver = self.manager.duplicate_resolver();
        let purge_tombstones = self.major && !self.manager.configuration().allow_duplicates;

        for group in merger {
            let mut group = group?;
            self.stats.read_tuples += group.len() as u64;
            resolver.resolve(&mut group);

            // roll over only between keys so one key never spans two runs
            let full = writer
                .as_ref()
                .map(|(w, _)| w.written_bytes() >= self.max_sstable_size)
                .unwrap_or(false);
            if full {
                if let Some((w, number)) = writer.take() {
                    Self::finish_writer(w, number, finished)?;
                }
            }

            for tuple in &group {
                if tuple.is_deleted() && purge_tombstones {
                    self.stats.purged_tombstones += 1;
                    continue;
                }

                if writer.is_none() {
                    let number = self.manager.allocate_table_number();
                    *writer = Some((SSTableWriter::new(self.manager.run_files(number))?, number));
                }
                if let Some((w, _)) = writer.as_mut() {
                    w.add(tuple)?;
                }
                self.stats.written_tuples += 1;
            }
        }

        if let Some((w, number)) = writer.take() {
            Self::finish_writer(w, number, finished)?;
        }
        Ok(())
    }

    /// `finish` removes its own files on failure
    fn finish_writer(writer: SSTableWriter, number: u64, finished: &mut Vec<(RunFiles, u64)>) -> Result<()> {
        let (files, _) = writer.finish()?;
        finished.push((files, number));
        Ok(())
    }

    fn discard(finished: &[(RunFiles, u64)]) {
        for (files, _) in finished {
            if let Err(e) = files.delete() {
                tracing::error!(file = %files.data.display(), error = %e, "failed to remove compaction output");
            }
        }
    }
}

/// Run `task` against `manager`; returns `None` when the inputs vanished
pub fn execute_merge_task(
    manager: &TupleStoreManager,
    task: &MergeTask,
    max_sstable_size: u64,
) -> Result<Option<CompactionStats>> {
    if task.task_type == MergeTaskType::None || task.runs.is_empty() {
        return Ok(None);
    }

    let Some(inputs) = AcquiredRuns::try_acquire(&task.runs) else {
        tracing::debug!(store = %manager.name(), "compaction inputs replaced concurrently, skipping");
        return Ok(None);
    };

    tracing::info!(
        store = %manager.name(),
        task = ?task.task_type,
        runs = task.runs.len(),
        "starting compaction"
    );

    let mut compactor = SSTableCompactor::new(manager, &inputs, task.is_major(), max_sstable_size);
    let outputs = compactor.execute_compactation()?;
    let stats = compactor.stats().clone();

    if let Err(e) = manager.replace_compacted_sstables(outputs.clone(), &task.runs) {
        for run in &outputs {
            run.delete_on_close();
        }
        return Err(e);
    }
    drop(inputs);

    tracing::info!(
        store = %manager.name(),
        read = stats.read_tuples,
        written = stats.written_tuples,
        purged = stats.purged_tombstones,
        outputs = stats.output_runs,
        "compaction finished"
    );
    Ok(Some(stats))
}

/// Flush the write buffer and merge every run into a single consistent set
pub fn force_major_compaction(manager: &TupleStoreManager, max_sstable_size: u64) -> Result<()> {
    manager.flush()?;

    let runs = manager.sstables();
    if runs.len() < 2 {
        return Ok(());
    }

    let task = MergeTask {
        task_type: MergeTaskType::Major,
        runs: runs.as_ref().clone(),
    };
    execute_merge_task(manager, &task, max_sstable_size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TupleStoreConfiguration;
    use crate::types::{Hyperrectangle, Tuple, TupleStoreName};
    use proptest::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn open(dir: &Path, configuration: TupleStoreConfiguration) -> Arc<TupleStoreManager> {
        let name = TupleStoreName::new("grp", "tbl").unwrap();
        TupleStoreManager::open(dir, name, configuration, &StoreConfig::for_testing(dir)).unwrap()
    }

    fn t(key: &str, version: i64, value: &str) -> Tuple {
        Tuple::with_version(key, Hyperrectangle::full_space(), value.as_bytes().to_vec(), version)
    }

    fn install(manager: &TupleStoreManager, runs: &[Vec<Tuple>]) -> Vec<Arc<SortedRun>> {
        let runs: Vec<Arc<SortedRun>> = runs.iter().map(|r| manager.write_run(r).unwrap()).collect();
        manager.replace_compacted_sstables(runs.clone(), &[]).unwrap();
        runs
    }

    fn scan(run: &SortedRun) -> Vec<(String, i64, Vec<u8>)> {
        run.iter()
            .map(|t| {
                let t = t.unwrap();
                (t.key().to_string(), t.version(), t.value().to_vec())
            })
            .collect()
    }

    fn strategy(threshold: u64, untouched: Duration) -> SimpleMergeStrategy {
        SimpleMergeStrategy::new(threshold, untouched, Duration::from_secs(1), 10)
    }

    #[test]
    fn test_minor_keep_all_merge_order() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::with_duplicates());
        let runs = install(
            &manager,
            &[vec![t("k1", 1, "a"), t("k2", 1, "x")], vec![t("k1", 2, "b")]],
        );

        let task = MergeTask {
            task_type: MergeTaskType::Minor,
            runs,
        };
        execute_merge_task(&manager, &task, u64::MAX).unwrap().unwrap();

        let visible = manager.sstables();
        assert_eq!(visible.len(), 1);
        assert_eq!(
            scan(&visible[0]),
            vec![
                ("k1".to_string(), 2, b"b".to_vec()),
                ("k1".to_string(), 1, b"a".to_vec()),
                ("k2".to_string(), 1, b"x".to_vec()),
            ]
        );
    }

    #[test]
    fn test_major_without_duplicates_purges_tombstones() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        let runs = install(
            &manager,
            &[vec![t("a", 1, "v"), t("b", 1, "v")], vec![Tuple::tombstone("a", 2)]],
        );

        let task = MergeTask {
            task_type: MergeTaskType::Major,
            runs,
        };
        let stats = execute_merge_task(&manager, &task, u64::MAX).unwrap().unwrap();
        assert_eq!(stats.purged_tombstones, 1);

        assert!(manager.get("a").unwrap().is_empty());
        assert_eq!(manager.get("b").unwrap().len(), 1);
        for run in manager.sstables().iter() {
            assert!(run.iter().all(|t| !t.unwrap().is_deleted()));
        }
    }

    #[test]
    fn test_minor_keeps_tombstones() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        let runs = install(&manager, &[vec![t("a", 1, "v")], vec![Tuple::tombstone("a", 2)]]);

        let task = MergeTask {
            task_type: MergeTaskType::Minor,
            runs,
        };
        execute_merge_task(&manager, &task, u64::MAX).unwrap();

        let versions = manager.get("a").unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_deleted());
    }

    #[test]
    fn test_major_with_duplicates_keeps_tombstones() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::with_duplicates());
        let runs = install(&manager, &[vec![t("a", 1, "v")], vec![Tuple::tombstone("a", 2)]]);

        let task = MergeTask {
            task_type: MergeTaskType::Major,
            runs,
        };
        execute_merge_task(&manager, &task, u64::MAX).unwrap();

        let versions = manager.get("a").unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_deleted());
    }

    #[test]
    fn test_output_rollover_at_key_boundary() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::with_duplicates());
        let first: Vec<Tuple> = (0..20).map(|i| t(&format!("key{:02}", i), 1, "value")).collect();
        let second: Vec<Tuple> = (0..20).map(|i| t(&format!("key{:02}", i), 2, "value")).collect();
        let runs = install(&manager, &[first, second]);

        let task = MergeTask {
            task_type: MergeTaskType::Minor,
            runs,
        };
        execute_merge_task(&manager, &task, 200).unwrap();

        let visible = manager.sstables();
        assert!(visible.len() > 1);
        let total: u64 = visible.iter().map(|r| r.tuple_count()).sum();
        assert_eq!(total, 40);
        for run in visible.iter() {
            // both versions of a key stay in the same run
            assert_eq!(run.tuple_count() % 2, 0);
        }
    }

    #[test]
    fn test_compaction_matches_union_of_inputs() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::with_duplicates());
        let runs = install(
            &manager,
            &[
                vec![t("a", 3, "a3"), t("c", 1, "c1")],
                vec![t("a", 1, "a1"), t("b", 2, "b2")],
                vec![t("b", 5, "b5"), t("c", 1, "c1")],
            ],
        );
        let keys = ["a", "b", "c"];
        let before: Vec<Vec<Tuple>> = keys.iter().map(|k| manager.get(k).unwrap()).collect();

        let task = SimpleMergeStrategy::from_config(&StoreConfig::for_testing(dir.path())).merge_task(&runs);
        assert_eq!(task.task_type, MergeTaskType::Major);
        execute_merge_task(&manager, &task, u64::MAX).unwrap();

        let after: Vec<Vec<Tuple>> = keys.iter().map(|k| manager.get(k).unwrap()).collect();
        assert_eq!(before, after);
        assert_eq!(manager.sstables().len(), 1);
    }

    #[test]
    fn test_failed_compaction_removes_outputs() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::with_duplicates());
        let runs = install(&manager, &[vec![t("a", 1, "v")], vec![t("b", 1, "v")]]);

        // block the file name the compactor will pick
        let blocked = manager.run_files(2);
        std::fs::write(&blocked.data, b"x").unwrap();

        let task = MergeTask {
            task_type: MergeTaskType::Minor,
            runs: runs.clone(),
        };
        assert!(execute_merge_task(&manager, &task, u64::MAX).is_err());
        assert_eq!(manager.sstables().len(), 2);
        assert!(runs.iter().all(|r| r.files().data.exists() && !r.is_delete_pending()));
        assert!(!manager.run_files(2).meta.exists());
    }

    #[test]
    fn test_strategy_none_for_single_run() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        let runs = install(&manager, &[vec![t("a", 1, "v")]]);
        assert_eq!(strategy(10, Duration::ZERO).merge_task(&runs).task_type, MergeTaskType::None);
    }

    #[test]
    fn test_strategy_major_for_old_large_run() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        let large: Vec<Tuple> = (0..5).map(|i| t(&format!("k{}", i), 1, "v")).collect();
        let runs = install(&manager, &[large.clone(), large, vec![t("z", 1, "v")]]);

        // threshold 5: two large runs, one small run
        std::thread::sleep(Duration::from_millis(20));
        let task = strategy(5, Duration::ZERO).merge_task(&runs);
        assert_eq!(task.task_type, MergeTaskType::Major);
        assert_eq!(task.runs.len(), 3);

        // recently written large runs are left alone
        let fresh = strategy(5, Duration::from_secs(3600)).merge_task(&runs);
        assert_eq!(fresh.task_type, MergeTaskType::None);
    }

    #[test]
    fn test_strategy_minor_for_subset() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        let large: Vec<Tuple> = (0..5).map(|i| t(&format!("k{}", i), 1, "v")).collect();
        let runs = install(&manager, &[large, vec![t("x", 1, "v")], vec![t("y", 1, "v")]]);

        let task = strategy(5, Duration::from_secs(3600)).merge_task(&runs);
        assert_eq!(task.task_type, MergeTaskType::Minor);
        assert_eq!(task.runs.len(), 2);
    }

    #[test]
    fn test_strategy_limits_tables_per_job() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        let inputs: Vec<Vec<Tuple>> = (0..12).map(|i| vec![t(&format!("k{}", i), 1, "v")]).collect();
        let runs = install(&manager, &inputs);

        let task = strategy(5, Duration::from_secs(3600)).merge_task(&runs);
        assert_eq!(task.task_type, MergeTaskType::Minor);
        assert_eq!(task.runs.len(), 10);
    }

    #[test]
    fn test_force_major_compaction() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path(), TupleStoreConfiguration::default());
        install(&manager, &[vec![t("a", 1, "v")], vec![t("b", 1, "v")]]);
        manager.put(t("c", 1, "v")).unwrap();

        force_major_compaction(&manager, u64::MAX).unwrap();
        assert_eq!(manager.sstables().len(), 1);
        assert_eq!(manager.sstables()[0].tuple_count(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_compaction_output_is_sorted(
            inputs in prop::collection::vec(
                prop::collection::vec(("[a-e]{1,3}", 0i64..50), 1..20),
                2..4,
            )
        ) {
            let dir = TempDir::new().unwrap();
            let manager = open(dir.path(), TupleStoreConfiguration::with_duplicates());

            let runs: Vec<Vec<Tuple>> = inputs
                .into_iter()
                .map(|entries| {
                    let mut tuples: Vec<Tuple> = entries.iter().map(|(k, v)| t(k, *v, "p")).collect();
                    tuples.sort_by(|a, b| a.storage_order(b));
                    tuples.dedup_by(|a, b| a.key() == b.key() && a.version() == b.version());
                    tuples
                })
                .collect();
            let runs = install(&manager, &runs);

            let task = MergeTask { task_type: MergeTaskType::Minor, runs };
            execute_merge_task(&manager, &task, 256).unwrap();

            for run in manager.sstables().iter() {
                let scanned: Vec<Tuple> = run.iter().map(|t| t.unwrap()).collect();
                for pair in scanned.windows(2) {
                    prop_assert!(pair[0].key() <= pair[1].key());
                    if pair[0].key() == pair[1].key() {
                        prop_assert!(pair[0].version() > pair[1].version());
                    }
                }
            }
        }
    }
}
