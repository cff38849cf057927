//! Region split and merge
//!
//! ## Split
//! 1. switch the region's stores to read only and force a major compaction
//! 2. pick the split position (median of sampled tuple midpoints along the
//!    split dimension of the region's level)
//! 3. create the children, place their replicas and activate them
//! 4. mark the region `Splitting` and copy every tuple to each child whose
//!    box it intersects
//! 5. mark the region `Split` and drop its local stores
//!
//! ## Merge
//! The mirror image: sibling leaves are frozen, compacted and copied into
//! their parent, which becomes an active leaf again.
//!
//! A failure rolls the partitioner back and reopens the frozen stores, so
//! the next compaction cycle can try again.

use super::group_config::DistributionGroupConfig;
use super::partitioner::SpacePartitioner;
use super::region::{DistributionRegion, NodeId, RegionId};
use crate::config::TupleStoreConfiguration;
use crate::storage::lsm::{force_major_compaction, TupleStoreManager};
use crate::storage::TupleStoreManagerRegistry;
use crate::types::{Tuple, TupleStoreName};
use crate::{Result, StorageError};
use std::sync::{Arc, Weak};

/// Tuples sampled to find a split position
const SPLIT_SAMPLE_SIZE: usize = 1_000;

pub struct RegionSplitHelper;

impl RegionSplitHelper {
    /// Bytes stored locally for `region` over all tables of `group`
    pub fn region_size(registry: &TupleStoreManagerRegistry, group: &str, region: RegionId) -> u64 {
        registry
            .stores_for_region(group, region)
            .iter()
            .map(|m| m.size())
            .sum()
    }

    pub fn is_overflowed(size: u64, config: &DistributionGroupConfig) -> bool {
        size > config.maximum_region_size
    }

    pub fn is_underflowed(size: u64, config: &DistributionGroupConfig) -> bool {
        size < config.minimum_region_size
    }

    /// Median of the tuple box midpoints along `dimension`, or the middle of
    /// the region when no tuple gives a usable position
    pub fn split_position(
        region: &DistributionRegion,
        dimension: usize,
        stores: &[Arc<TupleStoreManager>],
    ) -> Result<f64> {
        let interval = region.bbox.interval(dimension).cloned().ok_or_else(|| {
            StorageError::InvalidArgument(format!("region {} has no dimension {}", region.id, dimension))
        })?;
        let usable = |position: f64| position.is_finite() && interval.contains_point(position) && position != interval.end;

        let mut samples = Vec::new();
        for store in stores {
            store.for_each_tuple(|tuple| {
                if samples.len() < SPLIT_SAMPLE_SIZE && !tuple.is_deleted() {
                    if let Some(i) = tuple.bounding_box().interval(dimension) {
                        samples.push(i.midpoint());
                    }
                }
                Ok(())
            })?;
        }

        samples.retain(|p| usable(*p));
        samples.sort_by(|a, b| a.total_cmp(b));

        if !samples.is_empty() {
            return Ok(samples[(samples.len() - 1) / 2]);
        }

        let middle = interval.midpoint();
        if usable(middle) {
            Ok(middle)
        } else {
            Err(StorageError::InvalidArgument(format!(
                "no split position inside {} of region {}",
                interval, region.id
            )))
        }
    }
}

/// Delivers redistributed tuples to the stores of a region
pub trait TupleSink: Send + Sync {
    fn sink_tuple(&self, store: &TupleStoreName, configuration: &TupleStoreConfiguration, tuple: &Tuple) -> Result<()>;
}

/// Writes into stores of the local registry
pub struct LocalTupleSink {
    registry: Weak<TupleStoreManagerRegistry>,
}

impl LocalTupleSink {
    pub fn new(registry: &Arc<TupleStoreManagerRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

impl TupleSink for LocalTupleSink {
    fn sink_tuple(&self, store: &TupleStoreName, configuration: &TupleStoreConfiguration, tuple: &Tuple) -> Result<()> {
        let registry = self.registry.upgrade().ok_or(StorageError::Shutdown)?;
        registry
            .get_or_create_store(store, configuration.clone())?
            .put(tuple.clone())
    }
}

/// Copies the tuples of one table to every destination region they intersect
pub struct TupleRedistributor {
    table: TupleStoreName,
    configuration: TupleStoreConfiguration,
    destinations: Vec<DistributionRegion>,
    sink: Arc<dyn TupleSink>,
    counts: Vec<u64>,
}

impl TupleRedistributor {
    pub fn new(
        table: &TupleStoreName,
        configuration: TupleStoreConfiguration,
        destinations: Vec<DistributionRegion>,
        sink: Arc<dyn TupleSink>,
    ) -> Self {
        let counts = vec![0; destinations.len()];
        Self {
            table: table.without_region(),
            configuration,
            destinations,
            sink,
            counts,
        }
    }

    pub fn redistribute(&mut self, tuple: &Tuple) -> Result<()> {
        let mut delivered = false;
        for (index, region) in self.destinations.iter().enumerate() {
            if !region.bbox.intersects(tuple.bounding_box()) {
                continue;
            }
            self.sink
                .sink_tuple(&self.table.with_region(region.id), &self.configuration, tuple)?;
            self.counts[index] += 1;
            delivered = true;
        }

        if !delivered {
            return Err(StorageError::IllegalState(format!(
                "tuple {} of {} intersects no destination region",
                tuple.key(),
                self.table
            )));
        }
        Ok(())
    }

    /// Tuples delivered per destination region
    pub fn statistics(&self) -> Vec<(RegionId, u64)> {
        self.destinations
            .iter()
            .map(|r| r.id)
            .zip(self.counts.iter().copied())
            .collect()
    }
}

/// Freeze the stores and compact them into one consistent run set
fn freeze_stores(stores: &[Arc<TupleStoreManager>], max_sstable_size: u64) -> Result<()> {
    for store in stores {
        store.set_read_only();
    }
    for store in stores {
        force_major_compaction(store, max_sstable_size)?;
    }
    Ok(())
}

fn redistribute_stores(
    stores: &[Arc<TupleStoreManager>],
    destinations: &[DistributionRegion],
    sink: &Arc<dyn TupleSink>,
) -> Result<()> {
    for store in stores {
        let mut redistributor = TupleRedistributor::new(
            store.name(),
            store.configuration().clone(),
            destinations.to_vec(),
            sink.clone(),
        );
        store.for_each_tuple(|tuple| redistributor.redistribute(tuple))?;
        tracing::info!(store = %store.name(), delivered = ?redistributor.statistics(), "store redistributed");
    }
    Ok(())
}

fn drop_stores(registry: &TupleStoreManagerRegistry, group: &str, region: RegionId) {
    for store in registry.stores_for_region(group, region) {
        if let Err(e) = registry.delete_store(store.name()) {
            tracing::error!(store = %store.name(), error = %e, "failed to delete region store");
        }
    }
}

fn reopen_stores(registry: &TupleStoreManagerRegistry, stores: &[Arc<TupleStoreManager>]) {
    for store in stores {
        if let Err(e) = registry.reopen_store(store.name()) {
            tracing::error!(store = %store.name(), error = %e, "failed to reopen region store");
        }
    }
}

/// Splits an oversized region into two children
pub struct RegionSplitter {
    registry: Arc<TupleStoreManagerRegistry>,
    partitioner: Arc<dyn SpacePartitioner>,
    config: DistributionGroupConfig,
    instances: Vec<NodeId>,
    sink: Arc<dyn TupleSink>,
}

impl RegionSplitter {
    pub fn new(
        registry: Arc<TupleStoreManagerRegistry>,
        partitioner: Arc<dyn SpacePartitioner>,
        config: DistributionGroupConfig,
        instances: Vec<NodeId>,
        sink: Arc<dyn TupleSink>,
    ) -> Self {
        Self {
            registry,
            partitioner,
            config,
            instances,
            sink,
        }
    }

    pub fn split_region(&self, region_id: RegionId) -> Result<Vec<DistributionRegion>> {
        let group = self.partitioner.group().to_string();
        let region = self.partitioner.region(region_id)?;
        if !region.is_leaf() || !region.state.is_active() {
            return Err(StorageError::IllegalState(format!(
                "region {} in state {} cannot be split",
                region_id, region.state
            )));
        }

        let stores = self.registry.stores_for_region(&group, region_id);
        tracing::info!(group = %group, region = region_id, stores = stores.len(), "splitting region");

        let prepared = freeze_stores(&stores, self.registry.config().max_sstable_size).and_then(|_| {
            let dimension = region.level as usize % self.partitioner.dimensions();
            RegionSplitHelper::split_position(&region, dimension, &stores)
        });
        let position = match prepared {
            Ok(position) => position,
            Err(e) => {
                reopen_stores(&self.registry, &stores);
                return Err(e);
            }
        };

        let children = match self.partitioner.split_node(region_id, position) {
            Ok(children) => children,
            Err(e) => {
                reopen_stores(&self.registry, &stores);
                return Err(e);
            }
        };

        match self.distribute(&region, &children, &stores) {
            Ok(children) => {
                for store in &stores {
                    if let Err(e) = self.registry.delete_store(store.name()) {
                        tracing::error!(store = %store.name(), error = %e, "failed to delete split store");
                    }
                }
                tracing::info!(group = %group, region = region_id, position, "region split complete");
                Ok(children)
            }
            Err(e) => {
                tracing::error!(group = %group, region = region_id, error = %e, "region split failed, rolling back");
                for child in &children {
                    drop_stores(&self.registry, &group, child.id);
                }
                if let Err(e) = self.partitioner.split_failed(region_id) {
                    tracing::error!(group = %group, region = region_id, error = %e, "split rollback failed");
                }
                reopen_stores(&self.registry, &stores);
                Err(e)
            }
        }
    }

    fn distribute(
        &self,
        region: &DistributionRegion,
        children: &[DistributionRegion],
        stores: &[Arc<TupleStoreManager>],
    ) -> Result<Vec<DistributionRegion>> {
        let placement = self.config.placement.strategy();
        for child in children {
            let systems = placement.choose_systems(&self.instances, self.config.replication_factor)?;
            self.partitioner.set_systems(child.id, systems)?;
            self.partitioner
                .set_state(child.id, super::region::RegionState::Active)?;
        }

        self.partitioner
            .set_state(region.id, super::region::RegionState::Splitting)?;

        let destinations: Vec<DistributionRegion> = children
            .iter()
            .map(|c| self.partitioner.region(c.id))
            .collect::<Result<_>>()?;
        redistribute_stores(stores, &destinations, &self.sink)?;

        self.partitioner.split_complete(region.id)?;
        Ok(destinations)
    }
}

/// Folds sibling leaves back into their parent
pub struct RegionMerger {
    registry: Arc<TupleStoreManagerRegistry>,
    partitioner: Arc<dyn SpacePartitioner>,
    config: DistributionGroupConfig,
    instances: Vec<NodeId>,
    sink: Arc<dyn TupleSink>,
}

impl RegionMerger {
    pub fn new(
        registry: Arc<TupleStoreManagerRegistry>,
        partitioner: Arc<dyn SpacePartitioner>,
        config: DistributionGroupConfig,
        instances: Vec<NodeId>,
        sink: Arc<dyn TupleSink>,
    ) -> Self {
        Self {
            registry,
            partitioner,
            config,
            instances,
            sink,
        }
    }

    pub fn merge_region(&self, parent_id: RegionId) -> Result<()> {
        let group = self.partitioner.group().to_string();
        let children = self.partitioner.children(parent_id)?;
        let stores: Vec<Arc<TupleStoreManager>> = children
            .iter()
            .flat_map(|c| self.registry.stores_for_region(&group, c.id))
            .collect();

        tracing::info!(group = %group, region = parent_id, children = children.len(), "merging regions");
        self.partitioner.prepare_merge(parent_id)?;

        match self.merge_into_parent(parent_id, &stores) {
            Ok(()) => {
                for store in &stores {
                    if let Err(e) = self.registry.delete_store(store.name()) {
                        tracing::error!(store = %store.name(), error = %e, "failed to delete merged store");
                    }
                }
                tracing::info!(group = %group, region = parent_id, "region merge complete");
                Ok(())
            }
            Err(e) => {
                tracing::error!(group = %group, region = parent_id, error = %e, "region merge failed, rolling back");
                drop_stores(&self.registry, &group, parent_id);
                if let Err(e) = self.partitioner.merge_failed(parent_id) {
                    tracing::error!(group = %group, region = parent_id, error = %e, "merge rollback failed");
                }
                reopen_stores(&self.registry, &stores);
                Err(e)
            }
        }
    }

    fn merge_into_parent(&self, parent_id: RegionId, stores: &[Arc<TupleStoreManager>]) -> Result<()> {
        let systems = self
            .config
            .placement
            .strategy()
            .choose_systems(&self.instances, self.config.replication_factor)?;
        self.partitioner.set_systems(parent_id, systems)?;

        freeze_stores(stores, self.registry.config().max_sstable_size)?;

        let parent = self.partitioner.region(parent_id)?;
        redistribute_stores(stores, &[parent], &self.sink)?;

        self.partitioner.merge_complete(parent_id)
    }
}
