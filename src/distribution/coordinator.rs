//! Bridge between compaction and the region tree
//!
//! After each compaction of a distributed store the engine asks the
//! coordinator whether the store's region has to be split or merged. Only
//! the first system of a region's replica set performs the operation.

use super::group_config::{CoordinationService, DistributionGroupConfigCache, SpacePartitionerCache};
use super::region::{NodeId, RegionState};
use super::split::{LocalTupleSink, RegionMerger, RegionSplitHelper, RegionSplitter, TupleSink};
use crate::storage::lsm::{RegionCoordinator, TupleStoreManager};
use crate::storage::TupleStoreManagerRegistry;
use crate::types::TupleStoreName;
use crate::{Result, StorageError};
use std::sync::{Arc, Weak};

pub struct DistributionRegionCoordinator {
    local_node: NodeId,
    service: Arc<dyn CoordinationService>,
    registry: Weak<TupleStoreManagerRegistry>,
    configs: DistributionGroupConfigCache,
    partitioners: SpacePartitionerCache,
    sink: Arc<dyn TupleSink>,
}

impl DistributionRegionCoordinator {
    pub fn new(
        local_node: NodeId,
        service: Arc<dyn CoordinationService>,
        registry: &Arc<TupleStoreManagerRegistry>,
    ) -> Self {
        Self {
            local_node,
            configs: DistributionGroupConfigCache::new(service.clone()),
            partitioners: SpacePartitionerCache::new(service.clone()),
            service,
            registry: Arc::downgrade(registry),
            sink: Arc::new(LocalTupleSink::new(registry)),
        }
    }

    /// Create a coordinator and hook it into `registry`
    pub fn install(
        local_node: NodeId,
        service: Arc<dyn CoordinationService>,
        registry: &Arc<TupleStoreManagerRegistry>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self::new(local_node, service, registry));
        registry.set_region_coordinator(Some(coordinator.clone()));
        coordinator
    }

    /// Forget cached metadata of `group` after it was created or deleted
    pub fn invalidate_group(&self, group: &str) {
        self.configs.invalidate(group);
        self.partitioners.invalidate(group);
    }

    pub fn clear_caches(&self) {
        self.configs.clear();
        self.partitioners.clear();
    }

    fn registry(&self) -> Result<Arc<TupleStoreManagerRegistry>> {
        self.registry.upgrade().ok_or(StorageError::Shutdown)
    }

    pub fn splitter(&self, group: &str) -> Result<RegionSplitter> {
        Ok(RegionSplitter::new(
            self.registry()?,
            self.partitioners.get(group)?,
            self.configs.get(group)?,
            self.service.live_instances(),
            self.sink.clone(),
        ))
    }

    pub fn merger(&self, group: &str) -> Result<RegionMerger> {
        Ok(RegionMerger::new(
            self.registry()?,
            self.partitioners.get(group)?,
            self.configs.get(group)?,
            self.service.live_instances(),
            self.sink.clone(),
        ))
    }

    fn try_merge(&self, name: &TupleStoreName, registry: &TupleStoreManagerRegistry) -> Result<bool> {
        let group = name.group();
        let Some(region_id) = name.region_id() else {
            return Ok(false);
        };
        let partitioner = self.partitioners.get(group)?;
        let config = self.configs.get(group)?;

        for siblings in partitioner.merge_candidates(region_id)? {
            let total: u64 = siblings
                .iter()
                .map(|s| RegionSplitHelper::region_size(registry, group, s.id))
                .sum();
            if !RegionSplitHelper::is_underflowed(total, &config) {
                continue;
            }

            let Some(parent) = partitioner.region(region_id)?.parent else {
                continue;
            };
            tracing::info!(group, region = parent, bytes = total, "regions below minimum size, merging");
            self.merger(group)?.merge_region(parent)?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl RegionCoordinator for DistributionRegionCoordinator {
    fn is_region_active(&self, name: &TupleStoreName) -> bool {
        let Some(region_id) = name.region_id() else {
            return true;
        };
        self.partitioners
            .get(name.group())
            .and_then(|p| p.region(region_id))
            .map(|r| r.state.is_active())
            .unwrap_or(false)
    }

    fn check_split_and_merge(&self, manager: &Arc<TupleStoreManager>) -> Result<()> {
        let name = manager.name();
        let Some(region_id) = name.region_id() else {
            return Ok(());
        };
        if manager.is_read_only() {
            return Ok(());
        }

        let registry = self.registry()?;
        let group = name.group();
        let region = self.partitioners.get(group)?.region(region_id)?;

        if !region.is_leaf() || !region.state.is_active() {
            return Ok(());
        }
        if region.systems.first() != Some(&self.local_node) {
            return Ok(());
        }

        let config = self.configs.get(group)?;
        let size = RegionSplitHelper::region_size(&registry, group, region_id);

        if RegionSplitHelper::is_overflowed(size, &config) {
            tracing::info!(group, region = region_id, bytes = size, "region above maximum size, splitting");
            let partitioner = self.partitioners.get(group)?;
            if region.state == RegionState::Active {
                // Active -> ActiveFull is best effort, the split checks the state again
                if let Err(e) = partitioner.set_state(region_id, RegionState::ActiveFull) {
                    tracing::debug!(group, region = region_id, error = %e, "could not mark region full");
                }
            }
            self.splitter(group)?.split_region(region_id)?;
            return Ok(());
        }

        self.try_merge(name, &registry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, TupleStoreConfiguration};
    use crate::distribution::group_config::{DistributionGroupConfig, InMemoryCoordinator};
    use crate::types::{Hyperrectangle, Tuple};
    use tempfile::TempDir;

    fn setup(max_size: u64, min_size: u64) -> (TempDir, Arc<TupleStoreManagerRegistry>, Arc<InMemoryCoordinator>) {
        let dir = TempDir::new().unwrap();
        let registry = TupleStoreManagerRegistry::open(StoreConfig::for_testing(dir.path())).unwrap();
        let service = Arc::new(InMemoryCoordinator::new());
        service.register_instance(NodeId::new("local"));

        let mut config = DistributionGroupConfig::new(1, 1);
        config.maximum_region_size = max_size;
        config.minimum_region_size = min_size;
        service.create_group("grp", config).unwrap();
        (dir, registry, service)
    }

    fn fill(registry: &TupleStoreManagerRegistry, region: u64, n: usize) -> Arc<TupleStoreManager> {
        let name = TupleStoreName::new("grp", "tbl").unwrap().with_region(region);
        let store = registry
            .get_or_create_store(&name, TupleStoreConfiguration::default())
            .unwrap();
        for i in 0..n {
            let x = i as f64;
            store
                .put(Tuple::with_version(format!("k{:04}", i), Hyperrectangle::from_bounds(&[x, x]).unwrap(), vec![0u8; 64], 1))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_overflow_splits_region() {
        let (_dir, registry, service) = setup(1024, 1);
        let coordinator = DistributionRegionCoordinator::install(NodeId::new("local"), service.clone(), &registry);
        let store = fill(&registry, 0, 50);

        coordinator.check_split_and_merge(&store).unwrap();

        let root = service.partitioner("grp").unwrap().root_node().unwrap();
        assert_eq!(root.state, RegionState::Split);
        assert_eq!(root.children.len(), 2);
        assert!(!coordinator.is_region_active(store.name()));
        for child in &root.children {
            assert!(coordinator.is_region_active(&store.name().with_region(*child)));
        }
    }

    #[test]
    fn test_underflow_merges_siblings() {
        let (_dir, registry, service) = setup(1024, 512);
        let coordinator = DistributionRegionCoordinator::install(NodeId::new("local"), service.clone(), &registry);
        let store = fill(&registry, 0, 1);
        store
            .put(Tuple::with_version("far", Hyperrectangle::from_bounds(&[10.0, 10.0]).unwrap(), b"v".to_vec(), 1))
            .unwrap();

        let children = coordinator.splitter("grp").unwrap().split_region(0).unwrap();
        let left = registry.stores_for_region("grp", children[0].id)[0].clone();

        coordinator.check_split_and_merge(&left).unwrap();

        let root = service.partitioner("grp").unwrap().root_node().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.state, RegionState::Active);
        assert_eq!(registry.stores_for_region("grp", 0)[0].tuple_count(), 2);
        assert!(registry.stores_for_region("grp", children[1].id).is_empty());
    }

    #[test]
    fn test_other_node_does_not_split() {
        let (_dir, registry, service) = setup(1024, 1);
        let coordinator = DistributionRegionCoordinator::install(NodeId::new("remote"), service.clone(), &registry);
        let store = fill(&registry, 0, 50);

        coordinator.check_split_and_merge(&store).unwrap();
        assert!(service.partitioner("grp").unwrap().root_node().unwrap().is_leaf());
    }

    #[test]
    fn test_invalidate_group() {
        let (_dir, registry, service) = setup(1024, 1);
        let coordinator = DistributionRegionCoordinator::install(NodeId::new("local"), service.clone(), &registry);
        let name = TupleStoreName::new("grp", "tbl").unwrap().with_region(0);
        assert!(coordinator.is_region_active(&name));

        service.delete_group("grp").unwrap();
        assert!(coordinator.is_region_active(&name));
        coordinator.invalidate_group("grp");
        assert!(!coordinator.is_region_active(&name));

        assert!(coordinator.is_region_active(&TupleStoreName::new("grp", "local").unwrap()));
        coordinator.clear_caches();
    }
}
