//! Distribution group configuration and the metadata caches
//!
//! The coordination service is the source of truth for group settings and
//! region trees. Lookups go through explicit caches owned by the node; any
//! create or delete of a group must invalidate them.

use super::partitioner::{KdTreeSpacePartitioner, SpacePartitioner};
use super::placement::PlacementKind;
use super::region::NodeId;
use crate::{Result, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionGroupConfig {
    pub dimensions: usize,
    pub replication_factor: usize,

    /// Bytes per region before it is split
    pub maximum_region_size: u64,

    /// Bytes of all siblings below which they are merged
    pub minimum_region_size: u64,

    pub placement: PlacementKind,
}

impl Default for DistributionGroupConfig {
    fn default() -> Self {
        Self {
            dimensions: 2,
            replication_factor: 1,
            maximum_region_size: 1024 * 1024 * 1024,
            minimum_region_size: 16 * 1024 * 1024,
            placement: PlacementKind::RoundRobin,
        }
    }
}

impl DistributionGroupConfig {
    pub fn new(dimensions: usize, replication_factor: usize) -> Self {
        Self {
            dimensions,
            replication_factor,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 || self.replication_factor == 0 {
            return Err(StorageError::InvalidArgument(
                "dimensions and replication factor must be positive".into(),
            ));
        }
        if self.minimum_region_size >= self.maximum_region_size {
            return Err(StorageError::InvalidArgument(
                "minimum region size must be below the maximum region size".into(),
            ));
        }
        Ok(())
    }
}

/// Read side of the coordination service
pub trait CoordinationService: Send + Sync {
    fn group_config(&self, group: &str) -> Result<DistributionGroupConfig>;

    fn partitioner(&self, group: &str) -> Result<Arc<dyn SpacePartitioner>>;

    /// Storage nodes that are currently online
    fn live_instances(&self) -> Vec<NodeId>;
}

struct GroupEntry {
    config: DistributionGroupConfig,
    partitioner: Arc<KdTreeSpacePartitioner>,
}

/// Coordination service kept in process memory
#[derive(Default)]
pub struct InMemoryCoordinator {
    groups: RwLock<HashMap<String, GroupEntry>>,
    instances: RwLock<Vec<NodeId>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_instance(&self, node: NodeId) {
        let mut instances = self.instances.write();
        if !instances.contains(&node) {
            instances.push(node);
        }
    }

    pub fn unregister_instance(&self, node: &NodeId) {
        self.instances.write().retain(|n| n != node);
    }

    /// Create a group whose root region is placed on live instances
    pub fn create_group(&self, group: &str, config: DistributionGroupConfig) -> Result<()> {
        config.validate()?;
        if group.is_empty() || group.contains('_') {
            return Err(StorageError::InvalidArgument(format!("invalid group name '{}'", group)));
        }

        let mut groups = self.groups.write();
        if groups.contains_key(group) {
            return Err(StorageError::TableExists(group.to_string()));
        }

        let systems = config
            .placement
            .strategy()
            .choose_systems(&self.live_instances(), config.replication_factor)?;
        let partitioner = Arc::new(KdTreeSpacePartitioner::new(group, config.dimensions, systems)?);

        tracing::info!(group, dimensions = config.dimensions, "created distribution group");
        groups.insert(group.to_string(), GroupEntry { config, partitioner });
        Ok(())
    }

    pub fn delete_group(&self, group: &str) -> Result<()> {
        self.groups
            .write()
            .remove(group)
            .map(|_| tracing::info!(group, "deleted distribution group"))
            .ok_or_else(|| StorageError::TableNotFound(group.to_string()))
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl CoordinationService for InMemoryCoordinator {
    fn group_config(&self, group: &str) -> Result<DistributionGroupConfig> {
        self.groups
            .read()
            .get(group)
            .map(|e| e.config.clone())
            .ok_or_else(|| StorageError::TableNotFound(group.to_string()))
    }

    fn partitioner(&self, group: &str) -> Result<Arc<dyn SpacePartitioner>> {
        self.groups
            .read()
            .get(group)
            .map(|e| e.partitioner.clone() as Arc<dyn SpacePartitioner>)
            .ok_or_else(|| StorageError::TableNotFound(group.to_string()))
    }

    fn live_instances(&self) -> Vec<NodeId> {
        self.instances.read().clone()
    }
}

/// Cached group configurations
pub struct DistributionGroupConfigCache {
    source: Arc<dyn CoordinationService>,
    entries: RwLock<HashMap<String, DistributionGroupConfig>>,
}

impl DistributionGroupConfigCache {
    pub fn new(source: Arc<dyn CoordinationService>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, group: &str) -> Result<DistributionGroupConfig> {
        if let Some(config) = self.entries.read().get(group) {
            return Ok(config.clone());
        }
        let config = self.source.group_config(group)?;
        self.entries.write().insert(group.to_string(), config.clone());
        Ok(config)
    }

    pub fn invalidate(&self, group: &str) {
        self.entries.write().remove(group);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cached partitioner handles
pub struct SpacePartitionerCache {
    source: Arc<dyn CoordinationService>,
    entries: RwLock<HashMap<String, Arc<dyn SpacePartitioner>>>,
}

impl SpacePartitionerCache {
    pub fn new(source: Arc<dyn CoordinationService>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, group: &str) -> Result<Arc<dyn SpacePartitioner>> {
        if let Some(partitioner) = self.entries.read().get(group) {
            return Ok(partitioner.clone());
        }
        let partitioner = self.source.partitioner(group)?;
        self.entries.write().insert(group.to_string(), partitioner.clone());
        Ok(partitioner)
    }

    pub fn invalidate(&self, group: &str) {
        self.entries.write().remove(group);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<InMemoryCoordinator> {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.register_instance(NodeId::new("node1"));
        coordinator.register_instance(NodeId::new("node2"));
        coordinator
    }

    #[test]
    fn test_create_group_places_root() {
        let coordinator = coordinator();
        coordinator.create_group("grp", DistributionGroupConfig::new(2, 2)).unwrap();

        let root = coordinator.partitioner("grp").unwrap().root_node().unwrap();
        assert_eq!(root.systems.len(), 2);
        assert!(coordinator.create_group("grp", DistributionGroupConfig::new(2, 1)).is_err());
        assert!(coordinator.create_group("other", DistributionGroupConfig::new(2, 3)).is_err());
    }

    #[test]
    fn test_config_cache_invalidate() {
        let coordinator = coordinator();
        coordinator.create_group("grp", DistributionGroupConfig::new(2, 1)).unwrap();
        let cache = DistributionGroupConfigCache::new(coordinator.clone());

        assert_eq!(cache.get("grp").unwrap().dimensions, 2);
        coordinator.delete_group("grp").unwrap();
        coordinator.create_group("grp", DistributionGroupConfig::new(3, 1)).unwrap();

        // stale until invalidated
        assert_eq!(cache.get("grp").unwrap().dimensions, 2);
        cache.invalidate("grp");
        assert_eq!(cache.get("grp").unwrap().dimensions, 3);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("missing").is_err());
    }

    #[test]
    fn test_partitioner_cache() {
        let coordinator = coordinator();
        coordinator.create_group("grp", DistributionGroupConfig::new(1, 1)).unwrap();
        let cache = SpacePartitionerCache::new(coordinator.clone());

        let first = cache.get("grp").unwrap();
        let second = cache.get("grp").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.clear();
        coordinator.delete_group("grp").unwrap();
        assert!(cache.get("grp").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(DistributionGroupConfig::new(0, 1).validate().is_err());
        let mut config = DistributionGroupConfig::new(2, 1);
        config.minimum_region_size = config.maximum_region_size;
        assert!(config.validate().is_err());
    }
}
