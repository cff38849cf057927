//! Spatial distribution of tables
//!
//! A distribution group splits the space of its tables into regions. Each
//! region is stored by the nodes of its replica set; oversized regions are
//! split along the k-d tree, undersized siblings are merged back.

pub mod coordinator;
pub mod group_config;
pub mod partitioner;
pub mod placement;
pub mod region;
pub mod split;

pub use coordinator::DistributionRegionCoordinator;
pub use group_config::{
    CoordinationService, DistributionGroupConfig, DistributionGroupConfigCache, InMemoryCoordinator,
    SpacePartitionerCache,
};
pub use partitioner::{KdTreeSpacePartitioner, PartitionerListener, RegionEvent, SpacePartitioner};
pub use placement::{PlacementKind, PlacementStrategy, RandomPlacement, RoundRobinPlacement};
pub use region::{DistributionRegion, NodeId, RegionId, RegionState};
pub use split::{LocalTupleSink, RegionMerger, RegionSplitHelper, RegionSplitter, TupleRedistributor, TupleSink};
