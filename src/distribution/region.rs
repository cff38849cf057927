//! Distribution regions and their lifecycle
//!
//! A distribution group partitions space into a tree of regions. Leaves own
//! data; an inner node is either `Split` (children serve it) or `Merging`
//! (children are folded back into it).

use crate::types::Hyperrectangle;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RegionId = u64;

/// Name of a storage node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionState {
    /// Children created by a split, not serving yet
    Creating,
    Active,
    /// Active, but already above the size limit
    ActiveFull,
    Splitting,
    /// Children took over all data
    Split,
    Merging,
    Deleting,
}

impl RegionState {
    /// Regions in this state accept reads, writes and maintenance
    pub fn is_active(self) -> bool {
        matches!(self, RegionState::Active | RegionState::ActiveFull)
    }

    pub fn can_transition_to(self, next: RegionState) -> bool {
        use RegionState::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Deleting)
                | (Active, ActiveFull)
                | (ActiveFull, Active)
                | (Active, Splitting)
                | (ActiveFull, Splitting)
                | (Splitting, Split)
                | (Splitting, Active)
                | (Split, Merging)
                | (Merging, Split)
                | (Merging, Active)
                | (Active, Merging)
                | (Merging, Deleting)
                | (Active, Deleting)
                | (Split, Deleting)
        )
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionState::Creating => "creating",
            RegionState::Active => "active",
            RegionState::ActiveFull => "active-full",
            RegionState::Splitting => "splitting",
            RegionState::Split => "split",
            RegionState::Merging => "merging",
            RegionState::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// Snapshot of one node of the region tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionRegion {
    pub id: RegionId,
    pub parent: Option<RegionId>,
    pub children: Vec<RegionId>,
    /// Depth in the tree, the root has level 0
    pub level: u32,
    pub bbox: Hyperrectangle,
    pub state: RegionState,
    /// Nodes holding a replica of this region
    pub systems: Vec<NodeId>,
}

impl DistributionRegion {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_responsible(&self, node: &NodeId) -> bool {
        self.systems.contains(node)
    }
}
