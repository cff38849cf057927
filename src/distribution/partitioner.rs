//! Space partitioner: the region tree of one distribution group
//!
//! `KdTreeSpacePartitioner` keeps the tree in memory. Each split halves a
//! leaf along dimension `level % dimensions`; the left child keeps the
//! split position. Every state change goes through
//! `RegionState::can_transition_to`, so a concurrent change surfaces as an
//! error instead of a lost update.

use super::region::{DistributionRegion, NodeId, RegionId, RegionState};
use crate::types::{DoubleInterval, Hyperrectangle};
use crate::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum RegionEvent {
    StateChanged {
        region: RegionId,
        from: RegionState,
        to: RegionState,
    },
    SystemsChanged(RegionId),
    ChildrenCreated {
        parent: RegionId,
        children: Vec<RegionId>,
    },
    ChildrenRemoved {
        parent: RegionId,
        children: Vec<RegionId>,
    },
}

/// Notified after every change of the tree
pub trait PartitionerListener: Send + Sync {
    fn on_region_event(&self, group: &str, event: &RegionEvent);
}

pub trait SpacePartitioner: Send + Sync {
    fn group(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn root_node(&self) -> Result<DistributionRegion>;

    fn region(&self, id: RegionId) -> Result<DistributionRegion>;

    fn children(&self, id: RegionId) -> Result<Vec<DistributionRegion>>;

    /// Leaf regions whose box intersects `bbox`
    fn regions_for_box(&self, bbox: &Hyperrectangle) -> Result<Vec<DistributionRegion>>;

    fn set_state(&self, id: RegionId, state: RegionState) -> Result<()>;

    fn set_systems(&self, id: RegionId, systems: Vec<NodeId>) -> Result<()>;

    /// Create two children in state `Creating` that partition the region
    fn split_node(&self, id: RegionId, position: f64) -> Result<Vec<DistributionRegion>>;

    /// The children took over; the region becomes `Split`
    fn split_complete(&self, id: RegionId) -> Result<()>;

    /// Drop the children again and reactivate the region
    fn split_failed(&self, id: RegionId) -> Result<()>;

    /// Groups of sibling leaves that could be merged into their parent
    fn merge_candidates(&self, id: RegionId) -> Result<Vec<Vec<DistributionRegion>>>;

    fn prepare_merge(&self, parent: RegionId) -> Result<()>;

    fn merge_complete(&self, parent: RegionId) -> Result<()>;

    fn merge_failed(&self, parent: RegionId) -> Result<()>;

    fn register_listener(&self, listener: Arc<dyn PartitionerListener>);
}

struct RegionTree {
    regions: BTreeMap<RegionId, DistributionRegion>,
    next_id: RegionId,
}

impl RegionTree {
    fn get(&self, id: RegionId) -> Result<&DistributionRegion> {
        self.regions
            .get(&id)
            .ok_or_else(|| StorageError::Partitioner(format!("unknown region {}", id)))
    }

    fn get_mut(&mut self, id: RegionId) -> Result<&mut DistributionRegion> {
        self.regions
            .get_mut(&id)
            .ok_or_else(|| StorageError::Partitioner(format!("unknown region {}", id)))
    }

    fn transition(&mut self, id: RegionId, to: RegionState, events: &mut Vec<RegionEvent>) -> Result<()> {
        let region = self.get_mut(id)?;
        let from = region.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(StorageError::Partitioner(format!(
                "region {} cannot change from {} to {}",
                id, from, to
            )));
        }
        region.state = to;
        events.push(RegionEvent::StateChanged { region: id, from, to });
        Ok(())
    }

    fn remove_children(&mut self, parent: RegionId, events: &mut Vec<RegionEvent>) -> Result<()> {
        let children = std::mem::take(&mut self.get_mut(parent)?.children);
        for child in &children {
            self.regions.remove(child);
        }
        if !children.is_empty() {
            events.push(RegionEvent::ChildrenRemoved { parent, children });
        }
        Ok(())
    }
}

pub struct KdTreeSpacePartitioner {
    group: String,
    dimensions: usize,
    tree: RwLock<RegionTree>,
    listeners: RwLock<Vec<Arc<dyn PartitionerListener>>>,
}

impl KdTreeSpacePartitioner {
    /// Tree with a single active root covering the whole space
    pub fn new(group: impl Into<String>, dimensions: usize, root_systems: Vec<NodeId>) -> Result<Self> {
        if dimensions == 0 {
            return Err(StorageError::InvalidArgument("a distribution group needs at least one dimension".into()));
        }

        let root = DistributionRegion {
            id: 0,
            parent: None,
            children: Vec::new(),
            level: 0,
            bbox: Hyperrectangle::new(vec![DoubleInterval::closed(f64::MIN, f64::MAX)?; dimensions]),
            state: RegionState::Active,
            systems: root_systems,
        };

        let mut regions = BTreeMap::new();
        regions.insert(0, root);

        Ok(Self {
            group: group.into(),
            dimensions,
            tree: RwLock::new(RegionTree { regions, next_id: 1 }),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Split dimension of a region at `level`
    pub fn split_dimension(&self, level: u32) -> usize {
        level as usize % self.dimensions
    }

    pub fn region_count(&self) -> usize {
        self.tree.read().regions.len()
    }

    fn notify(&self, events: Vec<RegionEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for event in &events {
            tracing::debug!(group = %self.group, event = ?event, "region tree changed");
            for listener in &listeners {
                listener.on_region_event(&self.group, event);
            }
        }
    }

    fn modify<T>(&self, f: impl FnOnce(&mut RegionTree, &mut Vec<RegionEvent>) -> Result<T>) -> Result<T> {
        let mut events = Vec::new();
        let result = {
            let mut tree = self.tree.write();
            f(&mut tree, &mut events)
        };
        // events of a failed change are dropped with it
        if result.is_ok() {
            self.notify(events);
        }
        result
    }
}

impl SpacePartitioner for KdTreeSpacePartitioner {
    fn group(&self) -> &str {
        &self.group
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn root_node(&self) -> Result<DistributionRegion> {
        self.region(0)
    }

    fn region(&self, id: RegionId) -> Result<DistributionRegion> {
        self.tree.read().get(id).cloned()
    }

    fn children(&self, id: RegionId) -> Result<Vec<DistributionRegion>> {
        let tree = self.tree.read();
        tree.get(id)?
            .children
            .iter()
            .map(|child| tree.get(*child).cloned())
            .collect()
    }

    fn regions_for_box(&self, bbox: &Hyperrectangle) -> Result<Vec<DistributionRegion>> {
        let tree = self.tree.read();
        let mut result = Vec::new();
        let mut pending = vec![0];

        while let Some(id) = pending.pop() {
            let region = tree.get(id)?;
            if !region.bbox.intersects(bbox) {
                continue;
            }
            let children_serving = region
                .children
                .iter()
                .filter_map(|c| tree.regions.get(c))
                .any(|c| c.state != RegionState::Creating);

            if region.is_leaf() || !children_serving {
                result.push(region.clone());
            } else {
                pending.extend(region.children.iter().copied());
            }
        }

        result.sort_by_key(|r| r.id);
        Ok(result)
    }

    fn set_state(&self, id: RegionId, state: RegionState) -> Result<()> {
        self.modify(|tree, events| tree.transition(id, state, events))
    }

    fn set_systems(&self, id: RegionId, systems: Vec<NodeId>) -> Result<()> {
        self.modify(|tree, events| {
            tree.get_mut(id)?.systems = systems;
            events.push(RegionEvent::SystemsChanged(id));
            Ok(())
        })
    }

    fn split_node(&self, id: RegionId, position: f64) -> Result<Vec<DistributionRegion>> {
        let dimensions = self.dimensions;
        self.modify(|tree, events| {
            let region = tree.get(id)?.clone();
            if !region.is_leaf() || !region.state.is_active() {
                return Err(StorageError::Partitioner(format!(
                    "region {} in state {} cannot be split",
                    id, region.state
                )));
            }

            let dimension = region.level as usize % dimensions;
            let (left, right) = region.bbox.split(dimension, position)?;

            let mut children = Vec::with_capacity(2);
            for bbox in [left, right] {
                let child = DistributionRegion {
                    id: tree.next_id,
                    parent: Some(id),
                    children: Vec::new(),
                    level: region.level + 1,
                    bbox,
                    state: RegionState::Creating,
                    systems: Vec::new(),
                };
                tree.next_id += 1;
                tree.regions.insert(child.id, child.clone());
                children.push(child);
            }

            let ids: Vec<RegionId> = children.iter().map(|c| c.id).collect();
            tree.get_mut(id)?.children = ids.clone();
            events.push(RegionEvent::ChildrenCreated { parent: id, children: ids });
            Ok(children)
        })
    }

    fn split_complete(&self, id: RegionId) -> Result<()> {
        self.modify(|tree, events| tree.transition(id, RegionState::Split, events))
    }

    fn split_failed(&self, id: RegionId) -> Result<()> {
        self.modify(|tree, events| {
            tree.remove_children(id, events)?;
            if tree.get(id)?.state == RegionState::Splitting {
                tree.transition(id, RegionState::Active, events)?;
            }
            Ok(())
        })
    }

    fn merge_candidates(&self, id: RegionId) -> Result<Vec<Vec<DistributionRegion>>> {
        let tree = self.tree.read();
        let region = tree.get(id)?;
        let Some(parent_id) = region.parent else {
            return Ok(Vec::new());
        };

        let parent = tree.get(parent_id)?;
        if parent.state != RegionState::Split {
            return Ok(Vec::new());
        }

        let siblings: Vec<DistributionRegion> = parent
            .children
            .iter()
            .map(|c| tree.get(*c).cloned())
            .collect::<Result<_>>()?;

        if siblings.iter().all(|s| s.is_leaf() && s.state.is_active()) {
            Ok(vec![siblings])
        } else {
            Ok(Vec::new())
        }
    }

    fn prepare_merge(&self, parent: RegionId) -> Result<()> {
        self.modify(|tree, events| {
            let children = tree.get(parent)?.children.clone();
            if children.is_empty() {
                return Err(StorageError::Partitioner(format!("region {} has nothing to merge", parent)));
            }
            for child in &children {
                if !tree.get(*child)?.is_leaf() {
                    return Err(StorageError::Partitioner(format!("child {} of {} is not a leaf", child, parent)));
                }
            }

            tree.transition(parent, RegionState::Merging, events)?;
            for child in &children {
                tree.transition(*child, RegionState::Merging, events)?;
            }
            Ok(())
        })
    }

    fn merge_complete(&self, parent: RegionId) -> Result<()> {
        self.modify(|tree, events| {
            if tree.get(parent)?.state != RegionState::Merging {
                return Err(StorageError::Partitioner(format!("region {} is not merging", parent)));
            }
            tree.remove_children(parent, events)?;
            tree.transition(parent, RegionState::Active, events)
        })
    }

    fn merge_failed(&self, parent: RegionId) -> Result<()> {
        self.modify(|tree, events| {
            let children = tree.get(parent)?.children.clone();
            for child in &children {
                if tree.get(*child)?.state == RegionState::Merging {
                    tree.transition(*child, RegionState::Active, events)?;
                }
            }
            if tree.get(parent)?.state == RegionState::Merging {
                tree.transition(parent, RegionState::Split, events)?;
            }
            Ok(())
        })
    }

    fn register_listener(&self, listener: Arc<dyn PartitionerListener>) {
        self.listeners.write().push(listener);
    }
}
