//! Placement of region replicas on storage nodes

use super::region::NodeId;
use crate::{Result, StorageError};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Placement policy of a distribution group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementKind {
    #[default]
    RoundRobin,
    Random,
}

impl PlacementKind {
    pub fn strategy(self) -> Arc<dyn PlacementStrategy> {
        match self {
            PlacementKind::RoundRobin => Arc::new(RoundRobinPlacement::default()),
            PlacementKind::Random => Arc::new(RandomPlacement),
        }
    }
}

pub trait PlacementStrategy: Send + Sync {
    /// Pick `count` distinct nodes out of `candidates`
    fn choose_systems(&self, candidates: &[NodeId], count: usize) -> Result<Vec<NodeId>>;
}

fn check_candidates(candidates: &[NodeId], count: usize) -> Result<()> {
    if count == 0 || candidates.len() < count {
        return Err(StorageError::ResourceExhausted(format!(
            "need {} storage nodes, {} available",
            count,
            candidates.len()
        )));
    }
    Ok(())
}

/// Walks the sorted candidate list, continuing where the last call stopped
#[derive(Debug, Default)]
pub struct RoundRobinPlacement {
    next: AtomicUsize,
}

impl PlacementStrategy for RoundRobinPlacement {
    fn choose_systems(&self, candidates: &[NodeId], count: usize) -> Result<Vec<NodeId>> {
        check_candidates(candidates, count)?;

        let mut sorted = candidates.to_vec();
        sorted.sort();
        sorted.dedup();
        check_candidates(&sorted, count)?;

        let start = self.next.fetch_add(count, Ordering::Relaxed);
        Ok((0..count)
            .map(|i| sorted[(start + i) % sorted.len()].clone())
            .collect())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

impl PlacementStrategy for RandomPlacement {
    fn choose_systems(&self, candidates: &[NodeId], count: usize) -> Result<Vec<NodeId>> {
        let mut unique = candidates.to_vec();
        unique.sort();
        unique.dedup();
        check_candidates(&unique, count)?;

        let mut rng = rand::thread_rng();
        Ok(unique.choose_multiple(&mut rng, count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("node{}", i))).collect()
    }

    #[test]
    fn test_round_robin_rotates() {
        let placement = RoundRobinPlacement::default();
        let candidates = nodes(3);

        assert_eq!(placement.choose_systems(&candidates, 1).unwrap(), vec![candidates[0].clone()]);
        assert_eq!(placement.choose_systems(&candidates, 1).unwrap(), vec![candidates[1].clone()]);
        assert_eq!(
            placement.choose_systems(&candidates, 2).unwrap(),
            vec![candidates[2].clone(), candidates[0].clone()]
        );
    }

    #[test]
    fn test_random_picks_distinct_nodes() {
        let candidates = nodes(5);
        for _ in 0..20 {
            let chosen = RandomPlacement.choose_systems(&candidates, 3).unwrap();
            let unique: HashSet<_> = chosen.iter().collect();
            assert_eq!(unique.len(), 3);
            assert!(chosen.iter().all(|n| candidates.contains(n)));
        }
    }

    #[test]
    fn test_not_enough_nodes() {
        let candidates = nodes(1);
        assert!(matches!(
            RoundRobinPlacement::default().choose_systems(&candidates, 2),
            Err(StorageError::ResourceExhausted(_))
        ));
        assert!(RandomPlacement.choose_systems(&candidates, 2).is_err());
    }
}
