//! Pipeline member placement
//!
//! Boundary implementation of the placement service: pick replication-
//! factor many healthy nodes for a new pipeline, deterministically per
//! pipeline key via HRW hashing. Anything smarter (racks, load,
//! re-replication) lives outside this system.

use crate::common::select_members;
use crate::manager::store::NodeRecord;
use crate::pipeline::NodeId;
use crate::Result;

pub struct PlacementPolicy {
    factor: usize,
}

impl PlacementPolicy {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Select members for a new pipeline from the registered nodes.
    pub fn select(&self, key: &str, nodes: &[NodeRecord]) -> Result<Vec<NodeId>> {
        let healthy: Vec<NodeId> = nodes
            .iter()
            .filter(|n| n.state.is_healthy())
            .map(|n| n.node_id.clone())
            .collect();

        if healthy.len() < self.factor {
            return Err(crate::Error::InsufficientNodes {
                needed: self.factor,
                available: healthy.len(),
            });
        }

        let selected = select_members(key, &healthy, self.factor);
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{timestamp_now_millis, NodeState};

    fn node(id: &str, state: NodeState) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            address: format!("http://localhost:{}", id.len()),
            state,
            last_heartbeat_ms: timestamp_now_millis(),
        }
    }

    #[test]
    fn test_select_members() {
        let policy = PlacementPolicy::new(3);
        let nodes = vec![
            node("n1", NodeState::Healthy),
            node("n2", NodeState::Healthy),
            node("n3", NodeState::Healthy),
            node("n4", NodeState::Healthy),
        ];

        let selected = policy.select("pipeline-key", &nodes).unwrap();
        assert_eq!(selected.len(), 3);

        // Deterministic per key
        assert_eq!(selected, policy.select("pipeline-key", &nodes).unwrap());
    }

    #[test]
    fn test_stale_nodes_excluded() {
        let policy = PlacementPolicy::new(3);
        let nodes = vec![
            node("n1", NodeState::Healthy),
            node("n2", NodeState::Stale),
            node("n3", NodeState::Healthy),
            node("n4", NodeState::Healthy),
        ];

        let selected = policy.select("k", &nodes).unwrap();
        assert!(!selected.contains(&"n2".to_string()));
    }

    #[test]
    fn test_insufficient_nodes() {
        let policy = PlacementPolicy::new(3);
        let nodes = vec![
            node("n1", NodeState::Healthy),
            node("n2", NodeState::Dead),
        ];

        let err = policy.select("k", &nodes).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::InsufficientNodes {
                needed: 3,
                available: 1
            }
        ));
    }
}
