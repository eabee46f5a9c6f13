//! Pipeline records and lifecycle states

use crate::common::timestamp_now_millis;
use crate::pipeline::{NodeId, PipelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline lifecycle state.
///
/// Forward-only: once CLOSED, a pipeline can only be DESTROYED. The
/// direct OPEN -> CLOSED edge is the fault path for unrecoverable group
/// failures (leader read failure, majority apply failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Accepts new containers and writes
    Open,
    /// No new writes; in-flight entries drain
    Closing,
    /// Terminal for traffic; eligible for destruction
    Closed,
    /// Record removed after a grace timeout
    Destroyed,
}

impl PipelineState {
    pub fn accepts_writes(&self) -> bool {
        matches!(self, PipelineState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Closed | PipelineState::Destroyed)
    }

    /// Is `to` a legal next state from here? Re-entering the current
    /// state is handled as a no-op by the registry, not here.
    pub fn can_transition_to(&self, to: PipelineState) -> bool {
        matches!(
            (self, to),
            (PipelineState::Open, PipelineState::Closing)
                | (PipelineState::Open, PipelineState::Closed)
                | (PipelineState::Closing, PipelineState::Closed)
                | (PipelineState::Closed, PipelineState::Destroyed)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Open => write!(f, "open"),
            PipelineState::Closing => write!(f, "closing"),
            PipelineState::Closed => write!(f, "closed"),
            PipelineState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A pipeline record: the single piece of shared mutable state between
/// the detector, the lifecycle manager and the write path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    /// Ordered members; length equals the replication factor for the
    /// pipeline's lifetime
    pub members: Vec<NodeId>,
    /// Leader as last observed from the replication primitive
    pub leader: NodeId,
    pub factor: usize,
    pub state: PipelineState,
    pub created_at: DateTime<Utc>,
    /// Last health event touching this pipeline (ms since epoch)
    pub last_health_at_ms: u64,
    /// Last read/report traffic (ms since epoch); drives destruction
    pub last_activity_ms: u64,
    /// A minority of members is unhealthy; service continues
    pub degraded: bool,
}

impl Pipeline {
    pub fn new(members: Vec<NodeId>, leader: NodeId) -> Self {
        let now = timestamp_now_millis();
        let factor = members.len();
        Self {
            id: PipelineId::random(),
            members,
            leader,
            factor,
            state: PipelineState::Open,
            created_at: Utc::now(),
            last_health_at_ms: now,
            last_activity_ms: now,
            degraded: false,
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.members.iter().any(|m| m == node)
    }

    pub fn is_leader(&self, node: &str) -> bool {
        self.leader == node
    }

    /// Majority size for this replication factor
    pub fn quorum(&self) -> usize {
        self.factor / 2 + 1
    }

    pub fn followers(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter().filter(move |m| **m != self.leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            vec!["n1".into(), "n2".into(), "n3".into()],
            "n1".into(),
        )
    }

    #[test]
    fn test_transition_edges() {
        use PipelineState::*;
        assert!(Open.can_transition_to(Closing));
        assert!(Open.can_transition_to(Closed));
        assert!(Closing.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Destroyed));

        // Terminal-forward monotonicity
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Destroyed.can_transition_to(Closed));
        assert!(!Closing.can_transition_to(Open));
        // CLOSING is never skipped backwards into
        assert!(!Closed.can_transition_to(Closing));
    }

    #[test]
    fn test_writes_only_when_open() {
        use PipelineState::*;
        assert!(Open.accepts_writes());
        assert!(!Closing.accepts_writes());
        assert!(!Closed.accepts_writes());
        assert!(!Destroyed.accepts_writes());
    }

    #[test]
    fn test_quorum() {
        let p = pipeline();
        assert_eq!(p.factor, 3);
        assert_eq!(p.quorum(), 2);
        assert!(p.is_leader("n1"));
        assert_eq!(p.followers().count(), 2);
    }
}
