//! Pipeline registry: the arena of pipeline records
//!
//! Every mutation of pipeline state goes through `try_transition`, a
//! compare-and-set on the current state. Racing transition requests
//! converge: exactly one caller observes `Applied` and runs its side
//! effects; everyone else sees `AlreadyInState` or a CAS conflict.

use crate::common::timestamp_now_millis;
use crate::pipeline::{NodeId, Pipeline, PipelineId, PipelineState};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Persistence seam for pipeline records. Terminal transitions are
/// written through so the lifecycle survives restarts; health events
/// themselves are never persisted.
pub trait PipelineStore: Send + Sync {
    fn persist(&self, pipeline: &Pipeline) -> Result<()>;
    fn remove(&self, id: PipelineId) -> Result<()>;
    fn load_all(&self) -> Result<Vec<Pipeline>>;
}

/// Outcome of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// This caller won the CAS; side effects belong to it
    Applied,
    /// The pipeline was already in the requested state; no-op
    AlreadyInState,
}

#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
    store: Option<Arc<dyn PipelineStore>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Registry backed by a persistent store; previously persisted
    /// records are loaded back into the arena.
    pub fn with_store(store: Arc<dyn PipelineStore>) -> Result<Self> {
        let mut map = HashMap::new();
        for p in store.load_all()? {
            map.insert(p.id, p);
        }
        Ok(Self {
            pipelines: RwLock::new(map),
            store: Some(store),
        })
    }

    pub fn insert(&self, pipeline: Pipeline) -> Result<()> {
        if let Some(store) = &self.store {
            store.persist(&pipeline)?;
        }
        self.pipelines
            .write()
            .unwrap()
            .insert(pipeline.id, pipeline);
        Ok(())
    }

    pub fn get(&self, id: PipelineId) -> Option<Pipeline> {
        self.pipelines.read().unwrap().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Pipeline> {
        self.pipelines.read().unwrap().values().cloned().collect()
    }

    /// Pipelines a given node is a member of
    pub fn pipelines_of(&self, node: &str) -> Vec<Pipeline> {
        self.pipelines
            .read()
            .unwrap()
            .values()
            .filter(|p| p.contains(node))
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.pipelines
            .read()
            .unwrap()
            .values()
            .filter(|p| p.state == PipelineState::Open)
            .count()
    }

    /// Compare-and-set transition. At most one of any set of racing
    /// requests for the same edge observes `Applied`.
    ///
    /// Terminal states are persisted through the store before the caller
    /// sees `Applied`.
    pub fn try_transition(
        &self,
        id: PipelineId,
        from: PipelineState,
        to: PipelineState,
    ) -> Result<Transition> {
        let mut map = self.pipelines.write().unwrap();
        let pipeline = map
            .get_mut(&id)
            .ok_or_else(|| crate::Error::PipelineNotFound(id.to_string()))?;

        if pipeline.state == to {
            return Ok(Transition::AlreadyInState);
        }
        if pipeline.state != from {
            return Err(crate::Error::InvalidTransition {
                from: pipeline.state.to_string(),
                to: to.to_string(),
            });
        }
        if !from.can_transition_to(to) {
            return Err(crate::Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        pipeline.state = to;
        pipeline.last_health_at_ms = timestamp_now_millis();
        pipeline.last_activity_ms = pipeline.last_health_at_ms;

        if to.is_terminal() {
            if let Some(store) = &self.store {
                store.persist(pipeline)?;
            }
        }

        tracing::info!(pipeline = %id, %from, %to, "pipeline transition");
        Ok(Transition::Applied)
    }

    /// Record read/report traffic; feeds the destroy timer.
    pub fn touch(&self, id: PipelineId) {
        if let Some(p) = self.pipelines.write().unwrap().get_mut(&id) {
            p.last_activity_ms = timestamp_now_millis();
        }
    }

    /// Record a degraded-but-serving condition.
    pub fn mark_degraded(&self, id: PipelineId) {
        if let Some(p) = self.pipelines.write().unwrap().get_mut(&id) {
            p.degraded = true;
            p.last_health_at_ms = timestamp_now_millis();
        }
    }

    /// Leadership is observed from the replication primitive, not decided
    /// here.
    pub fn observe_leader(&self, id: PipelineId, leader: &NodeId) {
        if let Some(p) = self.pipelines.write().unwrap().get_mut(&id) {
            if &p.leader != leader {
                tracing::info!(pipeline = %id, old = %p.leader, new = %leader, "leader moved");
                p.leader = leader.clone();
            }
        }
    }

    /// Drop a DESTROYED record after its grace period. "Not found" is the
    /// documented terminal answer from then on.
    pub fn remove(&self, id: PipelineId) -> Result<()> {
        if let Some(store) = &self.store {
            store.remove(id)?;
        }
        self.pipelines.write().unwrap().remove(&id);
        Ok(())
    }
}
