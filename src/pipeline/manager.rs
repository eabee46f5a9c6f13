//! Pipeline lifecycle manager
//!
//! Consumes health events and drives pipelines through
//! OPEN -> CLOSING -> CLOSED -> DESTROYED. Policy:
//!
//! - leader READ_FAILURE, or APPLY_FAILURE on a majority of members:
//!   fault path, straight to CLOSED — committed data can no longer be
//!   trusted through this group, and repair belongs to placement once
//!   the pipeline is closed
//! - STALE_NODE (already interval-filtered by the detector): graceful
//!   CLOSING
//! - WATCH_TIMEOUT / FOLLOWER_SLOW, or READ_FAILURE on a follower:
//!   degraded, recorded, service continues
//!
//! All transitions go through the registry CAS, so racing signals
//! converge to one effective transition and side effects fire once.

use crate::common::{timestamp_now_millis, METRICS};
use crate::detector::{HealthEvent, HealthEventKind, HealthReceiver};
use crate::pipeline::{
    NodeId, Pipeline, PipelineId, PipelineRegistry, PipelineState, Transition,
};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Command for a member node, delivered piggybacked on report responses
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PipelineCommand {
    pub command_id: Uuid,
    pub pipeline: PipelineId,
    pub kind: PipelineCommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineCommandKind {
    /// Stop taking writes, quasi-close the pipeline's containers
    ClosePipeline,
}

pub struct PipelineManager {
    registry: Arc<PipelineRegistry>,
    destroy_timeout: Duration,
    /// Nodes that reported a fatal apply per pipeline; majority closes
    apply_failures: Mutex<HashMap<PipelineId, HashSet<NodeId>>>,
    /// Members whose pipeline report says closed locally; quorum drains
    drained: Mutex<HashMap<PipelineId, HashSet<NodeId>>>,
    /// Outstanding commands per node
    commands: Mutex<HashMap<NodeId, Vec<PipelineCommand>>>,
}

impl PipelineManager {
    pub fn new(registry: Arc<PipelineRegistry>, destroy_timeout: Duration) -> Self {
        Self {
            registry,
            destroy_timeout,
            apply_failures: Mutex::new(HashMap::new()),
            drained: Mutex::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    /// Drain outstanding commands for a node (attached to its report
    /// response).
    pub fn take_commands(&self, node: &str) -> Vec<PipelineCommand> {
        self.commands
            .lock()
            .unwrap()
            .remove(node)
            .unwrap_or_default()
    }

    fn enqueue_close_commands(&self, pipeline: &Pipeline) {
        let mut commands = self.commands.lock().unwrap();
        for member in &pipeline.members {
            commands
                .entry(member.clone())
                .or_default()
                .push(PipelineCommand {
                    command_id: Uuid::new_v4(),
                    pipeline: pipeline.id,
                    kind: PipelineCommandKind::ClosePipeline,
                });
        }
    }

    /// Apply one health event to the lifecycle.
    pub fn handle_event(&self, ev: HealthEvent) {
        let Some(pipeline) = self.registry.get(ev.pipeline) else {
            // Destroyed and removed; nothing left to manage
            tracing::debug!(pipeline = %ev.pipeline, "event for unknown pipeline dropped");
            return;
        };
        if pipeline.state == PipelineState::Destroyed {
            return;
        }

        match &ev.kind {
            HealthEventKind::ReadFailure { container } => {
                if ev.from_leader() {
                    tracing::warn!(
                        pipeline = %ev.pipeline,
                        container,
                        leader = %ev.source,
                        "read failure on leader; closing pipeline"
                    );
                    self.close_now(ev.pipeline);
                } else {
                    self.registry.mark_degraded(ev.pipeline);
                }
            }
            HealthEventKind::ApplyFailure { .. } => {
                let failed = {
                    let mut map = self.apply_failures.lock().unwrap();
                    let set = map.entry(ev.pipeline).or_default();
                    set.insert(ev.source.clone());
                    set.len()
                };
                if failed * 2 > pipeline.factor {
                    tracing::warn!(
                        pipeline = %ev.pipeline,
                        failed,
                        factor = pipeline.factor,
                        "apply failures reached a majority; closing pipeline"
                    );
                    self.close_now(ev.pipeline);
                } else {
                    self.registry.mark_degraded(ev.pipeline);
                }
            }
            HealthEventKind::StaleNode => {
                tracing::warn!(
                    pipeline = %ev.pipeline,
                    node = %ev.source,
                    "member stale; closing pipeline gracefully"
                );
                self.request_close(ev.pipeline);
            }
            HealthEventKind::WatchTimeout | HealthEventKind::FollowerSlow => {
                self.registry.mark_degraded(ev.pipeline);
            }
        }
    }

    /// Graceful close: OPEN -> CLOSING. Requesting it again, or on an
    /// already-closed pipeline, is a no-op.
    pub fn request_close(&self, id: PipelineId) {
        let Some(pipeline) = self.registry.get(id) else {
            return;
        };
        if pipeline.state != PipelineState::Open {
            return;
        }
        match self
            .registry
            .try_transition(id, PipelineState::Open, PipelineState::Closing)
        {
            Ok(Transition::Applied) => self.enqueue_close_commands(&pipeline),
            Ok(Transition::AlreadyInState) => {}
            Err(e) => {
                // Lost the race to a fault-path close; that close owns
                // the side effects
                tracing::debug!(pipeline = %id, "graceful close superseded: {}", e);
            }
        }
    }

    /// Fault path: close immediately from wherever the pipeline is.
    /// Exactly one racing caller runs the side effects.
    pub fn close_now(&self, id: PipelineId) {
        for _ in 0..2 {
            let Some(pipeline) = self.registry.get(id) else {
                return;
            };
            let from = match pipeline.state {
                PipelineState::Open | PipelineState::Closing => pipeline.state,
                PipelineState::Closed | PipelineState::Destroyed => return,
            };
            match self
                .registry
                .try_transition(id, from, PipelineState::Closed)
            {
                Ok(Transition::Applied) => {
                    METRICS.pipelines_closed_total.inc();
                    METRICS.open_pipelines.set(self.registry.open_count() as u64);
                    self.enqueue_close_commands(&pipeline);
                    return;
                }
                Ok(Transition::AlreadyInState) => return,
                // State moved under us; re-read and try once more
                Err(_) => continue,
            }
        }
    }

    /// A member reported its locally perceived pipeline state. Once a
    /// quorum of members has drained (reports closed), CLOSING completes.
    pub fn handle_pipeline_report(&self, node: &str, id: PipelineId, local: PipelineState) {
        self.registry.touch(id);

        if local != PipelineState::Closed {
            return;
        }
        let Some(pipeline) = self.registry.get(id) else {
            return;
        };

        let drained = {
            let mut map = self.drained.lock().unwrap();
            let set = map.entry(id).or_default();
            set.insert(node.to_string());
            set.len()
        };

        if pipeline.state == PipelineState::Closing && drained >= pipeline.quorum() {
            tracing::info!(pipeline = %id, drained, "drain complete");
            self.close_now(id);
        }
    }

    /// Periodic lifecycle sweep: finish stuck drains, destroy idle
    /// CLOSED pipelines, and drop DESTROYED records after grace.
    pub fn sweep(&self, now_ms: u64) {
        let timeout_ms = self.destroy_timeout.as_millis() as u64;

        for pipeline in self.registry.list() {
            match pipeline.state {
                PipelineState::Closing => {
                    // In-flight entries are considered abandoned after
                    // the same timeout that gates destruction
                    if now_ms.saturating_sub(pipeline.last_health_at_ms) > timeout_ms {
                        self.close_now(pipeline.id);
                    }
                }
                PipelineState::Closed => {
                    if now_ms.saturating_sub(pipeline.last_activity_ms) > timeout_ms {
                        if let Ok(Transition::Applied) = self.registry.try_transition(
                            pipeline.id,
                            PipelineState::Closed,
                            PipelineState::Destroyed,
                        ) {
                            METRICS.pipelines_destroyed_total.inc();
                            self.apply_failures.lock().unwrap().remove(&pipeline.id);
                            self.drained.lock().unwrap().remove(&pipeline.id);
                        }
                    }
                }
                PipelineState::Destroyed => {
                    if now_ms.saturating_sub(pipeline.last_activity_ms) > timeout_ms {
                        if let Err(e) = self.registry.remove(pipeline.id) {
                            tracing::warn!(pipeline = %pipeline.id, "record removal failed: {}", e);
                        }
                    }
                }
                PipelineState::Open => {}
            }
        }

        METRICS.open_pipelines.set(self.registry.open_count() as u64);
    }

    /// Run the event loop and the sweep until the handle is dropped.
    pub fn spawn(
        self: Arc<Self>,
        mut events: HealthReceiver,
        sweep_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    ev = events.recv() => {
                        match ev {
                            Some(ev) => self.handle_event(ev),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        self.sweep(timestamp_now_millis());
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("destroy_timeout", &self.destroy_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PipelineManager, PipelineId) {
        let registry = Arc::new(PipelineRegistry::new());
        let pipeline = Pipeline::new(
            vec!["n1".into(), "n2".into(), "n3".into()],
            "n1".into(),
        );
        let id = pipeline.id;
        registry.insert(pipeline).unwrap();
        (
            PipelineManager::new(registry, Duration::from_millis(500)),
            id,
        )
    }

    fn event(
        source: &str,
        pipeline: PipelineId,
        kind: HealthEventKind,
        leader: &str,
    ) -> HealthEvent {
        HealthEvent::new(source.into(), pipeline, kind, Some(leader.into()))
    }

    #[test]
    fn test_leader_read_failure_closes_immediately() {
        let (plm, id) = setup();

        plm.handle_event(event(
            "n1",
            id,
            HealthEventKind::ReadFailure { container: 1 },
            "n1",
        ));
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Closed);

        // Members got close commands
        assert_eq!(plm.take_commands("n2").len(), 1);
    }

    #[test]
    fn test_follower_read_failure_tolerated() {
        let (plm, id) = setup();

        plm.handle_event(event(
            "n2",
            id,
            HealthEventKind::ReadFailure { container: 1 },
            "n1",
        ));
        let p = plm.registry().get(id).unwrap();
        assert_eq!(p.state, PipelineState::Open);
        assert!(p.degraded);
    }

    #[test]
    fn test_majority_apply_failures_close() {
        let (plm, id) = setup();

        plm.handle_event(event(
            "n1",
            id,
            HealthEventKind::ApplyFailure { container: 1 },
            "n1",
        ));
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Open);

        // Same node again: still a minority of distinct members
        plm.handle_event(event(
            "n1",
            id,
            HealthEventKind::ApplyFailure { container: 1 },
            "n1",
        ));
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Open);

        plm.handle_event(event(
            "n3",
            id,
            HealthEventKind::ApplyFailure { container: 1 },
            "n1",
        ));
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Closed);
    }

    #[test]
    fn test_stale_node_closes_gracefully() {
        let (plm, id) = setup();

        plm.handle_event(event("n2", id, HealthEventKind::StaleNode, "n1"));
        assert_eq!(
            plm.registry().get(id).unwrap().state,
            PipelineState::Closing
        );

        // Repeat is idempotent
        plm.handle_event(event("n2", id, HealthEventKind::StaleNode, "n1"));
        assert_eq!(
            plm.registry().get(id).unwrap().state,
            PipelineState::Closing
        );
    }

    #[test]
    fn test_watch_timeout_only_degrades() {
        let (plm, id) = setup();

        plm.handle_event(event("n1", id, HealthEventKind::WatchTimeout, "n1"));
        let p = plm.registry().get(id).unwrap();
        assert_eq!(p.state, PipelineState::Open);
        assert!(p.degraded);
    }

    #[test]
    fn test_drain_completes_closing() {
        let (plm, id) = setup();
        plm.request_close(id);
        assert_eq!(
            plm.registry().get(id).unwrap().state,
            PipelineState::Closing
        );

        plm.handle_pipeline_report("n1", id, PipelineState::Closed);
        assert_eq!(
            plm.registry().get(id).unwrap().state,
            PipelineState::Closing
        );
        plm.handle_pipeline_report("n2", id, PipelineState::Closed);
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Closed);
    }

    #[test]
    fn test_sweep_destroys_then_removes() {
        let (plm, id) = setup();
        plm.close_now(id);

        let closed_at = plm.registry().get(id).unwrap().last_activity_ms;

        // Not yet past the destroy timeout
        plm.sweep(closed_at + 100);
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Closed);

        // Report traffic pushes destruction out
        plm.registry().touch(id);
        let touched_at = plm.registry().get(id).unwrap().last_activity_ms;

        plm.sweep(touched_at + 1_000);
        assert_eq!(
            plm.registry().get(id).unwrap().state,
            PipelineState::Destroyed
        );

        // After another grace period the record disappears entirely
        let destroyed_at = plm.registry().get(id).unwrap().last_activity_ms;
        plm.sweep(destroyed_at + 1_000);
        assert!(plm.registry().get(id).is_none());
    }

    #[test]
    fn test_closed_pipeline_ignores_further_faults() {
        let (plm, id) = setup();
        plm.close_now(id);
        plm.take_commands("n1");
        plm.take_commands("n2");
        plm.take_commands("n3");

        // A second fatal signal must not re-fire side effects
        plm.handle_event(event(
            "n1",
            id,
            HealthEventKind::ReadFailure { container: 1 },
            "n1",
        ));
        assert_eq!(plm.registry().get(id).unwrap().state, PipelineState::Closed);
        assert!(plm.take_commands("n1").is_empty());
    }
}
