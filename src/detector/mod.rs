//! Failure detector
//!
//! Timer-driven, off the read/write hot path. Tracks per-node report
//! staleness, per-follower replication lag, and watch timeouts reported
//! by the write path, and turns them into health events for the
//! lifecycle manager. The detector holds no lifecycle authority: it only
//! emits; the manager decides.

use crate::common::{timestamp_now_millis, DetectorConfig, METRICS};
use crate::container::ContainerId;
use crate::pipeline::{NodeId, PipelineId, PipelineRegistry};
use crate::rlog::LogGroup;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What went wrong, as observed by one node or the detector itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEventKind {
    /// No report from a member within the stale-node interval
    StaleNode,
    /// A follower's applied index trails the leader beyond the
    /// follower-slowness timeout
    FollowerSlow,
    /// A quorum watch did not resolve within the watcher timeout
    WatchTimeout,
    /// A local read of committed data failed
    ReadFailure { container: ContainerId },
    /// A committed entry could not be applied locally
    ApplyFailure { container: ContainerId },
}

/// Ephemeral health notification. Never persisted; only the lifecycle
/// transitions derived from it are.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub source: NodeId,
    pub pipeline: PipelineId,
    pub kind: HealthEventKind,
    /// Leader identity as provided by the replication primitive at the
    /// moment the event was produced. Never a cached value.
    pub observed_leader: Option<NodeId>,
    pub at_ms: u64,
}

impl HealthEvent {
    pub fn new(
        source: NodeId,
        pipeline: PipelineId,
        kind: HealthEventKind,
        observed_leader: Option<NodeId>,
    ) -> Self {
        Self {
            source,
            pipeline,
            kind,
            observed_leader,
            at_ms: timestamp_now_millis(),
        }
    }

    /// Was this produced by the node the primitive considered leader?
    pub fn from_leader(&self) -> bool {
        self.observed_leader.as_ref() == Some(&self.source)
    }
}

pub type HealthSender = mpsc::UnboundedSender<HealthEvent>;
pub type HealthReceiver = mpsc::UnboundedReceiver<HealthEvent>;

/// Channel between event producers (detector, state machines, write
/// path) and the lifecycle manager.
pub fn health_channel() -> (HealthSender, HealthReceiver) {
    mpsc::unbounded_channel()
}

/// Emit an event, counting it. Send failures mean the manager is gone;
/// nothing useful is left to do with the event then.
pub fn emit(sender: &HealthSender, event: HealthEvent) {
    METRICS.health_events_total.inc();
    tracing::debug!(
        source = %event.source,
        pipeline = %event.pipeline,
        kind = ?event.kind,
        "health event"
    );
    let _ = sender.send(event);
}

pub struct FailureDetector {
    cfg: DetectorConfig,
    registry: Arc<PipelineRegistry>,
    events: HealthSender,
    last_seen: Mutex<HashMap<NodeId, u64>>,
    /// Nodes already reported stale this episode; cleared on next report
    stale_reported: Mutex<HashSet<NodeId>>,
    groups: Mutex<Vec<Arc<LogGroup>>>,
    /// (pipeline, follower) -> since-when it has nonzero lag
    lag_since: Mutex<HashMap<(PipelineId, NodeId), u64>>,
}

impl FailureDetector {
    pub fn new(cfg: DetectorConfig, registry: Arc<PipelineRegistry>, events: HealthSender) -> Self {
        Self {
            cfg,
            registry,
            events,
            last_seen: Mutex::new(HashMap::new()),
            stale_reported: Mutex::new(HashSet::new()),
            groups: Mutex::new(Vec::new()),
            lag_since: Mutex::new(HashMap::new()),
        }
    }

    /// Clone of the event channel for other producers (state machines,
    /// write path) — everything lands in the same lifecycle queue.
    pub fn sender(&self) -> HealthSender {
        self.events.clone()
    }

    /// Record that a report arrived from `node`.
    pub fn observe_report(&self, node: &str) {
        self.last_seen
            .lock()
            .unwrap()
            .insert(node.to_string(), timestamp_now_millis());
        self.stale_reported.lock().unwrap().remove(node);
    }

    /// Track a log group for follower-lag detection.
    pub fn register_group(&self, group: Arc<LogGroup>) {
        self.groups.lock().unwrap().push(group);
    }

    /// Called by the write path when a quorum watch times out.
    pub fn watch_timed_out(&self, source: &str, pipeline: PipelineId, observed_leader: NodeId) {
        emit(
            &self.events,
            HealthEvent::new(
                source.to_string(),
                pipeline,
                HealthEventKind::WatchTimeout,
                Some(observed_leader),
            ),
        );
    }

    /// One detection sweep. Separated from the timer loop for tests.
    pub fn check_once(&self, now_ms: u64) {
        self.check_stale_nodes(now_ms);
        self.check_follower_lag(now_ms);
    }

    fn check_stale_nodes(&self, now_ms: u64) {
        let stale_after = self.cfg.stale_node_interval().as_millis() as u64;
        let last_seen = self.last_seen.lock().unwrap().clone();
        let mut reported = self.stale_reported.lock().unwrap();

        for (node, seen) in last_seen {
            if now_ms.saturating_sub(seen) < stale_after || reported.contains(&node) {
                continue;
            }
            reported.insert(node.clone());
            tracing::warn!(%node, since_ms = now_ms - seen, "node stale");

            for pipeline in self.registry.pipelines_of(&node) {
                if pipeline.state.is_terminal() {
                    continue;
                }
                emit(
                    &self.events,
                    HealthEvent::new(
                        node.clone(),
                        pipeline.id,
                        HealthEventKind::StaleNode,
                        Some(pipeline.leader.clone()),
                    ),
                );
            }
        }
    }

    fn check_follower_lag(&self, now_ms: u64) {
        let slow_after = self.cfg.follower_slowness_timeout().as_millis() as u64;
        let groups = self.groups.lock().unwrap().clone();
        let mut lag_since = self.lag_since.lock().unwrap();

        for group in groups {
            let leader = group.leader();
            for member in group.members() {
                if member == leader {
                    continue;
                }
                let key = (group.pipeline(), member.clone());
                if group.lag(&member) == 0 {
                    lag_since.remove(&key);
                    continue;
                }
                let since = *lag_since.entry(key.clone()).or_insert(now_ms);
                if now_ms.saturating_sub(since) >= slow_after {
                    // Restart the clock so a persistently slow follower is
                    // reported once per timeout window, not every sweep
                    lag_since.insert(key, now_ms);
                    emit(
                        &self.events,
                        HealthEvent::new(
                            member.clone(),
                            group.pipeline(),
                            HealthEventKind::FollowerSlow,
                            Some(leader.clone()),
                        ),
                    );
                }
            }
        }
    }

    /// Run the periodic sweep until the handle is dropped.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.cfg.check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_once(timestamp_now_millis());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    fn detector_with_pipeline() -> (Arc<FailureDetector>, HealthReceiver, PipelineId) {
        let registry = Arc::new(PipelineRegistry::new());
        let pipeline = Pipeline::new(
            vec!["n1".into(), "n2".into(), "n3".into()],
            "n1".into(),
        );
        let id = pipeline.id;
        registry.insert(pipeline).unwrap();

        let (tx, rx) = health_channel();
        let cfg = DetectorConfig {
            stale_node_interval_ms: 1_000,
            watch_timeout_ms: 500,
            follower_slowness_timeout_ms: 2_000,
            check_interval_ms: 100,
        };
        (
            Arc::new(FailureDetector::new(cfg, registry, tx)),
            rx,
            id,
        )
    }

    #[test]
    fn test_stale_node_emitted_once_per_episode() {
        let (detector, mut rx, id) = detector_with_pipeline();
        let t0 = timestamp_now_millis();

        detector.observe_report("n2");
        detector.check_once(t0);
        assert!(rx.try_recv().is_err());

        // Past the stale interval: exactly one event per pipeline
        detector.check_once(t0 + 5_000);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, HealthEventKind::StaleNode);
        assert_eq!(ev.source, "n2");
        assert_eq!(ev.pipeline, id);

        // No repeat while still stale
        detector.check_once(t0 + 10_000);
        assert!(rx.try_recv().is_err());

        // Recovery then staleness again re-arms the episode
        detector.observe_report("n2");
        detector.check_once(timestamp_now_millis() + 5_000);
        assert_eq!(rx.try_recv().unwrap().kind, HealthEventKind::StaleNode);
    }

    #[test]
    fn test_healthy_node_stays_quiet() {
        let (detector, mut rx, _id) = detector_with_pipeline();
        detector.observe_report("n2");
        detector.check_once(timestamp_now_millis() + 100);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_watch_timeout_event() {
        let (detector, mut rx, id) = detector_with_pipeline();
        detector.watch_timed_out("client-path", id, "n1".into());
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, HealthEventKind::WatchTimeout);
        assert_eq!(ev.observed_leader.as_deref(), Some("n1"));
    }
}
