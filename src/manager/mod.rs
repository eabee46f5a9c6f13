//! Cluster manager
//!
//! Owns the pipeline registry and its lifecycle manager, runs the
//! failure detector, ingests node reports, and hands out pipelines and
//! block allocations. Placement decisions beyond "pick healthy members"
//! are outside this system.

pub mod http;
pub mod placement;
pub mod server;
pub mod store;

use crate::common::{timestamp_now_millis, ManagerConfig, NodeState, METRICS};
use crate::container::{ContainerId, ContainerLocalState};
use crate::detector::{health_channel, FailureDetector, HealthReceiver};
use crate::node::reports::{
    CommandStatusReport, ContainerReport, PipelineReport, ReportSink,
};
use crate::pipeline::manager::PipelineCommand;
use crate::pipeline::{NodeId, Pipeline, PipelineId, PipelineManager, PipelineRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub use placement::PlacementPolicy;
pub use store::{ContainerRecord, MetaStore, NodeRecord};

/// Everything a client needs to start writing a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedBlock {
    pub pipeline: PipelineId,
    pub container: ContainerId,
    pub block: u64,
    pub leader: NodeId,
}

pub struct ClusterManager {
    config: ManagerConfig,
    store: Arc<MetaStore>,
    registry: Arc<PipelineRegistry>,
    plm: Arc<PipelineManager>,
    detector: Arc<FailureDetector>,
    placement: PlacementPolicy,
}

impl ClusterManager {
    /// Build the manager stack. The returned receiver feeds the
    /// lifecycle manager's event loop (`spawn_background`).
    pub fn new(config: ManagerConfig) -> Result<(Arc<Self>, HealthReceiver)> {
        let store = Arc::new(MetaStore::open(&config.db_path)?);
        let registry = Arc::new(PipelineRegistry::with_store(store.clone())?);
        let (events, receiver) = health_channel();

        let plm = Arc::new(PipelineManager::new(
            registry.clone(),
            config.pipeline_destroy_timeout(),
        ));
        let detector = Arc::new(FailureDetector::new(
            config.detector.clone(),
            registry.clone(),
            events,
        ));
        let placement = PlacementPolicy::new(config.replication_factor);

        Ok((
            Arc::new(Self {
                config,
                store,
                registry,
                plm,
                detector,
                placement,
            }),
            receiver,
        ))
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn plm(&self) -> &Arc<PipelineManager> {
        &self.plm
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    /// Start the lifecycle event loop and the detector sweep.
    pub fn spawn_background(&self, events: HealthReceiver) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.plm
                .clone()
                .spawn(events, self.config.detector.check_interval()),
            self.detector.clone().spawn(),
        ]
    }

    // === Node registry ===

    pub fn register_node(&self, node_id: &str, address: &str) -> Result<()> {
        self.store.put_node(&NodeRecord {
            node_id: node_id.to_string(),
            address: address.to_string(),
            state: NodeState::Healthy,
            last_heartbeat_ms: timestamp_now_millis(),
        })?;
        self.detector.observe_report(node_id);
        tracing::info!(%node_id, %address, "node registered");
        Ok(())
    }

    /// Node records with staleness computed against the stale-node
    /// interval at read time.
    pub fn nodes(&self) -> Result<Vec<NodeRecord>> {
        let stale_after = self.config.detector.stale_node_interval().as_millis() as u64;
        let now = timestamp_now_millis();
        Ok(self
            .store
            .list_nodes()?
            .into_iter()
            .map(|mut n| {
                if now.saturating_sub(n.last_heartbeat_ms) >= stale_after {
                    n.state = NodeState::Stale;
                }
                n
            })
            .collect())
    }

    // === Pipelines ===

    /// Create a pipeline of `factor` healthy members.
    pub fn create_pipeline(&self, factor: Option<usize>) -> Result<Pipeline> {
        let override_policy;
        let policy = match factor {
            Some(f) if f != self.placement.factor() => {
                override_policy = PlacementPolicy::new(f);
                &override_policy
            }
            _ => &self.placement,
        };
        let members = policy.select(&Uuid::new_v4().to_string(), &self.nodes()?)?;
        let leader = members[0].clone();
        let pipeline = Pipeline::new(members, leader);
        self.registry.insert(pipeline.clone())?;
        METRICS.open_pipelines.set(self.registry.open_count() as u64);
        tracing::info!(pipeline = %pipeline.id, members = ?pipeline.members, "pipeline created");
        Ok(pipeline)
    }

    /// Pipeline-state query. `None` after destruction is the documented
    /// terminal answer and must be treated as CLOSED by callers.
    pub fn pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        let found = self.registry.get(id);
        if found.is_some() {
            self.registry.touch(id);
        }
        found
    }

    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.registry.list()
    }

    /// Admin/placement graceful close request.
    pub fn close_pipeline(&self, id: PipelineId) -> Result<()> {
        if self.registry.get(id).is_none() {
            return Err(crate::Error::PipelineNotFound(id.to_string()));
        }
        self.plm.request_close(id);
        Ok(())
    }

    /// Container -> pipeline assignment lookup.
    pub fn container(&self, id: ContainerId) -> Result<Option<ContainerRecord>> {
        self.store.get_container(id)
    }

    // === Allocation ===

    /// Pick (or create) an OPEN pipeline and allocate a block in one of
    /// its containers. The container record is created on first
    /// allocation; the replica side materializes on first write.
    pub fn allocate_block(&self) -> Result<AllocatedBlock> {
        let pipeline = match self
            .registry
            .list()
            .into_iter()
            .find(|p| p.state.accepts_writes())
        {
            Some(p) => p,
            None => self.create_pipeline(None)?,
        };

        let container = match self.store.containers_of(pipeline.id)?.first() {
            Some(existing) => existing.container,
            None => {
                let id = self.store.next_container_id()?;
                self.store.put_container(&ContainerRecord {
                    container: id,
                    pipeline: pipeline.id,
                    state: ContainerLocalState::Open,
                    used_bytes: 0,
                })?;
                id
            }
        };

        Ok(AllocatedBlock {
            pipeline: pipeline.id,
            container,
            block: self.store.next_block_id()?,
            leader: pipeline.leader.clone(),
        })
    }

    // === Report ingestion ===

    pub fn handle_container_reports(
        &self,
        node: &str,
        reports: Vec<ContainerReport>,
    ) -> Vec<PipelineCommand> {
        METRICS.reports_received_total.inc();
        self.detector.observe_report(node);
        self.touch_node(node);

        for report in reports {
            if let Ok(Some(mut record)) = self.store.get_container(report.container) {
                record.state = report.state;
                record.used_bytes = report.used_bytes;
                self.registry.touch(record.pipeline);
                let _ = self.store.put_container(&record);
            }
        }

        self.plm.take_commands(node)
    }

    pub fn handle_pipeline_reports(
        &self,
        node: &str,
        reports: Vec<PipelineReport>,
    ) -> Vec<PipelineCommand> {
        METRICS.reports_received_total.inc();
        self.detector.observe_report(node);
        self.touch_node(node);

        for report in reports {
            self.plm
                .handle_pipeline_report(node, report.pipeline, report.state);
        }

        self.plm.take_commands(node)
    }

    pub fn handle_command_status(
        &self,
        node: &str,
        report: CommandStatusReport,
    ) -> Vec<PipelineCommand> {
        METRICS.reports_received_total.inc();
        self.detector.observe_report(node);
        self.touch_node(node);

        for status in &report.statuses {
            tracing::debug!(
                %node,
                command = %status.command_id,
                status = ?status.status,
                "command status"
            );
        }

        self.plm.take_commands(node)
    }

    fn touch_node(&self, node: &str) {
        if let Ok(Some(mut record)) = self.store.get_node(node) {
            record.last_heartbeat_ms = timestamp_now_millis();
            record.state = NodeState::Healthy;
            let _ = self.store.put_node(&record);
        }
    }
}

/// In-process report sink, for wiring nodes directly to a manager in the
/// same process.
#[derive(Clone)]
pub struct LocalReportSink(pub Arc<ClusterManager>);

impl ReportSink for LocalReportSink {
    async fn container_reports(
        &self,
        node: &str,
        reports: Vec<ContainerReport>,
    ) -> Result<Vec<PipelineCommand>> {
        Ok(self.0.handle_container_reports(node, reports))
    }

    async fn pipeline_reports(
        &self,
        node: &str,
        reports: Vec<PipelineReport>,
    ) -> Result<Vec<PipelineCommand>> {
        Ok(self.0.handle_pipeline_reports(node, reports))
    }

    async fn command_status(
        &self,
        node: &str,
        report: CommandStatusReport,
    ) -> Result<Vec<PipelineCommand>> {
        Ok(self.0.handle_command_status(node, report))
    }
}
