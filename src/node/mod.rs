//! Storage node: hosts container replicas and applies the replicated log
//!
//! One `PipelineReplica` per pipeline the node is a member of. The
//! replica is the node's seam into the replication primitive: it routes
//! committed entries to per-container state machines, creating them
//! implicitly on first write. Reads resolve leadership from the log
//! group at the moment of the call.

pub mod http;
pub mod reports;
pub mod server;

use crate::common::METRICS;
use crate::container::{
    BlockLocator, ContainerId, ContainerLocalState, ContainerStateMachine, ChunkStore,
    ContainerOp,
};
use crate::detector::{emit, HealthEvent, HealthEventKind, HealthSender};
use crate::pipeline::manager::{PipelineCommand, PipelineCommandKind};
use crate::pipeline::{NodeId, PipelineId, PipelineState};
use crate::rlog::{LogApplier, LogEntry, LogGroup, ReplicationLevel};
use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

pub use reports::{
    CommandState, CommandStatus, CommandStatusReport, ContainerReport, PipelineReport, ReportSink,
};

/// This node's replica of one pipeline: the containers it hosts for it
/// and the locally perceived pipeline state.
pub struct PipelineReplica {
    node: NodeId,
    pipeline: PipelineId,
    data_path: PathBuf,
    health: HealthSender,
    containers: RwLock<HashMap<ContainerId, Arc<ContainerStateMachine>>>,
    local_state: Mutex<PipelineState>,
}

impl PipelineReplica {
    fn new(node: NodeId, pipeline: PipelineId, data_path: PathBuf, health: HealthSender) -> Self {
        Self {
            node,
            pipeline,
            data_path,
            health,
            containers: RwLock::new(HashMap::new()),
            local_state: Mutex::new(PipelineState::Open),
        }
    }

    /// Containers are created implicitly by the first write that lands
    /// in them.
    fn get_or_create(&self, container: ContainerId) -> Result<Arc<ContainerStateMachine>> {
        if let Some(csm) = self.containers.read().unwrap().get(&container) {
            return Ok(csm.clone());
        }
        let mut map = self.containers.write().unwrap();
        if let Some(csm) = map.get(&container) {
            return Ok(csm.clone());
        }
        let store = ChunkStore::open(&self.data_path, container)?;
        let csm = Arc::new(ContainerStateMachine::new(
            self.pipeline,
            self.node.clone(),
            store,
            self.health.clone(),
        ));
        map.insert(container, csm.clone());
        METRICS.hosted_containers.set(map.len() as u64);
        tracing::info!(
            node = %self.node,
            pipeline = %self.pipeline,
            container,
            "container created"
        );
        Ok(csm)
    }

    pub fn container(&self, id: ContainerId) -> Option<Arc<ContainerStateMachine>> {
        self.containers.read().unwrap().get(&id).cloned()
    }

    pub fn local_state(&self) -> PipelineState {
        *self.local_state.lock().unwrap()
    }

    /// Execute a manager close command: stop taking traffic, quasi-close
    /// every container.
    fn close_locally(&self) {
        *self.local_state.lock().unwrap() = PipelineState::Closed;
        for csm in self.containers.read().unwrap().values() {
            csm.quasi_close();
        }
        tracing::info!(node = %self.node, pipeline = %self.pipeline, "pipeline closed locally");
    }
}

impl LogApplier for PipelineReplica {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        self.get_or_create(entry.container)?.apply(entry)
    }

    fn read_entry(&self, entry: &LogEntry) -> Result<Bytes> {
        // Only the leader is asked for log data; a missing container here
        // is already a leader-side read failure
        match self.container(entry.container) {
            Some(csm) => csm.read_entry(entry),
            None => {
                let err = crate::Error::ReadFailed {
                    container: entry.container,
                    reason: "container not hosted".into(),
                };
                emit(
                    &self.health,
                    HealthEvent::new(
                        self.node.clone(),
                        self.pipeline,
                        HealthEventKind::ReadFailure {
                            container: entry.container,
                        },
                        Some(self.node.clone()),
                    ),
                );
                Err(err)
            }
        }
    }
}

/// A storage node: its pipeline replicas plus the report plumbing
pub struct StorageNode {
    id: NodeId,
    data_path: PathBuf,
    health: HealthSender,
    pipelines: RwLock<HashMap<PipelineId, (Arc<PipelineReplica>, Arc<LogGroup>)>>,
    command_statuses: Mutex<Vec<CommandStatus>>,
}

impl StorageNode {
    pub fn new(id: impl Into<NodeId>, data_path: impl Into<PathBuf>, health: HealthSender) -> Self {
        Self {
            id: id.into(),
            data_path: data_path.into(),
            health,
            pipelines: RwLock::new(HashMap::new()),
            command_statuses: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Join a pipeline: register this node's replica as the group's
    /// applier for this member.
    pub fn join_pipeline(&self, group: Arc<LogGroup>) -> Arc<PipelineReplica> {
        let replica = Arc::new(PipelineReplica::new(
            self.id.clone(),
            group.pipeline(),
            self.data_path.clone(),
            self.health.clone(),
        ));
        group.register(&self.id, replica.clone());
        self.pipelines
            .write()
            .unwrap()
            .insert(group.pipeline(), (replica.clone(), group));
        replica
    }

    pub fn replica(&self, pipeline: PipelineId) -> Option<Arc<PipelineReplica>> {
        self.pipelines
            .read()
            .unwrap()
            .get(&pipeline)
            .map(|(r, _)| r.clone())
    }

    /// Submit a write through this node. Fails with `NotLeader` if the
    /// replication primitive says leadership is elsewhere right now, and
    /// refuses outright once the pipeline is closed locally.
    pub async fn submit(
        &self,
        pipeline: PipelineId,
        container: ContainerId,
        op: ContainerOp,
        watch_timeout: Duration,
    ) -> Result<u64> {
        let (replica, group) = {
            let map = self.pipelines.read().unwrap();
            let (r, g) = map
                .get(&pipeline)
                .ok_or_else(|| crate::Error::PipelineNotFound(pipeline.to_string()))?;
            (r.clone(), g.clone())
        };

        if replica.local_state() != PipelineState::Open {
            return Err(crate::Error::PipelineUnavailable {
                id: pipeline.to_string(),
                state: replica.local_state().to_string(),
            });
        }

        let leader = group.leader();
        if leader != self.id {
            return Err(crate::Error::NotLeader(leader));
        }

        let index = group.append(container, op)?;

        match group
            .watch(index, ReplicationLevel::Committed, watch_timeout)
            .await
        {
            Ok(()) => Ok(index),
            Err(e) => {
                emit(
                    &self.health,
                    HealthEvent::new(
                        self.id.clone(),
                        pipeline,
                        HealthEventKind::WatchTimeout,
                        Some(group.leader()),
                    ),
                );
                Err(e)
            }
        }
    }

    /// Read a finalized block from whichever replica hosts its
    /// container. Leadership is resolved at this moment, never cached.
    pub fn read_block(&self, locator: &BlockLocator) -> Result<Bytes> {
        let found = {
            let map = self.pipelines.read().unwrap();
            map.values().find_map(|(replica, group)| {
                replica
                    .container(locator.container)
                    .map(|csm| (csm, group.clone()))
            })
        };
        match found {
            Some((csm, group)) => {
                let observed_leader = group.leader();
                csm.read_block(locator, &observed_leader)
            }
            None => Err(crate::Error::ContainerNotFound(locator.container)),
        }
    }

    /// Execute commands returned by the manager on a report response.
    pub fn execute_commands(&self, commands: Vec<PipelineCommand>) {
        for cmd in commands {
            let outcome = match cmd.kind {
                PipelineCommandKind::ClosePipeline => match self.replica(cmd.pipeline) {
                    Some(replica) => {
                        replica.close_locally();
                        CommandState::Completed
                    }
                    None => CommandState::Failed,
                },
            };
            self.command_statuses.lock().unwrap().push(CommandStatus {
                command_id: cmd.command_id,
                status: outcome,
            });
        }
    }

    pub fn container_reports(&self) -> Vec<ContainerReport> {
        let mut reports = Vec::new();
        for (replica, _) in self.pipelines.read().unwrap().values() {
            for csm in replica.containers.read().unwrap().values() {
                reports.push(ContainerReport {
                    container: csm.container(),
                    state: csm.local_state(),
                    used_bytes: csm.used_bytes(),
                });
            }
        }
        reports
    }

    pub fn pipeline_reports(&self) -> Vec<PipelineReport> {
        self.pipelines
            .read()
            .unwrap()
            .iter()
            .map(|(id, (replica, _))| PipelineReport {
                pipeline: *id,
                state: replica.local_state(),
            })
            .collect()
    }

    /// Drain command completions accumulated since the last report.
    pub fn command_status_report(&self) -> CommandStatusReport {
        CommandStatusReport {
            statuses: std::mem::take(&mut *self.command_statuses.lock().unwrap()),
        }
    }

    /// Outstanding (not yet drained) command ids, for introspection
    pub fn outstanding_commands(&self) -> Vec<Uuid> {
        self.command_statuses
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.command_id)
            .collect()
    }

    pub fn hosted_containers(&self) -> usize {
        self.pipelines
            .read()
            .unwrap()
            .values()
            .map(|(r, _)| r.containers.read().unwrap().len())
            .sum()
    }
}

/// Local container summary exposed on the node API
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContainerSummary {
    pub container: ContainerId,
    pub pipeline: PipelineId,
    pub state: ContainerLocalState,
    pub used_bytes: u64,
    pub last_applied: u64,
}

impl StorageNode {
    pub fn container_summaries(&self) -> Vec<ContainerSummary> {
        let mut out = Vec::new();
        for (pipeline, (replica, _)) in self.pipelines.read().unwrap().iter() {
            for csm in replica.containers.read().unwrap().values() {
                out.push(ContainerSummary {
                    container: csm.container(),
                    pipeline: *pipeline,
                    state: csm.local_state(),
                    used_bytes: csm.used_bytes(),
                    last_applied: csm.last_applied(),
                });
            }
        }
        out
    }
}
