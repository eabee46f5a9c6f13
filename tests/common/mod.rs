//! In-process mini cluster for integration tests
//!
//! Wires a real cluster manager (registry, lifecycle manager, detector,
//! RocksDB store) to real storage nodes over the in-process replication
//! fabric. Tests drive health events deterministically via
//! `pump_events` / `detector_sweep` instead of sleeping on background
//! tasks.

use carton::client::ClusterClient;
use carton::common::{ClientConfig, DetectorConfig, ManagerConfig};
use carton::container::{BlockLocator, ContainerId, ContainerOp};
use carton::detector::HealthReceiver;
use carton::manager::{AllocatedBlock, ClusterManager, LocalReportSink};
use carton::node::ReportSink;
use carton::pipeline::{Pipeline, PipelineId};
use carton::rlog::LogGroup;
use carton::{Result, StorageNode};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub struct MiniCluster {
    pub manager: Arc<ClusterManager>,
    pub nodes: Vec<Arc<StorageNode>>,
    events: Mutex<HealthReceiver>,
    groups: Mutex<HashMap<PipelineId, Arc<LogGroup>>>,
    node_dirs: HashMap<String, PathBuf>,
    _dirs: Vec<TempDir>,
}

pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        detector: DetectorConfig {
            stale_node_interval_ms: 1_000,
            watch_timeout_ms: 500,
            follower_slowness_timeout_ms: 2_000,
            check_interval_ms: 100,
        },
        pipeline_destroy_timeout_ms: 1_000,
        ..ManagerConfig::default()
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        max_retries: 3,
        request_timeout_ms: 500,
        watch_timeout_ms: 500,
        retry_backoff_ms: 10,
        chunk_size: 1024,
    }
}

impl MiniCluster {
    pub fn new(num_nodes: usize, mut config: ManagerConfig) -> Self {
        let db_dir = TempDir::new().unwrap();
        config.db_path = db_dir.path().to_path_buf();

        let (manager, events) = ClusterManager::new(config).unwrap();

        let mut dirs = vec![db_dir];
        let mut nodes = Vec::new();
        let mut node_dirs = HashMap::new();
        let health = manager.detector().sender();

        for i in 1..=num_nodes {
            let id = format!("n{}", i);
            let dir = TempDir::new().unwrap();
            node_dirs.insert(id.clone(), dir.path().to_path_buf());
            manager
                .register_node(&id, &format!("http://localhost:60{:02}", i))
                .unwrap();
            nodes.push(Arc::new(StorageNode::new(
                id,
                dir.path(),
                health.clone(),
            )));
            dirs.push(dir);
        }

        Self {
            manager,
            nodes,
            events: Mutex::new(events),
            groups: Mutex::new(HashMap::new()),
            node_dirs,
            _dirs: dirs,
        }
    }

    pub fn node(&self, id: &str) -> Arc<StorageNode> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .expect("unknown node")
            .clone()
    }

    pub fn node_data_dir(&self, id: &str) -> &PathBuf {
        &self.node_dirs[id]
    }

    /// Create a pipeline and wire its members into a log group.
    pub fn create_pipeline(&self, factor: usize) -> Pipeline {
        let pipeline = self.manager.create_pipeline(Some(factor)).unwrap();
        let group = Arc::new(LogGroup::new(pipeline.id, pipeline.members.clone()));
        group.set_leader(&pipeline.leader);
        for member in &pipeline.members {
            self.node(member).join_pipeline(group.clone());
        }
        self.manager.detector().register_group(group.clone());
        self.groups.lock().unwrap().insert(pipeline.id, group);
        pipeline
    }

    pub fn group(&self, pipeline: PipelineId) -> Arc<LogGroup> {
        self.groups.lock().unwrap()[&pipeline].clone()
    }

    /// Take a node out: its group memberships stop replicating and its
    /// reports stop arriving.
    pub fn stop_node(&self, id: &str) {
        for group in self.groups.lock().unwrap().values() {
            if group.members().iter().any(|m| m == id) {
                group.disconnect(id);
            }
        }
    }

    /// Bring a node back; catch-up replays missed entries through the
    /// leader read path.
    pub fn restart_node(&self, id: &str) -> Result<()> {
        for group in self.groups.lock().unwrap().values() {
            if group.members().iter().any(|m| m == id) {
                group.reconnect(id)?;
            }
        }
        Ok(())
    }

    /// Deliver every member's current reports through the report sink
    /// and execute any commands that come back.
    pub async fn deliver_reports(&self) {
        let sink = LocalReportSink(self.manager.clone());
        for node in &self.nodes {
            let commands = sink
                .pipeline_reports(node.id(), node.pipeline_reports())
                .await
                .unwrap();
            node.execute_commands(commands);
            let commands = sink
                .container_reports(node.id(), node.container_reports())
                .await
                .unwrap();
            node.execute_commands(commands);
            let report = node.command_status_report();
            if !report.statuses.is_empty() {
                let commands = sink.command_status(node.id(), report).await.unwrap();
                node.execute_commands(commands);
            }
        }
    }

    /// Drain queued health events into the lifecycle manager.
    pub fn pump_events(&self) {
        let mut events = self.events.lock().unwrap();
        while let Ok(ev) = events.try_recv() {
            self.manager.plm().handle_event(ev);
        }
    }

    /// One failure-detection cycle at a given timestamp, then lifecycle
    /// processing of whatever it found.
    pub fn detector_sweep(&self, now_ms: u64) {
        self.manager.detector().check_once(now_ms);
        self.pump_events();
    }

    pub fn client(&self) -> MiniClusterClient<'_> {
        MiniClusterClient {
            cluster: self,
            cfg: client_config(),
        }
    }
}

/// In-process implementation of the client seam
pub struct MiniClusterClient<'a> {
    cluster: &'a MiniCluster,
    cfg: ClientConfig,
}

impl ClusterClient for MiniClusterClient<'_> {
    async fn allocate(&self) -> Result<AllocatedBlock> {
        self.cluster.manager.allocate_block()
    }

    async fn pipeline_info(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.cluster.manager.pipeline(id))
    }

    async fn submit(
        &self,
        pipeline: PipelineId,
        container: ContainerId,
        op: ContainerOp,
    ) -> Result<u64> {
        let group = self.cluster.group(pipeline);
        // Leader resolved per attempt, never cached across retries
        let leader = group.leader();
        self.cluster
            .node(&leader)
            .submit(pipeline, container, op, self.cfg.watch_timeout())
            .await
    }

    async fn read(&self, locator: &BlockLocator) -> Result<Bytes> {
        let record = self
            .cluster
            .manager
            .container(locator.container)?
            .ok_or(carton::Error::ContainerNotFound(locator.container))?;
        let group = self.cluster.group(record.pipeline);
        let leader = group.leader();
        self.cluster.node(&leader).read_block(locator)
    }
}
