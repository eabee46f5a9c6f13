//! Metadata store using RocksDB
//!
//! Stores:
//! - Pipeline records (terminal lifecycle states survive restarts)
//! - Container registry (container -> pipeline assignment, usage)
//! - Node registry (node_id -> address, last heartbeat)
//! - Counters (container/block id allocation)

use crate::common::{NodeState, Result};
use crate::container::{ContainerId, ContainerLocalState};
use crate::pipeline::{NodeId, Pipeline, PipelineId, PipelineStore};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

const CF_PIPELINES: &str = "pipelines";
const CF_CONTAINERS: &str = "containers";
const CF_NODES: &str = "nodes";
const CF_META: &str = "meta";

const KEY_NEXT_CONTAINER: &[u8] = b"next_container_id";
const KEY_NEXT_BLOCK: &[u8] = b"next_block_id";

/// Node registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub address: String,
    pub state: NodeState,
    pub last_heartbeat_ms: u64,
}

/// Container registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container: ContainerId,
    pub pipeline: PipelineId,
    pub state: ContainerLocalState,
    pub used_bytes: u64,
}

/// Metadata store
pub struct MetaStore {
    db: DB,
    /// Serializes read-modify-write id allocation
    alloc_lock: Mutex<()>,
}

impl MetaStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_PIPELINES, CF_CONTAINERS, CF_NODES, CF_META],
        )?;

        Ok(Self {
            db,
            alloc_lock: Mutex::new(()),
        })
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| crate::Error::Internal(format!("serialize error: {}", e)))
    }

    fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| crate::Error::MetadataCorrupted(e.to_string()))
    }

    // === Pipeline operations ===

    pub fn put_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let cf = self.db.cf_handle(CF_PIPELINES).unwrap();
        self.db.put_cf(
            cf,
            pipeline.id.to_string().as_bytes(),
            Self::encode(pipeline)?,
        )?;
        Ok(())
    }

    pub fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let cf = self.db.cf_handle(CF_PIPELINES).unwrap();
        match self.db.get_cf(cf, id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        let cf = self.db.cf_handle(CF_PIPELINES).unwrap();
        self.db.delete_cf(cf, id.to_string().as_bytes())?;
        Ok(())
    }

    pub fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let cf = self.db.cf_handle(CF_PIPELINES).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut pipelines = Vec::new();
        for item in iter {
            let (_, value) = item?;
            pipelines.push(Self::decode(&value)?);
        }
        Ok(pipelines)
    }

    // === Container operations ===

    pub fn put_container(&self, record: &ContainerRecord) -> Result<()> {
        let cf = self.db.cf_handle(CF_CONTAINERS).unwrap();
        self.db.put_cf(
            cf,
            record.container.to_le_bytes(),
            Self::encode(record)?,
        )?;
        Ok(())
    }

    pub fn get_container(&self, container: ContainerId) -> Result<Option<ContainerRecord>> {
        let cf = self.db.cf_handle(CF_CONTAINERS).unwrap();
        match self.db.get_cf(cf, container.to_le_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let cf = self.db.cf_handle(CF_CONTAINERS).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut containers = Vec::new();
        for item in iter {
            let (_, value) = item?;
            containers.push(Self::decode(&value)?);
        }
        Ok(containers)
    }

    /// Containers assigned to a pipeline
    pub fn containers_of(&self, pipeline: PipelineId) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.pipeline == pipeline)
            .collect())
    }

    // === Node operations ===

    pub fn put_node(&self, record: &NodeRecord) -> Result<()> {
        let cf = self.db.cf_handle(CF_NODES).unwrap();
        self.db
            .put_cf(cf, record.node_id.as_bytes(), Self::encode(record)?)?;
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let cf = self.db.cf_handle(CF_NODES).unwrap();
        match self.db.get_cf(cf, node_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let cf = self.db.cf_handle(CF_NODES).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut nodes = Vec::new();
        for item in iter {
            let (_, value) = item?;
            nodes.push(Self::decode(&value)?);
        }
        Ok(nodes)
    }

    // === Counters ===

    fn next_id(&self, key: &[u8]) -> Result<u64> {
        let _guard = self.alloc_lock.lock().unwrap();
        let cf = self.db.cf_handle(CF_META).unwrap();
        let next = match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| crate::Error::MetadataCorrupted("bad counter".into()))?;
                u64::from_le_bytes(arr)
            }
            None => 1,
        };
        self.db.put_cf(cf, key, (next + 1).to_le_bytes())?;
        Ok(next)
    }

    pub fn next_container_id(&self) -> Result<ContainerId> {
        self.next_id(KEY_NEXT_CONTAINER)
    }

    pub fn next_block_id(&self) -> Result<u64> {
        self.next_id(KEY_NEXT_BLOCK)
    }
}

impl PipelineStore for MetaStore {
    fn persist(&self, pipeline: &Pipeline) -> Result<()> {
        self.put_pipeline(pipeline)
    }

    fn remove(&self, id: PipelineId) -> Result<()> {
        self.delete_pipeline(id)
    }

    fn load_all(&self) -> Result<Vec<Pipeline>> {
        self.list_pipelines()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::timestamp_now_millis;
    use crate::pipeline::PipelineState;
    use tempfile::TempDir;

    #[test]
    fn test_pipeline_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let mut pipeline = Pipeline::new(
            vec!["n1".into(), "n2".into(), "n3".into()],
            "n1".into(),
        );
        pipeline.state = PipelineState::Closed;
        store.put_pipeline(&pipeline).unwrap();

        let loaded = store.get_pipeline(pipeline.id).unwrap().unwrap();
        assert_eq!(loaded.state, PipelineState::Closed);
        assert_eq!(loaded.members, pipeline.members);

        store.delete_pipeline(pipeline.id).unwrap();
        assert!(store.get_pipeline(pipeline.id).unwrap().is_none());
    }

    #[test]
    fn test_container_assignment_lookup() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let pipeline = PipelineId::random();
        store
            .put_container(&ContainerRecord {
                container: 1,
                pipeline,
                state: ContainerLocalState::Open,
                used_bytes: 0,
            })
            .unwrap();

        let rec = store.get_container(1).unwrap().unwrap();
        assert_eq!(rec.pipeline, pipeline);
        assert_eq!(store.containers_of(pipeline).unwrap().len(), 1);
        assert!(store.get_container(2).unwrap().is_none());
    }

    #[test]
    fn test_node_registry() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        store
            .put_node(&NodeRecord {
                node_id: "n1".into(),
                address: "http://localhost:6000".into(),
                state: NodeState::Healthy,
                last_heartbeat_ms: timestamp_now_millis(),
            })
            .unwrap();

        assert_eq!(store.list_nodes().unwrap().len(), 1);
        assert!(store.get_node("n1").unwrap().is_some());
        assert!(store.get_node("n2").unwrap().is_none());
    }

    #[test]
    fn test_id_allocation_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let a = store.next_container_id().unwrap();
        let b = store.next_container_id().unwrap();
        assert_eq!(b, a + 1);

        // Block ids allocate independently
        assert_eq!(store.next_block_id().unwrap(), 1);
    }

    #[test]
    fn test_store_as_pipeline_store() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let pipeline = Pipeline::new(vec!["n1".into()], "n1".into());
        PipelineStore::persist(&store, &pipeline).unwrap();
        assert_eq!(PipelineStore::load_all(&store).unwrap().len(), 1);
        PipelineStore::remove(&store, pipeline.id).unwrap();
        assert!(PipelineStore::load_all(&store).unwrap().is_empty());
    }
}
