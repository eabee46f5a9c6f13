//! HTTP implementation of the cluster client
//!
//! Talks to the manager for allocation and pipeline lookups, and to
//! storage nodes for chunk writes and block reads. Node addresses are
//! cached and refreshed from the manager on miss.

use crate::client::ClusterClient;
use crate::common::ClientConfig;
use crate::container::{BlockLocator, ContainerId, ContainerOp};
use crate::manager::{AllocatedBlock, NodeRecord};
use crate::pipeline::{Pipeline, PipelineId};
use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct HttpClusterClient {
    http: reqwest::Client,
    manager_url: String,
    node_addresses: RwLock<HashMap<String, String>>,
}

impl HttpClusterClient {
    pub fn new(manager_url: impl Into<String>, cfg: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()?;
        Ok(Self {
            http,
            manager_url: manager_url.into(),
            node_addresses: RwLock::new(HashMap::new()),
        })
    }

    async fn node_address(&self, node: &str) -> Result<String> {
        if let Some(addr) = self.node_addresses.read().unwrap().get(node) {
            return Ok(addr.clone());
        }

        let nodes: Vec<NodeRecord> = self
            .http
            .get(format!("{}/v1/nodes", self.manager_url))
            .send()
            .await?
            .json()
            .await?;

        let mut cache = self.node_addresses.write().unwrap();
        for record in &nodes {
            cache.insert(record.node_id.clone(), record.address.clone());
        }
        cache
            .get(node)
            .cloned()
            .ok_or_else(|| crate::Error::ConnectionFailed(format!("unknown node {}", node)))
    }

    async fn leader_address(&self, pipeline: PipelineId) -> Result<String> {
        let info = self.pipeline_info(pipeline).await?;
        match info {
            Some(p) => self.node_address(&p.leader).await,
            None => Err(crate::Error::PipelineNotFound(pipeline.to_string())),
        }
    }
}

impl ClusterClient for HttpClusterClient {
    async fn allocate(&self) -> Result<AllocatedBlock> {
        let resp = self
            .http
            .post(format!("{}/v1/blocks/allocate", self.manager_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(crate::Error::Http(format!(
                "allocation failed: {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn pipeline_info(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let resp = self
            .http
            .get(format!("{}/v1/pipelines/{}", self.manager_url, id))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(crate::Error::Http(format!(
                "pipeline lookup failed: {}",
                resp.status()
            )));
        }
        Ok(Some(resp.json().await?))
    }

    async fn submit(
        &self,
        pipeline: PipelineId,
        container: ContainerId,
        op: ContainerOp,
    ) -> Result<u64> {
        let leader = self.leader_address(pipeline).await?;

        let resp = match op {
            ContainerOp::WriteChunk {
                block,
                offset,
                crc,
                data,
                ..
            } => {
                self.http
                    .post(format!(
                        "{}/v1/pipelines/{}/containers/{}/chunks?block={}&offset={}&crc={}",
                        leader, pipeline, container, block, offset, crc
                    ))
                    .body(data)
                    .send()
                    .await?
            }
            ContainerOp::FinalizeBlock {
                block,
                len,
                checksum,
                chunk_count,
            } => {
                self.http
                    .post(format!(
                        "{}/v1/pipelines/{}/containers/{}/blocks/{}/finalize",
                        leader, pipeline, container, block
                    ))
                    .json(&serde_json::json!({
                        "len": len,
                        "checksum": checksum,
                        "chunk_count": chunk_count,
                    }))
                    .send()
                    .await?
            }
        };

        if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(crate::Error::PipelineUnavailable {
                id: pipeline.to_string(),
                state: "closed".into(),
            });
        }
        if !resp.status().is_success() {
            return Err(crate::Error::Http(format!(
                "write rejected: {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        body["index"]
            .as_u64()
            .ok_or_else(|| crate::Error::Http("missing commit index in response".into()))
    }

    async fn read(&self, locator: &BlockLocator) -> Result<Bytes> {
        // Resolve the owning pipeline, then read from its leader
        let record = self
            .http
            .get(format!(
                "{}/v1/containers/{}",
                self.manager_url, locator.container
            ))
            .send()
            .await?;
        if !record.status().is_success() {
            return Err(crate::Error::ContainerNotFound(locator.container));
        }
        let record: crate::manager::ContainerRecord = record.json().await?;

        let pipeline = self
            .pipeline_info(record.pipeline)
            .await?
            .ok_or_else(|| crate::Error::PipelineNotFound(record.pipeline.to_string()))?;
        let address = self.node_address(&pipeline.leader).await?;

        let resp = self
            .http
            .get(format!(
                "{}/v1/containers/{}/blocks/{}?len={}&checksum={}",
                address, locator.container, locator.block, locator.len, locator.checksum
            ))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(crate::Error::ReadFailed {
                container: locator.container,
                reason: format!("node returned {}", resp.status()),
            });
        }
        Ok(resp.bytes().await?)
    }
}
