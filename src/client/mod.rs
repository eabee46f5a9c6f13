//! Client write path
//!
//! A block output stream is pinned to one pipeline/container for its
//! whole life: writes are never silently redirected mid-stream. Failures
//! are retried up to a bounded attempt count with a refreshed
//! pipeline/leader lookup in between; a pipeline observed
//! CLOSING/CLOSED (or gone entirely) fails fast with a terminal error so
//! the caller can ask placement for a new one.

pub mod http;

use crate::common::{Blake3Hasher, ClientConfig};
use crate::container::{BlockLocator, ContainerId, ContainerOp};
use crate::manager::AllocatedBlock;
use crate::pipeline::{Pipeline, PipelineId};
use crate::Result;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;

pub use http::HttpClusterClient;

/// What the write/read path needs from the cluster. The node binary's
/// HTTP client and the in-process test harness both implement this.
pub trait ClusterClient: Send + Sync {
    /// Ask placement for an open pipeline, a container in it, and a
    /// fresh block id.
    fn allocate(&self) -> impl Future<Output = Result<AllocatedBlock>> + Send;

    /// Current pipeline record. `None` means destroyed-and-removed,
    /// which callers must treat exactly like CLOSED.
    fn pipeline_info(
        &self,
        id: PipelineId,
    ) -> impl Future<Output = Result<Option<Pipeline>>> + Send;

    /// Submit an operation through the pipeline's current leader and
    /// wait for quorum commit.
    fn submit(
        &self,
        pipeline: PipelineId,
        container: ContainerId,
        op: ContainerOp,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Read a finalized block.
    fn read(&self, locator: &BlockLocator) -> impl Future<Output = Result<Bytes>> + Send;
}

/// Streaming writer for one block
pub struct BlockOutputStream<'a, C: ClusterClient> {
    client: &'a C,
    cfg: ClientConfig,
    target: AllocatedBlock,
    buffer: Vec<u8>,
    offset: u64,
    hasher: Blake3Hasher,
    chunk_count: u32,
}

impl<'a, C: ClusterClient> BlockOutputStream<'a, C> {
    /// Open a stream against a freshly allocated block.
    pub async fn open(client: &'a C, cfg: ClientConfig) -> Result<BlockOutputStream<'a, C>> {
        let target = client.allocate().await?;
        tracing::debug!(
            pipeline = %target.pipeline,
            container = target.container,
            block = target.block,
            "stream opened"
        );
        Ok(Self {
            client,
            cfg,
            target,
            buffer: Vec::new(),
            offset: 0,
            hasher: Blake3Hasher::new(),
            chunk_count: 0,
        })
    }

    pub fn target(&self) -> &AllocatedBlock {
        &self.target
    }

    /// Buffer bytes, flushing full chunks as they fill up.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.cfg.chunk_size {
            let chunk: Vec<u8> = self.buffer.drain(..self.cfg.chunk_size).collect();
            self.flush_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn flush_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        let len = chunk.len() as u64;
        let crc = crate::common::crc32(&chunk);
        self.hasher.update(&chunk);

        let op = ContainerOp::WriteChunk {
            block: self.target.block,
            offset: self.offset,
            len,
            crc,
            data: Bytes::from(chunk),
        };
        self.submit_with_retry(op).await?;

        self.offset += len;
        self.chunk_count += 1;
        Ok(())
    }

    /// Flush, finalize the block, and return its committed locator.
    pub async fn close(mut self) -> Result<Vec<BlockLocator>> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::take(&mut self.buffer);
            self.flush_chunk(chunk).await?;
        }

        let checksum = self.hasher.finalize();
        let op = ContainerOp::FinalizeBlock {
            block: self.target.block,
            len: self.offset,
            checksum: checksum.clone(),
            chunk_count: self.chunk_count,
        };
        self.submit_with_retry(op).await?;

        Ok(vec![BlockLocator {
            container: self.target.container,
            block: self.target.block,
            len: self.offset,
            checksum,
        }])
    }

    /// Bounded retry with refreshed pipeline lookup between attempts.
    /// Terminal pipeline states abort immediately; transient errors back
    /// off and retry; everything else surfaces as-is.
    async fn submit_with_retry(&self, op: ContainerOp) -> Result<u64> {
        let mut attempt = 0;
        let mut backoff = self.cfg.retry_backoff();

        loop {
            match self.client.pipeline_info(self.target.pipeline).await? {
                None => {
                    // Destroyed and forgotten: same as closed
                    return Err(crate::Error::PipelineNotFound(
                        self.target.pipeline.to_string(),
                    ));
                }
                Some(p) if !p.state.accepts_writes() => {
                    return Err(crate::Error::PipelineUnavailable {
                        id: p.id.to_string(),
                        state: p.state.to_string(),
                    });
                }
                Some(_) => {}
            }

            match self
                .client
                .submit(self.target.pipeline, self.target.container, op.clone())
                .await
            {
                Ok(index) => return Ok(index),
                Err(e) if e.is_pipeline_fatal() => return Err(e),
                Err(e) if e.is_retryable() && attempt + 1 < self.cfg.max_retries => {
                    attempt += 1;
                    let jitter_ms = rand::thread_rng()
                        .gen_range(0..=backoff.as_millis() as u64 / 2 + 1);
                    tracing::warn!(
                        pipeline = %self.target.pipeline,
                        attempt,
                        "write attempt failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff + std::time::Duration::from_millis(jitter_ms))
                        .await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Read a finalized block through the cluster.
pub async fn read_block<C: ClusterClient>(client: &C, locator: &BlockLocator) -> Result<Bytes> {
    client.read(locator).await
}
