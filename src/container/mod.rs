//! Containers: fixed-size replicated storage units
//!
//! A container holds a bounded set of blocks. Writes reach it only
//! through the replicated log of the pipeline that owns it; reads are
//! served from local, already-applied data.

pub mod state_machine;
pub mod store;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use state_machine::ContainerStateMachine;
pub use store::{BlockMeta, ChunkStore};

/// Container identifier, unique cluster-wide
pub type ContainerId = u64;

/// Block identifier, unique within a container
pub type BlockId = u64;

/// Where a finalized block lives and how to verify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocator {
    pub container: ContainerId,
    pub block: BlockId,
    pub len: u64,
    pub checksum: String,
}

/// Local lifecycle of a container replica on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerLocalState {
    /// Accepting applies through an OPEN pipeline
    Open,
    /// Pipeline closed; replica is read-only
    QuasiClosed,
}

/// The closed set of operations a container state machine can apply.
///
/// Adding a kind here forces every apply site to handle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContainerOp {
    WriteChunk {
        block: BlockId,
        offset: u64,
        len: u64,
        crc: u32,
        /// Chunk payload. Present on the write path; stripped when the
        /// entry is retained in the log (catch-up re-reads it from the
        /// leader's store).
        data: Bytes,
    },
    FinalizeBlock {
        block: BlockId,
        len: u64,
        checksum: String,
        chunk_count: u32,
    },
}

impl ContainerOp {
    /// The block this operation touches
    pub fn block(&self) -> BlockId {
        match self {
            ContainerOp::WriteChunk { block, .. } => *block,
            ContainerOp::FinalizeBlock { block, .. } => *block,
        }
    }

    /// Copy of this operation with the chunk payload removed, as retained
    /// in the log.
    pub fn strip_payload(&self) -> ContainerOp {
        match self {
            ContainerOp::WriteChunk {
                block,
                offset,
                len,
                crc,
                ..
            } => ContainerOp::WriteChunk {
                block: *block,
                offset: *offset,
                len: *len,
                crc: *crc,
                data: Bytes::new(),
            },
            op @ ContainerOp::FinalizeBlock { .. } => op.clone(),
        }
    }

    /// Copy of this operation with `data` as the chunk payload.
    pub fn with_payload(&self, data: Bytes) -> ContainerOp {
        match self {
            ContainerOp::WriteChunk {
                block,
                offset,
                len,
                crc,
                ..
            } => ContainerOp::WriteChunk {
                block: *block,
                offset: *offset,
                len: *len,
                crc: *crc,
                data,
            },
            op @ ContainerOp::FinalizeBlock { .. } => op.clone(),
        }
    }

    /// Bytes carried by this operation
    pub fn payload_len(&self) -> usize {
        match self {
            ContainerOp::WriteChunk { data, .. } => data.len(),
            ContainerOp::FinalizeBlock { .. } => 0,
        }
    }
}
