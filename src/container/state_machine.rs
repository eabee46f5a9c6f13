//! Container state machine
//!
//! One instance per container per node. Applies the committed log to the
//! local chunk store and serves local reads; never talks to the network.
//! Failures escalate as health events: a fatal apply is a node-local
//! defect, a read failure on the acting leader condemns the whole
//! pipeline.

use crate::common::METRICS;
use crate::container::{BlockLocator, ContainerId, ContainerLocalState, ContainerOp};
use crate::detector::{emit, HealthEvent, HealthEventKind, HealthSender};
use crate::pipeline::{NodeId, PipelineId};
use crate::rlog::LogEntry;
use crate::Result;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::store::ChunkStore;

pub struct ContainerStateMachine {
    container: ContainerId,
    pipeline: PipelineId,
    node: NodeId,
    store: Mutex<ChunkStore>,
    /// Log-sequence watermark; entries at or below it replay as no-ops
    last_applied: AtomicU64,
    local_state: Mutex<ContainerLocalState>,
    health: HealthSender,
}

impl ContainerStateMachine {
    pub fn new(
        pipeline: PipelineId,
        node: NodeId,
        store: ChunkStore,
        health: HealthSender,
    ) -> Self {
        Self {
            container: store.container(),
            pipeline,
            node,
            store: Mutex::new(store),
            last_applied: AtomicU64::new(0),
            local_state: Mutex::new(ContainerLocalState::Open),
            health,
        }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> u64 {
        self.store.lock().unwrap().used_bytes()
    }

    pub fn local_state(&self) -> ContainerLocalState {
        *self.local_state.lock().unwrap()
    }

    /// Pipeline closed: the replica stops taking new traffic and becomes
    /// read-only.
    pub fn quasi_close(&self) {
        *self.local_state.lock().unwrap() = ContainerLocalState::QuasiClosed;
    }

    /// Apply one committed entry. Entries arrive in log order; reapplying
    /// an already-applied entry (crash-restart replay) is a no-op, and
    /// the deterministic chunk offsets make the full replay converge to
    /// identical on-disk state.
    pub fn apply(&self, entry: &LogEntry) -> Result<()> {
        debug_assert_eq!(entry.container, self.container);

        let watermark = self.last_applied.load(Ordering::SeqCst);
        if entry.index <= watermark {
            return Ok(());
        }
        if entry.index != watermark + 1 {
            return Err(crate::Error::OutOfOrder(entry.index));
        }

        let result = {
            let mut store = self.store.lock().unwrap();
            match &entry.op {
                ContainerOp::WriteChunk {
                    block,
                    offset,
                    len,
                    crc,
                    data,
                } => {
                    if data.len() as u64 != *len {
                        Err(crate::Error::Corrupted(format!(
                            "chunk payload is {} bytes, entry says {}",
                            data.len(),
                            len
                        )))
                    } else {
                        store.write_chunk(*block, *offset, data, *crc)
                    }
                }
                ContainerOp::FinalizeBlock {
                    block,
                    len,
                    checksum,
                    chunk_count,
                } => store.finalize_block(*block, *len, checksum, *chunk_count),
            }
        };

        match result {
            Ok(()) => {
                METRICS.chunk_writes_total.inc();
                METRICS
                    .bytes_written_total
                    .add(entry.op.payload_len() as u64);
                self.last_applied.store(entry.index, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                METRICS.apply_failures_total.inc();
                tracing::error!(
                    container = self.container,
                    index = entry.index,
                    "apply failed: {}",
                    e
                );
                emit(
                    &self.health,
                    HealthEvent::new(
                        self.node.clone(),
                        self.pipeline,
                        HealthEventKind::ApplyFailure {
                            container: self.container,
                        },
                        None,
                    ),
                );
                Err(crate::Error::ApplyFailed {
                    container: self.container,
                    index: entry.index,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Serve a retained entry's payload for follower catch-up. The
    /// replication primitive only asks the member it considers leader,
    /// so a failure here is by definition a leader read failure and is
    /// escalated as one.
    pub fn read_entry(&self, entry: &LogEntry) -> Result<Bytes> {
        let result = match &entry.op {
            ContainerOp::WriteChunk {
                block,
                offset,
                len,
                crc,
                ..
            } => self
                .store
                .lock()
                .unwrap()
                .read_chunk(*block, *offset, *len, *crc),
            ContainerOp::FinalizeBlock { .. } => Ok(Bytes::new()),
        };

        if let Err(e) = &result {
            METRICS.block_read_failures_total.inc();
            tracing::error!(
                container = self.container,
                index = entry.index,
                "leader log-data read failed: {}",
                e
            );
            emit(
                &self.health,
                HealthEvent::new(
                    self.node.clone(),
                    self.pipeline,
                    HealthEventKind::ReadFailure {
                        container: self.container,
                    },
                    Some(self.node.clone()),
                ),
            );
        }

        result
    }

    /// Read a finalized block from local storage. `observed_leader` is
    /// whoever the replication primitive named leader at the moment of
    /// the call; if that is this node, a failure is escalated as a
    /// pipeline-level signal instead of a local retry.
    pub fn read_block(&self, locator: &BlockLocator, observed_leader: &NodeId) -> Result<Bytes> {
        debug_assert_eq!(locator.container, self.container);

        match self.store.lock().unwrap().read_block(locator.block) {
            Ok(data) => {
                METRICS.block_reads_total.inc();
                METRICS.bytes_read_total.add(data.len() as u64);
                Ok(data)
            }
            Err(e) => {
                METRICS.block_read_failures_total.inc();
                if observed_leader == &self.node {
                    tracing::error!(
                        container = self.container,
                        block = locator.block,
                        "read failure on acting leader: {}",
                        e
                    );
                    emit(
                        &self.health,
                        HealthEvent::new(
                            self.node.clone(),
                            self.pipeline,
                            HealthEventKind::ReadFailure {
                                container: self.container,
                            },
                            Some(self.node.clone()),
                        ),
                    );
                } else {
                    tracing::warn!(
                        container = self.container,
                        block = locator.block,
                        "read failure on follower: {}",
                        e
                    );
                }
                Err(e)
            }
        }
    }
}
