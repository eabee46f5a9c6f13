//! HTTP API for the storage node
//!
//! Chunk writes and block finalization land on the pipeline leader;
//! block reads are served from local, already-applied data.

use crate::container::{BlockLocator, ContainerOp};
use crate::pipeline::PipelineId;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::StorageNode;

const MAX_CHUNK_BODY: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct NodeHttpState {
    pub node: Arc<StorageNode>,
    pub watch_timeout: Duration,
}

pub fn create_router(state: NodeHttpState) -> Router {
    Router::new()
        .route(
            "/v1/pipelines/:pipeline/containers/:container/chunks",
            post(write_chunk),
        )
        .route(
            "/v1/pipelines/:pipeline/containers/:container/blocks/:block/finalize",
            post(finalize_block),
        )
        .route("/v1/containers/:container/blocks/:block", get(read_block))
        .route("/v1/containers", get(list_containers))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_CHUNK_BODY))
        .with_state(state)
}

fn error_response(e: crate::Error) -> Response {
    let status = e.to_http_status();
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct ChunkParams {
    block: u64,
    offset: u64,
    crc: u32,
}

async fn write_chunk(
    State(state): State<NodeHttpState>,
    Path((pipeline, container)): Path<(String, u64)>,
    Query(params): Query<ChunkParams>,
    body: Bytes,
) -> Response {
    let pipeline: PipelineId = match pipeline.parse() {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };

    let op = ContainerOp::WriteChunk {
        block: params.block,
        offset: params.offset,
        len: body.len() as u64,
        crc: params.crc,
        data: body,
    };

    match state
        .node
        .submit(pipeline, container, op, state.watch_timeout)
        .await
    {
        Ok(index) => (StatusCode::OK, Json(json!({ "index": index }))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    len: u64,
    checksum: String,
    chunk_count: u32,
}

async fn finalize_block(
    State(state): State<NodeHttpState>,
    Path((pipeline, container, block)): Path<(String, u64, u64)>,
    Json(req): Json<FinalizeRequest>,
) -> Response {
    let pipeline: PipelineId = match pipeline.parse() {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };

    let op = ContainerOp::FinalizeBlock {
        block,
        len: req.len,
        checksum: req.checksum.clone(),
        chunk_count: req.chunk_count,
    };

    match state
        .node
        .submit(pipeline, container, op, state.watch_timeout)
        .await
    {
        Ok(index) => (
            StatusCode::OK,
            Json(json!({
                "index": index,
                "locator": {
                    "container": container,
                    "block": block,
                    "len": req.len,
                    "checksum": req.checksum,
                }
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    len: u64,
    checksum: String,
}

async fn read_block(
    State(state): State<NodeHttpState>,
    Path((container, block)): Path<(u64, u64)>,
    Query(params): Query<ReadParams>,
) -> Response {
    let locator = BlockLocator {
        container,
        block,
        len: params.len,
        checksum: params.checksum,
    };
    match state.node.read_block(&locator) {
        Ok(data) => (StatusCode::OK, data).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_containers(State(state): State<NodeHttpState>) -> Response {
    Json(state.node.container_summaries()).into_response()
}

async fn health(State(state): State<NodeHttpState>) -> Response {
    Json(json!({ "status": "ok", "node": state.node.id() })).into_response()
}

async fn metrics() -> Response {
    crate::common::METRICS.to_prometheus().into_response()
}
