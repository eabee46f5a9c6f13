//! HTTP API for the cluster manager
//!
//! Pipelines, node registration, block allocation, and the three report
//! ingestion endpoints. Report responses carry outstanding commands for
//! the reporting node.

use crate::manager::ClusterManager;
use crate::node::reports::{CommandStatusReport, ContainerReport, PipelineReport};
use crate::pipeline::PipelineId;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(manager: Arc<ClusterManager>) -> Router {
    Router::new()
        .route("/v1/nodes", post(register_node).get(list_nodes))
        .route("/v1/pipelines", post(create_pipeline).get(list_pipelines))
        .route("/v1/pipelines/:id", get(get_pipeline))
        .route("/v1/pipelines/:id/close", post(close_pipeline))
        .route("/v1/containers/:id", get(get_container))
        .route("/v1/blocks/allocate", post(allocate_block))
        .route("/v1/reports/containers", post(report_containers))
        .route("/v1/reports/pipelines", post(report_pipelines))
        .route("/v1/reports/command-status", post(report_command_status))
        .route("/v1/status", get(cluster_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

fn error_response(e: crate::Error) -> Response {
    let status = e.to_http_status();
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    node_id: String,
    address: String,
}

async fn register_node(
    State(manager): State<Arc<ClusterManager>>,
    Json(req): Json<RegisterNodeRequest>,
) -> Response {
    match manager.register_node(&req.node_id, &req.address) {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "status": "registered" }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_nodes(State(manager): State<Arc<ClusterManager>>) -> Response {
    match manager.nodes() {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreatePipelineRequest {
    factor: Option<usize>,
}

async fn create_pipeline(
    State(manager): State<Arc<ClusterManager>>,
    body: Option<Json<CreatePipelineRequest>>,
) -> Response {
    let factor = body.and_then(|Json(b)| b.factor);
    match manager.create_pipeline(factor) {
        Ok(pipeline) => (StatusCode::CREATED, Json(pipeline)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_pipelines(State(manager): State<Arc<ClusterManager>>) -> Response {
    Json(manager.pipelines()).into_response()
}

async fn get_pipeline(
    State(manager): State<Arc<ClusterManager>>,
    Path(id): Path<String>,
) -> Response {
    let id: PipelineId = match id.parse() {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match manager.pipeline(id) {
        Some(pipeline) => Json(pipeline).into_response(),
        // Destroyed pipelines vanish; callers treat this as closed
        None => error_response(crate::Error::PipelineNotFound(id.to_string())),
    }
}

async fn close_pipeline(
    State(manager): State<Arc<ClusterManager>>,
    Path(id): Path<String>,
) -> Response {
    let id: PipelineId = match id.parse() {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match manager.close_pipeline(id) {
        Ok(()) => Json(json!({ "status": "closing" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_container(
    State(manager): State<Arc<ClusterManager>>,
    Path(id): Path<u64>,
) -> Response {
    match manager.container(id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(crate::Error::ContainerNotFound(id)),
        Err(e) => error_response(e),
    }
}

async fn allocate_block(State(manager): State<Arc<ClusterManager>>) -> Response {
    match manager.allocate_block() {
        Ok(allocated) => Json(allocated).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReportParams {
    node: String,
}

async fn report_containers(
    State(manager): State<Arc<ClusterManager>>,
    Query(params): Query<ReportParams>,
    Json(reports): Json<Vec<ContainerReport>>,
) -> Response {
    Json(manager.handle_container_reports(&params.node, reports)).into_response()
}

async fn report_pipelines(
    State(manager): State<Arc<ClusterManager>>,
    Query(params): Query<ReportParams>,
    Json(reports): Json<Vec<PipelineReport>>,
) -> Response {
    Json(manager.handle_pipeline_reports(&params.node, reports)).into_response()
}

async fn report_command_status(
    State(manager): State<Arc<ClusterManager>>,
    Query(params): Query<ReportParams>,
    Json(report): Json<CommandStatusReport>,
) -> Response {
    Json(manager.handle_command_status(&params.node, report)).into_response()
}

async fn cluster_status(State(manager): State<Arc<ClusterManager>>) -> Response {
    let pipelines = manager.pipelines();
    let nodes = manager.nodes().unwrap_or_default();
    Json(json!({
        "nodes": nodes.len(),
        "pipelines": pipelines.len(),
        "open_pipelines": pipelines.iter().filter(|p| p.state.accepts_writes()).count(),
    }))
    .into_response()
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn metrics() -> Response {
    crate::common::METRICS.to_prometheus().into_response()
}
