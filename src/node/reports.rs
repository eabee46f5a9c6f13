//! Node report loops
//!
//! Three independent periodic tasks per node — container reports,
//! pipeline reports, command-status reports — each on its own
//! configurable interval, all off the read/write hot path. Report
//! responses piggyback outstanding manager commands back to the node.

use crate::common::NodeConfig;
use crate::container::{ContainerId, ContainerLocalState};
use crate::pipeline::manager::PipelineCommand;
use crate::pipeline::{PipelineId, PipelineState};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::StorageNode;

/// Container report: {container id, local state, used bytes}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerReport {
    pub container: ContainerId,
    pub state: ContainerLocalState,
    pub used_bytes: u64,
}

/// Pipeline report: {pipeline id, locally perceived state}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: PipelineId,
    pub state: PipelineState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatus {
    pub command_id: Uuid,
    pub status: CommandState,
}

/// Command-status report: completion state of manager commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusReport {
    pub statuses: Vec<CommandStatus>,
}

/// Where reports go. The manager implements this in-process; the node
/// binary uses an HTTP implementation against the manager API.
pub trait ReportSink: Send + Sync {
    fn container_reports(
        &self,
        node: &str,
        reports: Vec<ContainerReport>,
    ) -> impl std::future::Future<Output = Result<Vec<PipelineCommand>>> + Send;

    fn pipeline_reports(
        &self,
        node: &str,
        reports: Vec<PipelineReport>,
    ) -> impl std::future::Future<Output = Result<Vec<PipelineCommand>>> + Send;

    fn command_status(
        &self,
        node: &str,
        report: CommandStatusReport,
    ) -> impl std::future::Future<Output = Result<Vec<PipelineCommand>>> + Send;
}

/// HTTP report sink against the manager API
#[derive(Clone)]
pub struct HttpReportSink {
    http: reqwest::Client,
    base_url: String,
}

impl HttpReportSink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn post<B: Serialize>(&self, path: &str, node: &str, body: &B) -> Result<Vec<PipelineCommand>> {
        let url = format!("{}/v1/reports/{}?node={}", self.base_url, path, node);
        let resp = self.http.post(&url).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(crate::Error::Http(format!(
                "report rejected: {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

impl ReportSink for HttpReportSink {
    async fn container_reports(
        &self,
        node: &str,
        reports: Vec<ContainerReport>,
    ) -> Result<Vec<PipelineCommand>> {
        self.post("containers", node, &reports).await
    }

    async fn pipeline_reports(
        &self,
        node: &str,
        reports: Vec<PipelineReport>,
    ) -> Result<Vec<PipelineCommand>> {
        self.post("pipelines", node, &reports).await
    }

    async fn command_status(
        &self,
        node: &str,
        report: CommandStatusReport,
    ) -> Result<Vec<PipelineCommand>> {
        self.post("command-status", node, &report).await
    }
}

/// Spawn the three report loops. Failures are logged and retried on the
/// next tick; a missed report is exactly what the stale-node detector is
/// for.
pub fn spawn_report_loops<S>(
    node: Arc<StorageNode>,
    sink: S,
    cfg: &NodeConfig,
) -> Vec<tokio::task::JoinHandle<()>>
where
    S: ReportSink + Clone + 'static,
{
    let mut handles = Vec::new();

    {
        let node = node.clone();
        let sink = sink.clone();
        let interval = cfg.container_report_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reports = node.container_reports();
                match sink.container_reports(node.id(), reports).await {
                    Ok(commands) => node.execute_commands(commands),
                    Err(e) => tracing::warn!("container report failed: {}", e),
                }
            }
        }));
    }

    {
        let node = node.clone();
        let sink = sink.clone();
        let interval = cfg.pipeline_report_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reports = node.pipeline_reports();
                match sink.pipeline_reports(node.id(), reports).await {
                    Ok(commands) => node.execute_commands(commands),
                    Err(e) => tracing::warn!("pipeline report failed: {}", e),
                }
            }
        }));
    }

    {
        let interval = cfg.command_status_report_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = node.command_status_report();
                if report.statuses.is_empty() {
                    continue;
                }
                match sink.command_status(node.id(), report).await {
                    Ok(commands) => node.execute_commands(commands),
                    Err(e) => tracing::warn!("command-status report failed: {}", e),
                }
            }
        }));
    }

    handles
}
