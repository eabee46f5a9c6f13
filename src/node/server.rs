//! Storage node server

use crate::common::{ClientConfig, NodeConfig, Result};
use crate::detector::HealthSender;
use crate::node::http::{create_router, NodeHttpState};
use crate::node::reports::{spawn_report_loops, HttpReportSink};
use crate::node::StorageNode;
use serde_json::json;
use std::sync::Arc;

pub struct NodeServer {
    config: NodeConfig,
    node_id: String,
}

impl NodeServer {
    pub fn new(config: NodeConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    pub async fn serve(self, health: HealthSender) -> Result<()> {
        tracing::info!("Starting storage node: {}", self.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Data path: {}", self.config.data_path.display());
        tracing::info!("  Manager: {}", self.config.manager_url);

        let node = Arc::new(StorageNode::new(
            self.node_id.clone(),
            self.config.data_path.clone(),
            health,
        ));

        // Register with the manager so placement can see this node
        let http = reqwest::Client::new();
        let register = http
            .post(format!("{}/v1/nodes", self.config.manager_url))
            .json(&json!({
                "node_id": self.node_id,
                "address": format!("http://{}", self.config.bind_addr),
            }))
            .send()
            .await;
        match register {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("registered with manager");
            }
            Ok(resp) => {
                tracing::warn!("manager rejected registration: {}", resp.status());
            }
            Err(e) => {
                tracing::warn!("manager unreachable at startup: {}", e);
            }
        }

        // Independent report loops
        let sink = HttpReportSink::new(self.config.manager_url.clone());
        let _report_handles = spawn_report_loops(node.clone(), sink, &self.config);

        let state = NodeHttpState {
            node,
            watch_timeout: ClientConfig::default().watch_timeout(),
        };
        let router = create_router(state);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Storage node ready");
        axum::serve(listener, router)
            .await
            .map_err(|e| crate::Error::Http(e.to_string()))?;

        Ok(())
    }
}
