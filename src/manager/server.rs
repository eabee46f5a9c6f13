//! Cluster manager server

use crate::common::{ManagerConfig, Result};
use crate::manager::http::create_router;
use crate::manager::ClusterManager;

pub struct ManagerServer {
    config: ManagerConfig,
}

impl ManagerServer {
    pub fn new(config: ManagerConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting cluster manager");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!("  Replication factor: {}", self.config.replication_factor);
        tracing::info!(
            "  Stale-node interval: {:?}",
            self.config.detector.stale_node_interval()
        );

        let bind_addr = self.config.bind_addr;
        let (manager, events) = ClusterManager::new(self.config)?;
        let _background = manager.spawn_background(events);

        let router = create_router(manager);
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!("Cluster manager ready");
        axum::serve(listener, router)
            .await
            .map_err(|e| crate::Error::Http(e.to_string()))?;

        Ok(())
    }
}
