//! Cluster manager binary

use carton::common::parse_duration;
use carton::manager::server::ManagerServer;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "carton-manager")]
#[command(about = "carton cluster manager: pipelines, lifecycle, failure detection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cluster manager
    Serve {
        /// Bind address for HTTP
        #[arg(long, default_value = "0.0.0.0:5000")]
        bind: String,

        /// Database directory
        #[arg(long, default_value = "./manager-data")]
        db: PathBuf,

        /// Replication factor for new pipelines
        #[arg(long, default_value = "3")]
        factor: usize,

        /// Stale-node interval (e.g. "90s")
        #[arg(long)]
        stale_interval: Option<String>,

        /// Pipeline destroy timeout (e.g. "5m")
        #[arg(long)]
        destroy_timeout: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            db,
            factor,
            stale_interval,
            destroy_timeout,
        } => {
            // File config first, CLI flags win
            let file = carton::common::config::Config::load();
            let mut config = file.manager.unwrap_or_default();

            config.bind_addr = bind.parse()?;
            config.db_path = db;
            config.replication_factor = factor;
            if let Some(s) = stale_interval {
                config.detector.stale_node_interval_ms = parse_duration(&s)?.as_millis() as u64;
            }
            if let Some(s) = destroy_timeout {
                config.pipeline_destroy_timeout_ms = parse_duration(&s)?.as_millis() as u64;
            }

            ManagerServer::new(config).serve().await?;
        }
    }

    Ok(())
}
