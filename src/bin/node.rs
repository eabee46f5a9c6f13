//! Storage node binary

use carton::common::parse_duration;
use carton::detector::health_channel;
use carton::node::server::NodeServer;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "carton-node")]
#[command(about = "carton storage node: container replicas and reports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the storage node
    Serve {
        /// Node ID
        #[arg(long)]
        id: String,

        /// Bind address for HTTP
        #[arg(long, default_value = "0.0.0.0:6000")]
        bind: String,

        /// Data directory
        #[arg(long, default_value = "./node-data")]
        data: PathBuf,

        /// Manager base URL
        #[arg(long, default_value = "http://localhost:5000")]
        manager: String,

        /// Container report interval (e.g. "60s")
        #[arg(long)]
        container_report_interval: Option<String>,

        /// Pipeline report interval (e.g. "60s")
        #[arg(long)]
        pipeline_report_interval: Option<String>,
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
            id,
            bind,
            data,
            manager,
            container_report_interval,
            pipeline_report_interval,
        } => {
            let file = carton::common::config::Config::load();
            let mut config = file.node.unwrap_or_default();

            config.bind_addr = bind.parse()?;
            config.data_path = data;
            config.manager_url = manager;
            if let Some(s) = container_report_interval {
                config.container_report_interval_ms = parse_duration(&s)?.as_millis() as u64;
            }
            if let Some(s) = pipeline_report_interval {
                config.pipeline_report_interval_ms = parse_duration(&s)?.as_millis() as u64;
            }

            // Health events produced on this node are observed locally;
            // the manager-side detector works from reports
            let (health, mut local_events) = health_channel();
            tokio::spawn(async move {
                while let Some(ev) = local_events.recv().await {
                    tracing::warn!(
                        pipeline = %ev.pipeline,
                        kind = ?ev.kind,
                        "local health event"
                    );
                }
            });

            NodeServer::new(config, id).serve(health).await?;
        }
    }

    Ok(())
}
