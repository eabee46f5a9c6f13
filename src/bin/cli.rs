//! carton CLI

use carton::client::{read_block, BlockOutputStream, HttpClusterClient};
use carton::common::{format_bytes, ClientConfig};
use carton::container::BlockLocator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "carton")]
#[command(about = "carton client: put/get blocks, inspect pipelines")]
struct Cli {
    /// Manager base URL
    #[arg(long, global = true, default_value = "http://localhost:5000")]
    manager: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a file as one block
    Put {
        /// Input file
        #[arg(long)]
        file: PathBuf,

        /// Maximum write attempts
        #[arg(long, default_value = "5")]
        max_retries: usize,
    },
    /// Read a block back
    Get {
        #[arg(long)]
        container: u64,

        #[arg(long)]
        block: u64,

        #[arg(long)]
        len: u64,

        #[arg(long)]
        checksum: String,

        /// Output file
        #[arg(long)]
        output: PathBuf,
    },
    /// List pipelines and their lifecycle states
    Pipelines,
    /// Cluster status summary
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Put { file, max_retries } => {
            let data = tokio::fs::read(&file).await?;
            let cfg = ClientConfig {
                max_retries,
                ..ClientConfig::default()
            };
            let client = HttpClusterClient::new(&cli.manager, &cfg)?;

            let mut stream = BlockOutputStream::open(&client, cfg).await?;
            stream.write(&data).await?;
            let locators = stream.close().await?;

            for locator in locators {
                println!(
                    "committed: container={} block={} len={} checksum={}",
                    locator.container,
                    locator.block,
                    format_bytes(locator.len),
                    locator.checksum
                );
            }
        }
        Commands::Get {
            container,
            block,
            len,
            checksum,
            output,
        } => {
            let cfg = ClientConfig::default();
            let client = HttpClusterClient::new(&cli.manager, &cfg)?;
            let locator = BlockLocator {
                container,
                block,
                len,
                checksum,
            };
            let data = read_block(&client, &locator).await?;
            tokio::fs::write(&output, &data).await?;
            println!("read {} to {}", format_bytes(data.len() as u64), output.display());
        }
        Commands::Pipelines => {
            let resp = reqwest::get(format!("{}/v1/pipelines", cli.manager)).await?;
            let pipelines: Vec<carton::pipeline::Pipeline> = resp.json().await?;
            for p in pipelines {
                println!(
                    "{}  state={}  leader={}  members={:?}{}",
                    p.id,
                    p.state,
                    p.leader,
                    p.members,
                    if p.degraded { "  [degraded]" } else { "" }
                );
            }
        }
        Commands::Status => {
            let resp = reqwest::get(format!("{}/v1/status", cli.manager)).await?;
            let status: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
