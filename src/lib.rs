//! # carton
//!
//! A distributed object store built from fixed-size replicated units
//! ("containers") written through per-unit consensus groups
//! ("pipelines"):
//! - Quorum-replicated writes through a per-pipeline log
//! - Per-node container state machines with idempotent replay
//! - A pipeline lifecycle manager that retires faulty groups without
//!   losing committed data
//! - A failure detector for stale nodes, slow followers and watch
//!   timeouts
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Cluster Manager              │
//! │  pipeline registry + lifecycle manager   │
//! │  failure detector + report ingestion     │
//! └───────────┬──────────────────────────────┘
//!             │ reports / commands (HTTP)
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌──▼───────────┐
//! │ Node 1     │   │ Node 2     │   │ Node 3       │
//! │ containers │   │ containers │   │ containers   │
//! │ + log      │   │ + log      │   │ + log        │
//! └────────────┘   └────────────┘   └──────────────┘
//!        └──────── pipeline (replication group) ────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the cluster manager
//! ```bash
//! carton-manager serve --bind 0.0.0.0:5000 --db ./manager-data
//! ```
//!
//! ### Start a storage node
//! ```bash
//! carton-node serve \
//!   --id node-1 \
//!   --bind 0.0.0.0:6000 \
//!   --data ./node-data \
//!   --manager http://localhost:5000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! carton put --file ./data.bin --manager http://localhost:5000
//! carton get --container 1 --block 1 --len 4096 --checksum <hex> --output ./out.bin
//! carton pipelines
//! carton status
//! ```

pub mod client;
pub mod common;
pub mod container;
pub mod detector;
pub mod manager;
pub mod node;
pub mod pipeline;
pub mod rlog;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use manager::ClusterManager;
pub use node::StorageNode;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
