//! Configuration for carton components
//!
//! All timing knobs from the reporting and failure-detection surface live
//! here: shortening the report intervals speeds up detection at the cost
//! of network/CPU overhead. No knob changes behavior beyond timing.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Role (manager or storage node)
    pub role: NodeRole,

    /// Manager-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerConfig>,

    /// Storage-node-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Manager,
    Storage,
}

/// Cluster manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// RocksDB path for pipeline/container/node metadata
    pub db_path: PathBuf,

    /// Replication factor for new pipelines
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Failure detection knobs
    #[serde(default)]
    pub detector: DetectorConfig,

    /// How long a CLOSED pipeline may sit without read/report traffic
    /// before it is destroyed, and how long a DESTROYED record is kept
    /// before removal.
    #[serde(default = "default_pipeline_destroy_timeout_ms")]
    pub pipeline_destroy_timeout_ms: u64,
}

fn default_replication_factor() -> usize {
    3
}
fn default_pipeline_destroy_timeout_ms() -> u64 {
    300_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".parse().unwrap(),
            db_path: PathBuf::from("./manager-data"),
            replication_factor: default_replication_factor(),
            detector: DetectorConfig::default(),
            pipeline_destroy_timeout_ms: default_pipeline_destroy_timeout_ms(),
        }
    }
}

impl ManagerConfig {
    pub fn pipeline_destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_destroy_timeout_ms)
    }
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// A node with no report for this long is declared stale
    #[serde(default = "default_stale_node_interval_ms")]
    pub stale_node_interval_ms: u64,

    /// Maximum wait for a quorum watch before WATCH_TIMEOUT
    #[serde(default = "default_watch_timeout_ms")]
    pub watch_timeout_ms: u64,

    /// A follower lagging the leader's log for longer than this is slow
    #[serde(default = "default_follower_slowness_timeout_ms")]
    pub follower_slowness_timeout_ms: u64,

    /// How often the detector sweeps its timers
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_stale_node_interval_ms() -> u64 {
    90_000
}
fn default_watch_timeout_ms() -> u64 {
    10_000
}
fn default_follower_slowness_timeout_ms() -> u64 {
    60_000
}
fn default_check_interval_ms() -> u64 {
    1_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stale_node_interval_ms: default_stale_node_interval_ms(),
            watch_timeout_ms: default_watch_timeout_ms(),
            follower_slowness_timeout_ms: default_follower_slowness_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl DetectorConfig {
    pub fn stale_node_interval(&self) -> Duration {
        Duration::from_millis(self.stale_node_interval_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn follower_slowness_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_slowness_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Root directory for container data
    pub data_path: PathBuf,

    /// Manager base URL for reports and registration
    pub manager_url: String,

    /// Interval between container reports
    #[serde(default = "default_container_report_interval_ms")]
    pub container_report_interval_ms: u64,

    /// Interval between command-status reports
    #[serde(default = "default_command_status_report_interval_ms")]
    pub command_status_report_interval_ms: u64,

    /// Interval between pipeline reports
    #[serde(default = "default_pipeline_report_interval_ms")]
    pub pipeline_report_interval_ms: u64,
}

fn default_container_report_interval_ms() -> u64 {
    60_000
}
fn default_command_status_report_interval_ms() -> u64 {
    60_000
}
fn default_pipeline_report_interval_ms() -> u64 {
    60_000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6000".parse().unwrap(),
            data_path: PathBuf::from("./node-data"),
            manager_url: "http://localhost:5000".to_string(),
            container_report_interval_ms: default_container_report_interval_ms(),
            command_status_report_interval_ms: default_command_status_report_interval_ms(),
            pipeline_report_interval_ms: default_pipeline_report_interval_ms(),
        }
    }
}

impl NodeConfig {
    pub fn container_report_interval(&self) -> Duration {
        Duration::from_millis(self.container_report_interval_ms)
    }

    pub fn command_status_report_interval(&self) -> Duration {
        Duration::from_millis(self.command_status_report_interval_ms)
    }

    pub fn pipeline_report_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline_report_interval_ms)
    }
}

/// Client write-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum write attempts before the failure is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Per-request timeout against the replication primitive
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Per-watch timeout against the replication primitive
    #[serde(default = "default_client_watch_timeout_ms")]
    pub watch_timeout_ms: u64,

    /// Initial retry backoff; doubles per attempt with jitter
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Chunk size for the block output stream
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_max_retries() -> usize {
    5
}
fn default_request_timeout_ms() -> u64 {
    3_000
}
fn default_client_watch_timeout_ms() -> u64 {
    3_000
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_chunk_size() -> usize {
    4 * 1024 * 1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            watch_timeout_ms: default_client_watch_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Config {
    /// Load configuration from `carton.toml` and `CARTON_*` environment
    /// variables. Missing file is fine; CLI flags override afterwards.
    pub fn load() -> Self {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("carton").required(false))
            .add_source(config::Environment::with_prefix("CARTON").separator("__"));

        match builder.build() {
            Ok(settings) => settings.try_deserialize().unwrap_or_else(|e| {
                tracing::warn!("Invalid config file, using defaults: {}", e);
                Self::default_storage()
            }),
            Err(e) => {
                tracing::debug!("No config file loaded: {}", e);
                Self::default_storage()
            }
        }
    }

    fn default_storage() -> Self {
        Self {
            node_id: String::new(),
            role: NodeRole::Storage,
            manager: None,
            node: None,
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_defaults() {
        let d = DetectorConfig::default();
        assert_eq!(d.stale_node_interval(), Duration::from_secs(90));
        assert_eq!(d.watch_timeout(), Duration::from_secs(10));
        assert!(d.check_interval() < d.watch_timeout());
    }

    #[test]
    fn test_client_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.chunk_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_manager_config_roundtrip() {
        let m = ManagerConfig::default();
        let json = serde_json::to_string(&m).unwrap();
        let back: ManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.replication_factor, m.replication_factor);
        assert_eq!(
            back.pipeline_destroy_timeout_ms,
            m.pipeline_destroy_timeout_ms
        );
    }
}
