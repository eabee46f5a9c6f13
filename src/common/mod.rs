//! Common utilities and types shared across carton

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{ClientConfig, Config, DetectorConfig, ManagerConfig, NodeConfig, NodeRole};
pub use error::{Error, Result, Severity};
pub use hash::{blake3_hash, hrw_hash, select_members, Blake3Hasher};
pub use metrics::METRICS;
pub use utils::{crc32, format_bytes, parse_duration, timestamp_now, timestamp_now_millis, NodeState};
