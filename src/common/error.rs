//! Error types for carton

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How an error propagates through the system.
///
/// `Transient` errors are retried locally and never change lifecycle
/// state. `Degraded` conditions are recorded on the pipeline but do not
/// interrupt service. `FatalGroup` errors always produce a lifecycle
/// transition. `Terminal` errors mean the pipeline is already gone and
/// the caller must reroute, never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Transient,
    Degraded,
    FatalGroup,
    Terminal,
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Container Errors ===
    #[error("Container {0} not found")]
    ContainerNotFound(u64),

    #[error("Block {block} not found in container {container}")]
    BlockNotFound { container: u64, block: u64 },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Apply failed for container {container} at index {index}: {reason}")]
    ApplyFailed {
        container: u64,
        index: u64,
        reason: String,
    },

    #[error("Read failed for container {container}: {reason}")]
    ReadFailed { container: u64, reason: String },

    // === Replication Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Quorum unavailable: {committed} of {needed} members acknowledged")]
    QuorumUnavailable { committed: usize, needed: usize },

    #[error("Watch timed out waiting for index {index}")]
    WatchTimeout { index: u64 },

    #[error("Log entry {0} out of order")]
    OutOfOrder(u64),

    // === Pipeline Errors ===
    #[error("Pipeline {id} is {state}, no longer accepting traffic")]
    PipelineUnavailable { id: String, state: String },

    #[error("Pipeline {0} not found")]
    PipelineNotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Insufficient healthy nodes: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error for propagation policy.
    pub fn severity(&self) -> Severity {
        match self {
            Error::NotLeader(_)
            | Error::QuorumUnavailable { .. }
            | Error::ConnectionFailed(_)
            | Error::Timeout(_) => Severity::Transient,

            Error::WatchTimeout { .. } => Severity::Degraded,

            Error::ReadFailed { .. }
            | Error::ApplyFailed { .. }
            | Error::ChecksumMismatch { .. }
            | Error::Corrupted(_) => Severity::FatalGroup,

            Error::PipelineUnavailable { .. } | Error::PipelineNotFound(_) => Severity::Terminal,

            _ => Severity::Transient,
        }
    }

    /// Is this worth retrying against the same pipeline?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NotLeader(_)
                | Error::QuorumUnavailable { .. }
                | Error::Http(_)
        )
    }

    /// Does this error mean the pipeline is gone and the caller must
    /// request a new one?
    pub fn is_pipeline_fatal(&self) -> bool {
        matches!(
            self,
            Error::PipelineUnavailable { .. } | Error::PipelineNotFound(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::ContainerNotFound(_)
            | Error::BlockNotFound { .. }
            | Error::PipelineNotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) | Error::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Error::Timeout(_) | Error::WatchTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::PipelineUnavailable { .. }
            | Error::QuorumUnavailable { .. }
            | Error::InsufficientNodes { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::ChecksumMismatch { .. } | Error::Corrupted(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
