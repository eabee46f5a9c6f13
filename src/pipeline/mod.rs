//! Pipelines: fixed-membership consensus groups that own containers
//!
//! A pipeline is created by placement, owns the containers assigned to
//! it, and moves through OPEN -> CLOSING -> CLOSED -> DESTROYED. All
//! state mutation funnels through the registry's compare-and-set
//! transition; the lifecycle manager decides which transitions happen.

pub mod manager;
pub mod registry;
pub mod state;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use manager::PipelineManager;
pub use registry::{PipelineRegistry, PipelineStore, Transition};
pub use state::{Pipeline, PipelineState};

/// Node identifier (unique per storage node)
pub type NodeId = String;

/// Pipeline identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PipelineId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| crate::Error::PipelineNotFound(s.to_string()))
    }
}
