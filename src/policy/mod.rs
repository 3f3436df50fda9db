//! Node Selection Policies
//!
//! Pure strategies mapping the current active-node list to the node that
//! should serve a connection request. Policies never read the registry,
//! so they can be swapped per call without coordinating with discovery.

mod master_sorting;
mod round_robin;

pub use master_sorting::MasterSortingPolicy;
pub use round_robin::RoundRobinPolicy;

use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Chooses one node out of the active set
pub trait SelectionPolicy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Pick a node from `active_nodes`. Must fail with
    /// `Error::NoHostAvailable` on an empty list.
    fn choose_node(&self, active_nodes: &[String]) -> Result<String>;
}

/// Policy selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    RoundRobin,
    MasterSorting,
}

impl PolicyKind {
    /// Instantiate the policy
    pub fn build(&self) -> Arc<dyn SelectionPolicy> {
        match self {
            PolicyKind::RoundRobin => Arc::new(RoundRobinPolicy::new()),
            PolicyKind::MasterSorting => Arc::new(MasterSortingPolicy),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(PolicyKind::RoundRobin),
            "master_sorting" => Ok(PolicyKind::MasterSorting),
            other => Err(crate::Error::Config(format!("unknown selection policy '{}'", other))),
        }
    }
}
