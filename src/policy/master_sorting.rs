//! Master-affinity selection
//!
//! Every router picks the lexicographically smallest active node, so all
//! writers agree on one "master" without an election. The designated node
//! changes whenever the smallest identity goes up or down.

use crate::error::{Error, Result};
use super::SelectionPolicy;

#[derive(Debug, Clone, Copy, Default)]
pub struct MasterSortingPolicy;

impl SelectionPolicy for MasterSortingPolicy {
    fn name(&self) -> &str {
        "MasterSorting"
    }

    fn choose_node(&self, active_nodes: &[String]) -> Result<String> {
        let master = active_nodes
            .iter()
            .min()
            .cloned()
            .ok_or(Error::NoHostAvailable { active_nodes: Vec::new() })?;

        tracing::debug!("Master node selected {}", master);
        Ok(master)
    }
}
