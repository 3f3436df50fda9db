//! Round-robin selection

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::error::{Error, Result};
use super::SelectionPolicy;

/// Counter is reset once it passes this value
const COUNTER_WRAP: usize = 1_000_000;

/// Upper bound (exclusive) of the randomized starting offset
const RANDOM_START_BOUND: usize = 997;

/// Cycles through the active nodes in list order
#[derive(Debug)]
pub struct RoundRobinPolicy {
    /// Next index to hand out
    next: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Start at a random offset so independent routers spread their load
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(0..RANDOM_START_BOUND))
    }

    /// Start at a fixed offset
    pub fn starting_at(start: usize) -> Self {
        Self {
            next: AtomicUsize::new(start),
        }
    }

    fn next_index(&self) -> usize {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        if index > COUNTER_WRAP {
            self.next.store(0, Ordering::Relaxed);
        }
        index
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RoundRobinPolicy {
    fn name(&self) -> &str {
        "RoundRobin"
    }

    fn choose_node(&self, active_nodes: &[String]) -> Result<String> {
        if active_nodes.is_empty() {
            tracing::error!("NoHostAvailable - active node count is zero");
            return Err(Error::NoHostAvailable { active_nodes: Vec::new() });
        }

        let selected = &active_nodes[self.next_index() % active_nodes.len()];
        tracing::debug!("Selected round-robin node {}", selected);
        Ok(selected.clone())
    }
}
