//! Node registry
//!
//! Every registered node lives in exactly one of the active or downed
//! sets. All mutations happen under one short write lock that is never
//! held across I/O, so readers see either the state before or after a
//! transition.

use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::node::Node;

/// Point-in-time view of the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Nodes eligible for routing, in activation order
    pub active: Vec<String>,
    /// Registered nodes waiting to be re-probed
    pub downed: Vec<String>,
}

impl ClusterState {
    /// Every registered identity
    pub fn registered(&self) -> Vec<String> {
        self.active.iter().chain(self.downed.iter()).cloned().collect()
    }
}

#[derive(Default)]
struct Members {
    nodes: HashMap<String, Arc<Node>>,
    active: Vec<String>,
    downed: Vec<String>,
}

/// Registered nodes and their active/downed membership
#[derive(Default)]
pub struct NodeRegistry {
    members: RwLock<Members>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the downed set. Returns false if the identity is
    /// already registered, in which case the existing entry is kept.
    pub async fn register(&self, node: Arc<Node>) -> bool {
        let mut members = self.members.write().await;
        let address = node.address().to_string();
        if members.nodes.contains_key(&address) {
            return false;
        }
        members.nodes.insert(address.clone(), node);
        members.downed.push(address);
        true
    }

    /// Move a registered node to the active set. Returns false when the
    /// node is unknown or already active.
    pub async fn mark_active(&self, address: &str) -> bool {
        let mut members = self.members.write().await;
        if !members.nodes.contains_key(address) || members.active.iter().any(|a| a == address) {
            return false;
        }
        members.downed.retain(|a| a != address);
        members.active.push(address.to_string());
        true
    }

    /// Move a registered node to the downed set. Returns true only when
    /// the node was active.
    pub async fn mark_down(&self, address: &str) -> bool {
        let mut members = self.members.write().await;
        let before = members.active.len();
        members.active.retain(|a| a != address);
        if members.active.len() == before {
            return false;
        }
        members.downed.push(address.to_string());
        true
    }

    /// Drop a node from the registry and both sets
    pub async fn remove(&self, address: &str) -> Option<Arc<Node>> {
        let mut members = self.members.write().await;
        let node = members.nodes.remove(address)?;
        members.active.retain(|a| a != address);
        members.downed.retain(|a| a != address);
        Some(node)
    }

    /// Remove every node, for shutdown
    pub async fn drain(&self) -> Vec<Arc<Node>> {
        let mut members = self.members.write().await;
        members.active.clear();
        members.downed.clear();
        members.nodes.drain().map(|(_, node)| node).collect()
    }

    pub async fn get(&self, address: &str) -> Option<Arc<Node>> {
        self.members.read().await.nodes.get(address).cloned()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.members.read().await.nodes.contains_key(address)
    }

    pub async fn is_active(&self, address: &str) -> bool {
        self.members.read().await.active.iter().any(|a| a == address)
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.nodes.is_empty()
    }

    pub async fn active_nodes(&self) -> Vec<String> {
        self.members.read().await.active.clone()
    }

    pub async fn downed_nodes(&self) -> Vec<String> {
        self.members.read().await.downed.clone()
    }

    /// Registered identities, active first
    pub async fn addresses(&self) -> Vec<String> {
        self.state().await.registered()
    }

    pub async fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.members.read().await.nodes.values().cloned().collect()
    }

    pub async fn state(&self) -> ClusterState {
        let members = self.members.read().await;
        ClusterState {
            active: members.active.clone(),
            downed: members.downed.clone(),
        }
    }

    /// Panic unless every registered node is in exactly one set and both
    /// sets only hold registered nodes
    #[cfg(test)]
    pub(crate) async fn assert_consistent(&self) {
        let members = self.members.read().await;
        for address in members.active.iter().chain(members.downed.iter()) {
            assert!(members.nodes.contains_key(address), "{} is not registered", address);
        }
        for address in members.nodes.keys() {
            let active = members.active.iter().filter(|a| *a == address).count();
            let downed = members.downed.iter().filter(|a| *a == address).count();
            assert_eq!(active + downed, 1, "{} is in {} sets", address, active + downed);
        }
    }
}
