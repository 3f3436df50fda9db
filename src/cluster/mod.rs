//! Cluster Module
//!
//! Node registry and the discovery-driven cluster manager.

mod manager;
mod registry;

pub use manager::ClusterManager;
pub use registry::{ClusterState, NodeRegistry};
