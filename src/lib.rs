//! WolfGalera - Cluster-aware connection router for Galera clusters
//!
//! Presents a multi-master Galera (MariaDB/MySQL) cluster as a single
//! connection source. Cluster membership and health are tracked by
//! periodically probing each node's `wsrep_%` status, connections are
//! routed to live members through a pluggable selection policy, and an
//! optional per-connection consistency level is enforced on the session.
//!
//! # Architecture
//!
//! A `ClusterManager` owns a registry of `Node`s split into an active and
//! a downed set. A background discovery cycle probes every node, follows
//! the member lists they report, and is the only thing that moves nodes
//! between sets. Connection requests only read the active set.
//!
//! # Features
//!
//! - Seed-based discovery of the full cluster membership
//! - Donor/Desynced handling configurable per router
//! - Round-robin and master-affinity node selection
//! - `wsrep_sync_wait` / `wsrep_causal_reads` enforcement per connection
//! - Per-node pool gauges reported through a listener

pub mod cluster;
pub mod config;
pub mod consistency;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod node;
pub mod policy;
pub mod pool;
pub mod status;

pub use config::RouterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterManager, ClusterState};
    pub use crate::config::RouterConfig;
    pub use crate::consistency::{ConsistencyLevel, ConsistentConnection};
    pub use crate::error::{Error, Result};
    pub use crate::listener::{ClusterListener, LoggingListener};
    pub use crate::policy::{MasterSortingPolicy, PolicyKind, RoundRobinPolicy, SelectionPolicy};
    pub use crate::pool::{Connection, NodePool, PoolProvider};
    pub use crate::status::StatusSnapshot;
}
