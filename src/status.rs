//! Galera Status Snapshot
//!
//! Immutable, parsed view of one node's `wsrep_%` status and consistency
//! variables, produced by each discovery probe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consistency::ConsistencyVariable;
use crate::error::{Error, Result};

/// Replication status variables plus the connected-threads gauge
pub const QUERY_STATUS: &str =
    "SHOW STATUS WHERE variable_name LIKE 'wsrep_%' OR variable_name LIKE 'Threads_connected'";

/// Consistency control variables available on this server version
pub const QUERY_GLOBAL_VARIABLES: &str =
    "SHOW GLOBAL VARIABLES WHERE variable_name IN ('wsrep_sync_wait', 'wsrep_causal_reads')";

const CLUSTER_STATUS: &str = "wsrep_cluster_status";
const LOCAL_STATE_COMMENT: &str = "wsrep_local_state_comment";
const INCOMING_ADDRESSES: &str = "wsrep_incoming_addresses";
const THREADS_CONNECTED: &str = "threads_connected";

/// Membership of the node's cluster component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Primary,
    NonPrimary(String),
}

/// Local replication state (`wsrep_local_state_comment`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalState {
    Synced,
    DonorDesynced,
    Other(String),
}

impl LocalState {
    fn parse(comment: &str) -> Self {
        match comment {
            "Synced" => LocalState::Synced,
            "Donor/Desynced" => LocalState::DonorDesynced,
            other => LocalState::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalState::Synced => write!(f, "Synced"),
            LocalState::DonorDesynced => write!(f, "Donor/Desynced"),
            LocalState::Other(comment) => write!(f, "{}", comment),
        }
    }
}

/// Parsed status of one node at the time of a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Probed node address
    pub node: String,
    /// Primary component membership
    pub cluster_status: ClusterStatus,
    /// Local sync state
    pub local_state: LocalState,
    /// Cluster members as seen by this node
    pub incoming_addresses: Vec<String>,
    /// Consistency variable this node's version supports
    pub consistency: Option<ConsistencyVariable>,
    /// Client threads connected to the server
    pub threads_connected: Option<u32>,
    /// When the probe completed
    pub probed_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Build a snapshot from merged SHOW STATUS / SHOW GLOBAL VARIABLES rows.
    /// Variable names are matched case-insensitively.
    pub fn from_variables<I>(node: &str, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let variables: HashMap<String, String> = rows
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect();

        let malformed = |reason: String| Error::MalformedStatus {
            node: node.to_string(),
            reason,
        };
        let required = |name: &str| {
            variables
                .get(name)
                .map(|v| v.trim())
                .ok_or_else(|| malformed(format!("missing {}", name)))
        };

        let cluster_status = match required(CLUSTER_STATUS)? {
            "Primary" => ClusterStatus::Primary,
            other => ClusterStatus::NonPrimary(other.to_string()),
        };

        let local_state = LocalState::parse(required(LOCAL_STATE_COMMENT)?);

        let incoming_addresses = required(INCOMING_ADDRESSES)?
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();

        let consistency = if let Some(value) = variables.get(ConsistencyVariable::SYNC_WAIT) {
            let global = value.trim().parse().map_err(|_| {
                malformed(format!("{} is not numeric: {}", ConsistencyVariable::SYNC_WAIT, value))
            })?;
            Some(ConsistencyVariable::SyncWait { global })
        } else if let Some(value) = variables.get(ConsistencyVariable::CAUSAL_READS) {
            let global = match value.trim().to_uppercase().as_str() {
                "ON" | "1" | "TRUE" => true,
                "OFF" | "0" | "FALSE" => false,
                _ => {
                    return Err(malformed(format!(
                        "{} is not a boolean: {}",
                        ConsistencyVariable::CAUSAL_READS,
                        value
                    )))
                }
            };
            Some(ConsistencyVariable::CausalReads { global })
        } else {
            None
        };

        let threads_connected = variables
            .get(THREADS_CONNECTED)
            .and_then(|v| v.trim().parse().ok());

        Ok(Self {
            node: node.to_string(),
            cluster_status,
            local_state,
            incoming_addresses,
            consistency,
            threads_connected,
            probed_at: Utc::now(),
        })
    }

    /// A primary, synced snapshot, handy when no real server is around
    pub fn healthy(node: &str, peers: &[&str]) -> Self {
        Self {
            node: node.to_string(),
            cluster_status: ClusterStatus::Primary,
            local_state: LocalState::Synced,
            incoming_addresses: peers.iter().map(|p| p.to_string()).collect(),
            consistency: Some(ConsistencyVariable::SyncWait { global: 0 }),
            threads_connected: None,
            probed_at: Utc::now(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.cluster_status == ClusterStatus::Primary
    }

    pub fn is_synced(&self) -> bool {
        self.local_state == LocalState::Synced
    }

    pub fn is_donor(&self) -> bool {
        self.local_state == LocalState::DonorDesynced
    }

    /// `wsrep_local_state_comment` text
    pub fn state(&self) -> String {
        self.local_state.to_string()
    }

    pub fn supports_sync_wait(&self) -> bool {
        matches!(self.consistency, Some(ConsistencyVariable::SyncWait { .. }))
    }

    pub fn threads_connected(&self) -> Option<u32> {
        self.threads_connected
    }

    /// Whether this node lists `address` among the cluster members
    pub fn lists(&self, address: &str) -> bool {
        self.incoming_addresses.iter().any(|a| a == address)
    }

    /// Why this node must not serve connections, if anything.
    ///
    /// A Donor/Desynced node is only acceptable when `ignore_donor` is off.
    pub fn down_reason(&self, ignore_donor: bool) -> Option<String> {
        if !self.is_primary() {
            return Some("non Primary".to_string());
        }
        if !self.is_synced() && (ignore_donor || !self.is_donor()) {
            return Some(format!("state not ready: {}", self.state()));
        }
        None
    }
}
