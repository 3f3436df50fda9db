//! WolfGalera Error Types

use thiserror::Error;

/// Result type alias for WolfGalera operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfGalera error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Selection errors
    #[error("No active galera node available")]
    NoActiveNode,

    #[error("None of the following active hosts is available: {}", active_nodes.join(","))]
    NoHostAvailable { active_nodes: Vec<String> },

    // Discovery errors
    #[error("Status probe failed on {node}: {reason}")]
    ProbeFailure { node: String, reason: String },

    #[error("Malformed wsrep status from {node}: {reason}")]
    MalformedStatus { node: String, reason: String },

    #[error("Discovery cycle failed: {0}")]
    DiscoveryCycleFailure(String),

    // Connection errors
    #[error("Could not acquire connection from {node}: {source}")]
    ConnectionAcquisition {
        node: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Node {0} has no active pool")]
    NodeNotActive(String),

    #[error("Node {0} exposes neither wsrep_sync_wait nor wsrep_causal_reads")]
    ConsistencyUnsupported(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoActiveNode
                | Error::NoHostAvailable { .. }
                | Error::ConnectionAcquisition { .. }
                | Error::NodeNotActive(_)
        )
    }

    /// Check if this error suggests the cluster topology changed under us,
    /// in which case an out-of-band discovery cycle is worth running
    pub fn is_topology_signal(&self) -> bool {
        !matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::ShuttingDown
        )
    }
}
