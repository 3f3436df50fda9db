//! Pool Module
//!
//! The narrow capability set the router needs from a connection pool:
//! create a pool for a node, borrow connections from it, close it and
//! read its gauges. `MySqlPoolProvider` implements it on top of sqlx.

mod mysql;
#[cfg(test)]
pub(crate) mod mock;

pub use mysql::{MySqlPoolProvider, MySqlNodePool, MySqlPooledConnection};

use std::sync::Arc;
use async_trait::async_trait;

use crate::config::{DatabaseConfig, PoolSettings};
use crate::error::Result;
use crate::metrics::PoolMetrics;

/// Prefix marking the dedicated status probe pools
pub const STATUS_POOL_PREFIX: &str = "status-";

/// A connection borrowed from a node pool.
///
/// `close` hands the connection back to its pool; `discard` closes the
/// physical connection instead, for connections left in an unknown
/// session state.
#[async_trait]
pub trait Connection: Send {
    /// Address of the node this connection belongs to
    fn node(&self) -> &str;

    /// Execute a statement, returning the affected row count
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a query returning (name, value) rows, as SHOW STATUS does
    async fn fetch_pairs(&mut self, sql: &str) -> Result<Vec<(String, String)>>;

    /// Check the connection is still alive
    async fn ping(&mut self) -> Result<()>;

    /// Underlying sqlx connection, for running arbitrary queries
    fn as_mysql(&mut self) -> Option<&mut sqlx::MySqlConnection> {
        None
    }

    /// Return the connection to its pool
    async fn close(self: Box<Self>) -> Result<()>;

    /// Close the physical connection without returning it to the pool
    async fn discard(self: Box<Self>);

    /// Close the physical connection instead of pooling it if this value is
    /// dropped without `close` or `discard`
    fn close_on_drop(&mut self) {}
}

/// A pool of connections to a single node
#[async_trait]
pub trait NodePool: Send + Sync {
    /// Pool name, used in logs and metric reports
    fn name(&self) -> &str;

    /// Borrow a connection
    async fn acquire(&self) -> Result<Box<dyn Connection>>;

    /// Close every connection and refuse further borrows
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Current gauges
    fn metrics(&self) -> PoolMetrics;
}

/// Builds node pools. Construction must not perform network I/O;
/// connections are opened lazily on first borrow.
pub trait PoolProvider: Send + Sync {
    fn create_pool(
        &self,
        address: &str,
        name: &str,
        settings: &PoolSettings,
        database: &DatabaseConfig,
    ) -> Result<Arc<dyn NodePool>>;
}

/// Strip the `:port` suffix (and IPv6 brackets) from a node address
pub fn node_name_without_port(address: &str) -> &str {
    mysql::split_address(address)
        .map(|(host, _)| host)
        .unwrap_or(address)
}

/// Client pool name for a node
pub fn pool_name(prefix: &str, address: &str) -> String {
    format!("{}.{}", prefix, node_name_without_port(address))
}

/// Status probe pool name for a node
pub fn status_pool_name(prefix: &str, address: &str) -> String {
    format!("{}{}", STATUS_POOL_PREFIX, pool_name(prefix, address))
}
