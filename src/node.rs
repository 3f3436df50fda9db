//! Galera Node
//!
//! One physical cluster member: its client pool lifecycle, its dedicated
//! status-probe pool and the last status snapshot it reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{DatabaseConfig, PoolSettings, RouterConfig};
use crate::consistency::{ConsistencyLevel, ConsistentConnection};
use crate::error::{Error, Result};
use crate::metrics::PoolMetrics;
use crate::pool::{self, Connection, NodePool, PoolProvider};
use crate::status::{StatusSnapshot, QUERY_GLOBAL_VARIABLES, QUERY_STATUS};

/// Everything a node needs to build its pools, shared by all nodes of a cluster
pub struct NodeContext {
    /// Builds client and status pools
    pub provider: Arc<dyn PoolProvider>,
    /// Credentials and default schema
    pub database: DatabaseConfig,
    /// Client pool tuning
    pub pool: PoolSettings,
    /// Status probe pool tuning
    pub status_pool: PoolSettings,
    /// Level applied to plain connections, if any
    pub default_consistency: Option<ConsistencyLevel>,
}

impl NodeContext {
    pub fn from_config(config: &RouterConfig, provider: Arc<dyn PoolProvider>) -> Self {
        Self {
            provider,
            database: config.database.clone(),
            pool: config.pool.clone(),
            status_pool: config.status_pool.clone(),
            default_consistency: config.cluster.consistency_level,
        }
    }
}

/// A cluster member and its pools
pub struct Node {
    /// Node identity (`host:port`)
    address: String,
    context: Arc<NodeContext>,
    /// Dedicated pool for status probes, alive for the node's whole life
    status_pool: Arc<dyn NodePool>,
    /// Client pool, present while the node is active
    pool: RwLock<Option<Arc<dyn NodePool>>>,
    /// Last probed status
    status: RwLock<Option<Arc<StatusSnapshot>>>,
    /// Set once the node has been shut down
    shut_down: AtomicBool,
}

impl Node {
    /// Create a node. Only the status pool is built, and lazily.
    pub fn new(address: &str, context: Arc<NodeContext>) -> Result<Self> {
        let status_pool = context.provider.create_pool(
            address,
            &pool::status_pool_name(&context.pool.name, address),
            &context.status_pool,
            &context.database,
        )?;

        Ok(Self {
            address: address.to_string(),
            context,
            status_pool,
            pool: RwLock::new(None),
            status: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Build and install a fresh client pool, closing any previous one
    pub async fn activate(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let pool = self.context.provider.create_pool(
            &self.address,
            &pool::pool_name(&self.context.pool.name, &self.address),
            &self.context.pool,
            &self.context.database,
        )?;

        let mut slot = self.pool.write().await;
        // Shutdown may have drained the slot while the pool was being built
        if self.shut_down.load(Ordering::SeqCst) {
            drop(slot);
            pool.close().await;
            return Err(Error::ShuttingDown);
        }
        let previous = slot.replace(pool);
        drop(slot);

        if let Some(previous) = previous {
            tracing::debug!("Replacing pool {} on {}", previous.name(), self.address);
            previous.close().await;
        }
        Ok(())
    }

    /// Close and drop the client pool. No-op when there is none.
    pub async fn deactivate(&self) {
        let previous = self.pool.write().await.take();
        if let Some(pool) = previous {
            tracing::debug!("Closing pool {}", pool.name());
            pool.close().await;
        }
    }

    /// Deactivate, then close the status pool
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.deactivate().await;
        self.status_pool.close().await;
    }

    pub async fn is_active(&self) -> bool {
        self.pool
            .read()
            .await
            .as_ref()
            .map(|p| !p.is_closed())
            .unwrap_or(false)
    }

    /// Probe the node and replace the cached snapshot.
    ///
    /// Runs the status and global-variable queries on one status
    /// connection and merges their rows.
    pub async fn refresh_status(&self) -> Result<Arc<StatusSnapshot>> {
        let mut conn = self.status_pool.acquire().await?;

        let rows = match Self::query_status(conn.as_mut()).await {
            Ok(rows) => rows,
            Err(e) => {
                conn.discard().await;
                return Err(e);
            }
        };
        conn.close().await?;

        let snapshot = Arc::new(StatusSnapshot::from_variables(&self.address, rows)?);
        *self.status.write().await = Some(Arc::clone(&snapshot));
        tracing::trace!(
            "Refreshed status of {}: {:?} {}",
            self.address,
            snapshot.cluster_status,
            snapshot.local_state
        );
        Ok(snapshot)
    }

    async fn query_status(conn: &mut dyn Connection) -> Result<Vec<(String, String)>> {
        let mut rows = conn.fetch_pairs(QUERY_STATUS).await?;
        rows.extend(conn.fetch_pairs(QUERY_GLOBAL_VARIABLES).await?);
        Ok(rows)
    }

    /// Cached snapshot, probing the node first if it was never probed
    pub async fn status(&self) -> Result<Arc<StatusSnapshot>> {
        match self.cached_status().await {
            Some(status) => Ok(status),
            None => self.refresh_status().await,
        }
    }

    /// Last snapshot, without probing
    pub async fn cached_status(&self) -> Option<Arc<StatusSnapshot>> {
        self.status.read().await.clone()
    }

    /// Borrow a plain connection. The configured default consistency
    /// level, if any, is applied to the session; it is not reset on close.
    pub async fn get_connection(&self) -> Result<Box<dyn Connection>> {
        let pool = self.client_pool().await?;

        let Some(level) = self.context.default_consistency else {
            return pool.acquire().await;
        };

        let status = self.status().await?;
        let mut conn = pool.acquire().await?;

        let Some(variable) = status.consistency else {
            conn.close().await?;
            return Err(Error::ConsistencyUnsupported(self.address.clone()));
        };
        if !variable.supports(level) {
            tracing::warn!(
                "Default consistency level {} does not match {} on {}",
                level,
                variable.name(),
                self.address
            );
        }

        if let Err(e) = conn.execute(&variable.set_statement(level)).await {
            conn.discard().await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Borrow a connection pinned to `level` until it is closed
    pub async fn get_connection_with_consistency(
        &self,
        level: ConsistencyLevel,
    ) -> Result<ConsistentConnection> {
        let pool = self.client_pool().await?;
        let status = self.status().await?;
        let conn = pool.acquire().await?;
        ConsistentConnection::wrap(conn, level, &status).await
    }

    /// Client pool name and gauges, while active
    pub async fn pool_metrics(&self) -> Option<(String, PoolMetrics)> {
        self.pool
            .read()
            .await
            .as_ref()
            .map(|p| (p.name().to_string(), p.metrics()))
    }

    async fn client_pool(&self) -> Result<Arc<dyn NodePool>> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NodeNotActive(self.address.clone()))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("address", &self.address).finish()
    }
}
