//! Scripted in-memory pools for tests
//!
//! Each node's status rows, reachability and statement outcomes are set by
//! the test; every statement, close and pool lifecycle event is recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{DatabaseConfig, PoolSettings};
use crate::error::{Error, Result};
use crate::metrics::PoolMetrics;
use crate::status::{QUERY_GLOBAL_VARIABLES, QUERY_STATUS};
use super::{Connection, NodePool, PoolProvider, STATUS_POOL_PREFIX};

#[derive(Default)]
struct MockNode {
    variables: Vec<(String, String)>,
    unreachable: Option<String>,
    fail_acquire: bool,
    fail_statements: bool,
    fail_pool_creation: bool,
    executed: Vec<String>,
    closed: usize,
    discarded: usize,
    probes: usize,
    pools_created: usize,
    pools_closed: usize,
    status_pools_created: usize,
}

/// Shared scripted cluster state
#[derive(Clone, Default)]
pub struct MockCluster {
    nodes: Arc<Mutex<HashMap<String, MockNode>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> Arc<dyn PoolProvider> {
        Arc::new(self.clone())
    }

    /// Primary, synced node reporting `peers`
    pub fn set_synced(&self, node: &str, peers: &[&str]) {
        self.set_state(node, "Primary", "Synced", peers);
    }

    pub fn set_state(&self, node: &str, cluster_status: &str, local_state: &str, peers: &[&str]) {
        let variables = vec![
            ("wsrep_cluster_status".to_string(), cluster_status.to_string()),
            ("wsrep_local_state_comment".to_string(), local_state.to_string()),
            ("wsrep_incoming_addresses".to_string(), peers.join(",")),
            ("Threads_connected".to_string(), "5".to_string()),
            ("wsrep_sync_wait".to_string(), "0".to_string()),
        ];
        self.set_variables(node, variables);
    }

    /// Replace the raw status rows reported by a node
    pub fn set_variables(&self, node: &str, variables: Vec<(String, String)>) {
        let mut nodes = self.nodes.lock();
        let entry = nodes.entry(node.to_string()).or_default();
        entry.variables = variables;
        entry.unreachable = None;
    }

    pub fn set_unreachable(&self, node: &str, reason: &str) {
        self.nodes
            .lock()
            .entry(node.to_string())
            .or_default()
            .unreachable = Some(reason.to_string());
    }

    /// Make client-pool borrows (not status probes) fail
    pub fn fail_acquire(&self, node: &str) {
        self.nodes.lock().entry(node.to_string()).or_default().fail_acquire = true;
    }

    /// Make client pool creation (not status pools) fail
    pub fn fail_pool_creation(&self, node: &str) {
        self.nodes.lock().entry(node.to_string()).or_default().fail_pool_creation = true;
    }

    pub fn fail_statements(&self, node: &str) {
        self.nodes.lock().entry(node.to_string()).or_default().fail_statements = true;
    }

    /// A connection to `node` outside any pool
    pub fn connection(&self, node: &str) -> Box<dyn Connection> {
        Box::new(MockConnection::new(node, &self.nodes))
    }

    pub fn executed(&self, node: &str) -> Vec<String> {
        self.read(node, |n| n.executed.clone())
    }

    pub fn closed_connections(&self, node: &str) -> usize {
        self.read(node, |n| n.closed)
    }

    pub fn discarded_connections(&self, node: &str) -> usize {
        self.read(node, |n| n.discarded)
    }

    pub fn probes(&self, node: &str) -> usize {
        self.read(node, |n| n.probes)
    }

    /// Client pools created for a node
    pub fn pools_created(&self, node: &str) -> usize {
        self.read(node, |n| n.pools_created)
    }

    /// Pools (client and status) closed for a node
    pub fn pools_closed(&self, node: &str) -> usize {
        self.read(node, |n| n.pools_closed)
    }

    pub fn status_pools_created(&self, node: &str) -> usize {
        self.read(node, |n| n.status_pools_created)
    }

    fn read<T: Default>(&self, node: &str, f: impl FnOnce(&MockNode) -> T) -> T {
        self.nodes.lock().get(node).map(f).unwrap_or_default()
    }
}

impl PoolProvider for MockCluster {
    fn create_pool(
        &self,
        address: &str,
        name: &str,
        _settings: &PoolSettings,
        _database: &DatabaseConfig,
    ) -> Result<Arc<dyn NodePool>> {
        let status = name.starts_with(STATUS_POOL_PREFIX);
        {
            let mut nodes = self.nodes.lock();
            let entry = nodes.entry(address.to_string()).or_default();
            if status {
                entry.status_pools_created += 1;
            } else if entry.fail_pool_creation {
                return Err(Error::Config(format!("cannot build pool for {}", address)));
            } else {
                entry.pools_created += 1;
            }
        }

        Ok(Arc::new(MockPool {
            address: address.to_string(),
            name: name.to_string(),
            status,
            nodes: Arc::clone(&self.nodes),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockPool {
    address: String,
    name: String,
    status: bool,
    nodes: Arc<Mutex<HashMap<String, MockNode>>>,
    closed: AtomicBool,
}

#[async_trait]
impl NodePool for MockPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let acquisition_error = |source| Error::ConnectionAcquisition {
            node: self.address.clone(),
            source,
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(acquisition_error(sqlx::Error::PoolClosed));
        }

        {
            let nodes = self.nodes.lock();
            let node = nodes.get(&self.address);
            if let Some(reason) = node.and_then(|n| n.unreachable.clone()) {
                return Err(acquisition_error(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    reason,
                ))));
            }
            if !self.status && node.map(|n| n.fail_acquire).unwrap_or(false) {
                return Err(acquisition_error(sqlx::Error::PoolTimedOut));
            }
        }

        Ok(Box::new(MockConnection::new(&self.address, &self.nodes)))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.nodes
                .lock()
                .entry(self.address.clone())
                .or_default()
                .pools_closed += 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            total_connections: 2,
            idle_connections: 1,
            active_connections: 1,
            ..PoolMetrics::default()
        }
    }
}

struct MockConnection {
    node: String,
    nodes: Arc<Mutex<HashMap<String, MockNode>>>,
    /// Counted as discarded if dropped without close
    close_on_drop: bool,
}

impl MockConnection {
    fn new(node: &str, nodes: &Arc<Mutex<HashMap<String, MockNode>>>) -> Self {
        Self {
            node: node.to_string(),
            nodes: Arc::clone(nodes),
            close_on_drop: false,
        }
    }

    fn finish(&mut self, discarded: bool) {
        self.close_on_drop = false;
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(self.node.clone()).or_default();
        if discarded {
            node.discarded += 1;
        } else {
            node.closed += 1;
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.finish(true);
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn node(&self) -> &str {
        &self.node
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(self.node.clone()).or_default();
        if node.fail_statements {
            return Err(Error::Database(sqlx::Error::Protocol(format!(
                "statement rejected: {}",
                sql
            ))));
        }
        node.executed.push(sql.to_string());
        Ok(0)
    }

    async fn fetch_pairs(&mut self, sql: &str) -> Result<Vec<(String, String)>> {
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(self.node.clone()).or_default();
        if let Some(reason) = &node.unreachable {
            return Err(Error::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                reason.clone(),
            ))));
        }

        let is_global = |name: &str| name == "wsrep_sync_wait" || name == "wsrep_causal_reads";
        let rows = if sql == QUERY_STATUS {
            node.probes += 1;
            node.variables
                .iter()
                .filter(|(name, _)| !is_global(name))
                .cloned()
                .collect()
        } else if sql == QUERY_GLOBAL_VARIABLES {
            node.variables
                .iter()
                .filter(|(name, _)| is_global(name))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        Ok(rows)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finish(false);
        Ok(())
    }

    async fn discard(self: Box<Self>) {
        let mut this = self;
        this.finish(true);
    }

    fn close_on_drop(&mut self) {
        self.close_on_drop = true;
    }
}
