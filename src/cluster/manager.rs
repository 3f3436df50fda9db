//! Cluster Manager
//!
//! Owns the node registry, runs the periodic discovery cycle that drives
//! every node state transition, and serves connection requests by
//! combining a selection policy, a bounded retry and the chosen node.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::consistency::ConsistencyLevel;
use crate::error::{Error, Result};
use crate::listener::{ClusterListener, LoggingListener};
use crate::node::{Node, NodeContext};
use crate::policy::SelectionPolicy;
use crate::pool::{Connection, MySqlPoolProvider, PoolProvider};
use super::registry::{ClusterState, NodeRegistry};

/// Bookkeeping for one discovery cycle
#[derive(Default)]
struct DiscoveryCycle {
    /// Nodes already probed this cycle
    probed: HashSet<String>,
    /// Union of the member lists reported by primary nodes
    reported: HashSet<String>,
}

/// Clears the in-flight flag when a cycle ends, even if it was cancelled
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cluster-aware connection source for a Galera cluster
pub struct ClusterManager {
    config: RouterConfig,
    context: Arc<NodeContext>,
    registry: NodeRegistry,
    default_policy: Arc<dyn SelectionPolicy>,
    listener: Arc<dyn ClusterListener>,
    /// Single-flight guard for discovery
    discovering: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Create a manager and register the seed nodes as downed.
    ///
    /// Nothing is probed until the first discovery cycle.
    pub async fn new(
        config: RouterConfig,
        provider: Arc<dyn PoolProvider>,
        listener: Arc<dyn ClusterListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let context = Arc::new(NodeContext::from_config(&config, provider));
        let default_policy = config.cluster.default_policy.build();

        let manager = Arc::new(Self {
            config,
            context,
            registry: NodeRegistry::new(),
            default_policy,
            listener,
            discovering: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
        });
        manager.register_seeds().await?;
        Ok(manager)
    }

    /// Connect to a MySQL/MariaDB Galera cluster: register the seeds,
    /// run a first discovery cycle and start the periodic one
    pub async fn connect(config: RouterConfig) -> Result<Arc<Self>> {
        let manager = Self::new(
            config,
            Arc::new(MySqlPoolProvider::new()),
            Arc::new(LoggingListener),
        )
        .await?;
        manager.start().await;
        Ok(manager)
    }

    /// Run one discovery cycle now, then keep running it every period
    pub async fn start(self: &Arc<Self>) {
        self.discovery().await;
        self.start_discovery();
    }

    /// Spawn the periodic discovery task. No-op if it is already running.
    pub fn start_discovery(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.discovery_period();
        tracing::info!("Starting galera discovery every {:?}", period);

        *scheduler = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick fires immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(manager) = Weak::upgrade(&manager) else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.discovery() => {}
                }
            }
            tracing::debug!("Galera discovery stopped");
        }));
    }

    /// Run a discovery cycle unless one is already in flight.
    ///
    /// Never fails: errors and panics inside the cycle are logged and the
    /// cycle is abandoned for this tick.
    pub async fn discovery(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self
            .discovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Discovery already in progress, skipping");
            return;
        }
        let _in_flight = InFlight(&self.discovering);

        let outcome = AssertUnwindSafe(self.run_discovery_cycle())
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => Error::DiscoveryCycleFailure(e.to_string()),
            Err(_) => Error::DiscoveryCycleFailure("discovery cycle panicked".to_string()),
        };
        tracing::error!("{}", failure);
    }

    async fn run_discovery_cycle(&self) -> Result<()> {
        tracing::trace!("Running galera discovery");
        let mut cycle = DiscoveryCycle::default();

        if self.registry.is_empty().await {
            tracing::info!("No galera node registered, re-seeding");
            self.register_seeds().await?;
        }

        for address in self.registry.active_nodes().await {
            self.probe(&address, &mut cycle).await;
        }
        for address in self.registry.downed_nodes().await {
            self.probe(&address, &mut cycle).await;
        }

        self.prune_unlisted(&cycle).await;

        if self.config.pool.metrics_enabled {
            self.report_pool_metrics().await;
        }
        Ok(())
    }

    /// Probe a node, then every peer it causes to be registered
    async fn probe(&self, address: &str, cycle: &mut DiscoveryCycle) {
        let mut pending = VecDeque::from([address.to_string()]);
        while let Some(address) = pending.pop_front() {
            if !cycle.probed.insert(address.clone()) {
                continue;
            }
            pending.extend(self.probe_node(&address, cycle).await);
        }
    }

    /// Refresh one node's status and apply the resulting transition.
    /// Returns the peers registered because of this probe.
    async fn probe_node(&self, address: &str, cycle: &mut DiscoveryCycle) -> Vec<String> {
        let Some(node) = self.registry.get(address).await else {
            return Vec::new();
        };

        let status = match node.refresh_status().await {
            Ok(status) => status,
            Err(e @ Error::MalformedStatus { .. }) => {
                tracing::warn!("{}", e);
                self.remove_node(address).await;
                return Vec::new();
            }
            Err(e) => {
                let failure = Error::ProbeFailure {
                    node: address.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", failure);
                self.mark_down(address, &e.to_string()).await;
                return Vec::new();
            }
        };

        // A non-primary partition's member list is not trusted
        if !status.is_primary() {
            if let Some(reason) = status.down_reason(self.config.discovery.ignore_donor) {
                self.mark_down(address, &reason).await;
            }
            return Vec::new();
        }
        cycle.reported.extend(status.incoming_addresses.iter().cloned());

        let mut discovered = Vec::new();
        for peer in &status.incoming_addresses {
            if self.registry.contains(peer).await {
                continue;
            }
            match self.register_node(peer).await {
                Ok(true) => discovered.push(peer.clone()),
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not register galera node {}: {}", peer, e),
            }
        }

        if !status.lists(address) {
            tracing::info!(
                "Galera node {} is not part of the cluster it reports, removing",
                address
            );
            self.remove_node(address).await;
            return discovered;
        }

        match status.down_reason(self.config.discovery.ignore_donor) {
            Some(reason) => self.mark_down(address, &reason).await,
            None => self.activate(address).await,
        }
        discovered
    }

    /// Remove registered nodes that no primary node listed this cycle
    async fn prune_unlisted(&self, cycle: &DiscoveryCycle) {
        if cycle.reported.is_empty() {
            return;
        }
        for address in self.registry.addresses().await {
            if !cycle.reported.contains(&address) {
                tracing::info!("Galera node {} left the cluster, removing", address);
                self.remove_node(&address).await;
            }
        }
    }

    async fn register_seeds(&self) -> Result<()> {
        for seed in &self.config.cluster.seeds {
            self.register_node(seed).await?;
        }
        Ok(())
    }

    /// Register a node as downed. Returns false if it was already known.
    async fn register_node(&self, address: &str) -> Result<bool> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let node = Arc::new(Node::new(address, Arc::clone(&self.context))?);
        let registered = self.registry.register(Arc::clone(&node)).await;
        if registered {
            tracing::info!("Registered galera node {}", address);
        } else {
            // Lost a race with another registration; release the unused status pool
            node.shutdown().await;
        }
        Ok(registered)
    }

    /// Build the node's pool and make it routable. No-op if already active.
    async fn activate(&self, address: &str) {
        if self.registry.is_active(address).await {
            return;
        }
        let Some(node) = self.registry.get(address).await else {
            return;
        };

        if let Err(e) = node.activate().await {
            tracing::warn!("Could not activate galera node {}: {}", address, e);
            return;
        }
        if self.registry.mark_active(address).await {
            self.notify(|l| l.on_activating_node(address));
        }
    }

    /// Stop routing to a node and close its pool. No-op unless active.
    async fn mark_down(&self, address: &str, cause: &str) {
        if !self.registry.mark_down(address).await {
            tracing::debug!("Galera node {} stays down: {}", address, cause);
            return;
        }

        self.notify(|l| l.on_marking_node_as_down(address, cause));
        if let Some(node) = self.registry.get(address).await {
            node.deactivate().await;
        }
    }

    /// Drop a node from the registry and close all of its pools
    async fn remove_node(&self, address: &str) {
        if let Some(node) = self.registry.remove(address).await {
            self.notify(|l| l.on_removing_node(address));
            node.shutdown().await;
        }
    }

    async fn report_pool_metrics(&self) {
        for node in self.registry.all_nodes().await {
            let Some((pool_name, metrics)) = node.pool_metrics().await else {
                continue;
            };
            let threads_connected = node
                .cached_status()
                .await
                .and_then(|status| status.threads_connected());
            self.notify(|l| l.on_pool_metrics(&pool_name, &metrics, threads_connected));
        }
    }

    /// Deliver an event to the listener, containing any panic
    fn notify(&self, event: impl FnOnce(&dyn ClusterListener)) {
        let listener = self.listener.as_ref();
        if std::panic::catch_unwind(AssertUnwindSafe(|| event(listener))).is_err() {
            tracing::warn!("Cluster listener panicked, event dropped");
        }
    }

    /// Borrow a connection from a node chosen by the default policy.
    ///
    /// On failure a discovery cycle runs before the error is returned.
    pub async fn get_connection(&self) -> Result<Box<dyn Connection>> {
        self.ensure_running()?;

        let result = async {
            let node = self.select_node(self.default_policy.as_ref()).await?;
            tracing::debug!(
                "Getting connection [{}] from node {}",
                self.default_policy.name(),
                node.address()
            );
            node.get_connection().await
        }
        .await;

        if let Err(e) = &result {
            self.force_discovery(e).await;
        }
        result
    }

    /// Borrow a connection pinned to `level`, chosen by the default policy
    pub async fn get_connection_with_consistency(
        &self,
        level: ConsistencyLevel,
    ) -> Result<Box<dyn Connection>> {
        self.get_connection_with(Some(level), None).await
    }

    /// Borrow a plain connection from a node chosen by `policy`
    pub async fn get_connection_with_policy(
        &self,
        policy: &dyn SelectionPolicy,
    ) -> Result<Box<dyn Connection>> {
        self.get_connection_with(None, Some(policy)).await
    }

    /// Borrow a connection with an optional consistency level and an
    /// optional policy override for this call only.
    ///
    /// Selection errors are returned as is; a failure to borrow from the
    /// chosen node runs a discovery cycle first.
    pub async fn get_connection_with(
        &self,
        level: Option<ConsistencyLevel>,
        policy: Option<&dyn SelectionPolicy>,
    ) -> Result<Box<dyn Connection>> {
        self.ensure_running()?;

        let policy = policy.unwrap_or(self.default_policy.as_ref());
        let node = self.select_node(policy).await?;
        tracing::debug!("Getting connection [{}] from node {}", policy.name(), node.address());

        let result = match level {
            Some(level) => node
                .get_connection_with_consistency(level)
                .await
                .map(|conn| Box::new(conn) as Box<dyn Connection>),
            None => node.get_connection().await,
        };

        if let Err(e) = &result {
            self.force_discovery(e).await;
        }
        result
    }

    async fn force_discovery(&self, error: &Error) {
        if error.is_topology_signal() {
            tracing::info!("Error getting connection ({}). Forcing discovery...", error);
            self.discovery().await;
        }
    }

    /// Resolve a node through `policy`, retrying a bounded number of times
    /// when the policy fails or picks a node that is no longer registered
    async fn select_node(&self, policy: &dyn SelectionPolicy) -> Result<Arc<Node>> {
        let retries = self.config.cluster.retries_to_get_connection;

        for attempt in 1..=retries {
            let active = self.registry.active_nodes().await;
            if active.is_empty() {
                tracing::error!("Could not get galera node, there is no active node");
                return Err(Error::NoActiveNode);
            }

            match policy.choose_node(&active) {
                Ok(address) => match self.registry.get(&address).await {
                    Some(node) => return Ok(node),
                    None => tracing::debug!(
                        "Chosen galera node {} is gone. Retry {}/{}",
                        address,
                        attempt,
                        retries
                    ),
                },
                Err(e) => tracing::warn!(
                    "Error getting active galera node. Retry {}/{}. Reason {}",
                    attempt,
                    retries,
                    e
                ),
            }
        }

        tracing::error!("No host available selecting an active galera node. Max attempts reached");
        Err(Error::NoHostAvailable {
            active_nodes: self.registry.active_nodes().await,
        })
    }

    /// Stop discovery and close every node's pools. Later calls are no-ops
    /// and connection requests fail with `Error::ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down galera cluster manager");

        self.cancel.cancel();
        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                tracing::warn!("Discovery task ended abnormally: {}", e);
            }
        }

        for node in self.registry.drain().await {
            node.shutdown().await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Active and downed node identities
    pub async fn state(&self) -> ClusterState {
        self.registry.state().await
    }

    pub async fn active_nodes(&self) -> Vec<String> {
        self.registry.active_nodes().await
    }

    pub async fn node(&self, address: &str) -> Option<Arc<Node>> {
        self.registry.get(address).await
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::config::DatabaseConfig;
    use crate::listener::RecordingListener;
    use crate::metrics::PoolMetrics;
    use crate::policy::MasterSortingPolicy;
    use crate::pool::mock::MockCluster;

    const N1: &str = "db-1:3306";
    const N2: &str = "db-2:3306";
    const N3: &str = "db-3:3306";

    fn config(seeds: &[&str]) -> RouterConfig {
        RouterConfig::new(
            seeds.iter().map(|s| s.to_string()).collect(),
            DatabaseConfig {
                user: "app".to_string(),
                password: "secret".to_string(),
                database: Some("shop".to_string()),
            },
        )
    }

    async fn manager_with(
        cluster: &MockCluster,
        config: RouterConfig,
    ) -> (Arc<ClusterManager>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let manager = ClusterManager::new(config, cluster.provider(), listener.clone())
            .await
            .unwrap();
        (manager, listener)
    }

    async fn manager(
        cluster: &MockCluster,
        seeds: &[&str],
    ) -> (Arc<ClusterManager>, Arc<RecordingListener>) {
        manager_with(cluster, config(seeds)).await
    }

    async fn sorted_active(manager: &ClusterManager) -> Vec<String> {
        let mut active = manager.active_nodes().await;
        active.sort();
        active
    }

    /// Policy that always fails, counting its calls
    #[derive(Default)]
    struct FailingPolicy {
        calls: AtomicUsize,
    }

    impl SelectionPolicy for FailingPolicy {
        fn name(&self) -> &str {
            "Failing"
        }

        fn choose_node(&self, _active_nodes: &[String]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("policy exploded".to_string()))
        }
    }

    /// Policy that picks a node that is not registered
    struct GhostPolicy;

    impl SelectionPolicy for GhostPolicy {
        fn name(&self) -> &str {
            "Ghost"
        }

        fn choose_node(&self, _active_nodes: &[String]) -> Result<String> {
            Ok("db-9:3306".to_string())
        }
    }

    struct PanickingListener;

    impl ClusterListener for PanickingListener {
        fn on_activating_node(&self, _node: &str) {
            panic!("listener failure");
        }

        fn on_marking_node_as_down(&self, _node: &str, _cause: &str) {
            panic!("listener failure");
        }

        fn on_removing_node(&self, _node: &str) {
            panic!("listener failure");
        }

        fn on_pool_metrics(&self, _pool_name: &str, _metrics: &PoolMetrics, _threads: Option<u32>) {
            panic!("listener failure");
        }
    }

    /// Seed N1 reporting N1 and N2, both healthy
    async fn two_node_cluster() -> (MockCluster, Arc<ClusterManager>, Arc<RecordingListener>) {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1, N2]);
        cluster.set_synced(N2, &[N1, N2]);
        let (manager, listener) = manager(&cluster, &[N1]).await;
        manager.discovery().await;
        (cluster, manager, listener)
    }

    #[tokio::test]
    async fn test_seeds_registered_as_downed() {
        let cluster = MockCluster::new();
        let (manager, listener) = manager(&cluster, &[N1, N2]).await;

        let state = manager.state().await;
        assert!(state.active.is_empty());
        assert_eq!(state.downed, vec![N1, N2]);
        assert_eq!(cluster.probes(N1), 0);
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let cluster = MockCluster::new();
        let listener = Arc::new(RecordingListener::default());
        let result = ClusterManager::new(config(&[]), cluster.provider(), listener).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_discovers_and_activates_peers() {
        let (cluster, manager, listener) = two_node_cluster().await;

        assert_eq!(sorted_active(&manager).await, vec![N1, N2]);
        assert!(manager.state().await.downed.is_empty());
        assert_eq!(cluster.pools_created(N1), 1);
        assert_eq!(cluster.pools_created(N2), 1);
        assert_eq!(cluster.probes(N2), 1);
        assert_eq!(listener.count("activate"), 2);
        manager.registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_probe_failure_marks_down_with_cause() {
        let (cluster, manager, listener) = two_node_cluster().await;

        cluster.set_unreachable(N1, "connection refused");
        manager.discovery().await;

        let state = manager.state().await;
        assert_eq!(state.active, vec![N2]);
        assert_eq!(state.downed, vec![N1]);
        assert!(listener
            .events()
            .iter()
            .any(|e| e.starts_with("down db-1:3306") && e.contains("connection refused")));
        assert_eq!(cluster.pools_closed(N1), 1);
        assert!(!manager.node(N1).await.unwrap().is_active().await);
        manager.registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_downed_node_reactivates_once() {
        let (cluster, manager, listener) = two_node_cluster().await;

        cluster.set_unreachable(N1, "connection refused");
        manager.discovery().await;
        cluster.set_synced(N1, &[N1, N2]);
        manager.discovery().await;

        let state = manager.state().await;
        assert_eq!(state.active, vec![N2, N1]);
        assert!(state.downed.is_empty());
        assert_eq!(cluster.pools_created(N1), 2);
        assert_eq!(listener.count("activate db-1:3306"), 2);
        manager.registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_active_node_is_not_reactivated() {
        let (cluster, manager, listener) = two_node_cluster().await;

        manager.discovery().await;
        manager.discovery().await;

        assert_eq!(cluster.pools_created(N1), 1);
        assert_eq!(cluster.pools_created(N2), 1);
        assert_eq!(listener.count("activate"), 2);
        assert_eq!(cluster.probes(N1), 3);
    }

    #[tokio::test]
    async fn test_node_missing_from_own_member_list_is_removed() {
        let (cluster, manager, listener) = two_node_cluster().await;

        cluster.set_synced(N1, &[N1]);
        cluster.set_synced(N2, &[N1]);
        manager.discovery().await;

        assert!(manager.node(N2).await.is_none());
        assert_eq!(manager.active_nodes().await, vec![N1]);
        assert_eq!(listener.count("remove db-2:3306"), 1);
        // Client and status pools
        assert_eq!(cluster.pools_closed(N2), 2);
        manager.registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_unlisted_node_is_pruned() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1, N2]);
        cluster.set_synced(N2, &[N1, N2]);
        cluster.set_unreachable(N3, "no route to host");
        let (manager, listener) = manager(&cluster, &[N1, N3]).await;

        manager.discovery().await;

        let state = manager.state().await;
        assert_eq!(state.registered().len(), 2);
        assert!(manager.node(N3).await.is_none());
        assert_eq!(listener.count("remove db-3:3306"), 1);
        // It was never active, so it was never marked down
        assert_eq!(listener.count("down"), 0);
        manager.registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_unreachable_cluster_keeps_nodes_registered() {
        let cluster = MockCluster::new();
        cluster.set_unreachable(N1, "connection refused");
        cluster.set_unreachable(N2, "connection refused");
        let (manager, listener) = manager(&cluster, &[N1, N2]).await;

        manager.discovery().await;

        let state = manager.state().await;
        assert!(state.active.is_empty());
        assert_eq!(state.downed, vec![N1, N2]);
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_status_removes_node() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1, N2]);
        cluster.set_variables(N2, Vec::new());
        let (manager, listener) = manager(&cluster, &[N1]).await;

        manager.discovery().await;

        assert_eq!(manager.active_nodes().await, vec![N1]);
        assert!(manager.node(N2).await.is_none());
        assert_eq!(listener.count("remove db-2:3306"), 1);
    }

    #[tokio::test]
    async fn test_reseeds_after_total_outage() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[]);
        let (manager, _listener) = manager(&cluster, &[N1]).await;

        manager.discovery().await;
        assert!(manager.state().await.registered().is_empty());

        cluster.set_synced(N1, &[N1]);
        manager.discovery().await;
        assert_eq!(manager.active_nodes().await, vec![N1]);
    }

    #[tokio::test]
    async fn test_non_primary_node_goes_down() {
        let (cluster, manager, listener) = two_node_cluster().await;

        cluster.set_state(N2, "non-Primary", "Synced", &[N2]);
        manager.discovery().await;

        assert_eq!(manager.state().await.downed, vec![N2]);
        assert_eq!(listener.count("down db-2:3306 non Primary"), 1);
    }

    #[tokio::test]
    async fn test_non_primary_member_list_registers_no_peers() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1]);
        cluster.set_state(N2, "non-Primary", "Synced", &[N2, N3]);
        cluster.set_synced(N3, &[N2, N3]);
        let (manager, listener) = manager(&cluster, &[N2]).await;

        manager.discovery().await;

        assert!(manager.node(N3).await.is_none());
        assert_eq!(cluster.status_pools_created(N3), 0);
        assert_eq!(manager.state().await.downed, vec![N2]);
        assert_eq!(listener.count("activate"), 0);
    }

    #[tokio::test]
    async fn test_failed_activation_is_not_announced() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1]);
        cluster.fail_pool_creation(N1);
        let (manager, listener) = manager(&cluster, &[N1]).await;

        manager.discovery().await;
        manager.discovery().await;

        assert_eq!(manager.state().await.downed, vec![N1]);
        assert_eq!(listener.count("activate"), 0);
        manager.registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_donor_ignored_by_default() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1, N2]);
        cluster.set_state(N2, "Primary", "Donor/Desynced", &[N1, N2]);
        let (manager, _listener) = manager(&cluster, &[N1]).await;

        manager.discovery().await;

        let state = manager.state().await;
        assert_eq!(state.active, vec![N1]);
        assert_eq!(state.downed, vec![N2]);
    }

    #[tokio::test]
    async fn test_donor_routable_when_not_ignored() {
        let cluster = MockCluster::new();
        cluster.set_state(N1, "Primary", "Donor/Desynced", &[N1, N2]);
        cluster.set_synced(N2, &[N1, N2]);
        let mut config = config(&[N1]);
        config.discovery.ignore_donor = false;
        let (manager, _listener) = manager_with(&cluster, config).await;

        manager.discovery().await;
        assert_eq!(sorted_active(&manager).await, vec![N1, N2]);

        // A joining node is never routable
        cluster.set_state(N1, "Primary", "Joined", &[N1, N2]);
        manager.discovery().await;
        assert_eq!(manager.state().await.downed, vec![N1]);
    }

    #[tokio::test]
    async fn test_discovery_is_single_flight() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1]);
        let (manager, _listener) = manager(&cluster, &[N1]).await;

        manager.discovering.store(true, Ordering::SeqCst);
        manager.discovery().await;
        assert_eq!(cluster.probes(N1), 0);

        manager.discovering.store(false, Ordering::SeqCst);
        manager.discovery().await;
        assert_eq!(cluster.probes(N1), 1);
        assert!(!manager.discovering.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_listener_panics_do_not_affect_state() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1, N2]);
        cluster.set_synced(N2, &[N1, N2]);
        let mut config = config(&[N1]);
        config.pool.metrics_enabled = true;
        let manager = ClusterManager::new(config, cluster.provider(), Arc::new(PanickingListener))
            .await
            .unwrap();

        manager.discovery().await;
        assert_eq!(sorted_active(&manager).await, vec![N1, N2]);

        cluster.set_unreachable(N2, "gone");
        manager.discovery().await;
        assert_eq!(manager.state().await.downed, vec![N2]);
    }

    #[tokio::test]
    async fn test_reports_pool_metrics_when_enabled() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1]);
        let mut config = config(&[N1]);
        config.pool.metrics_enabled = true;
        let (manager, listener) = manager_with(&cluster, config).await;

        manager.discovery().await;
        assert!(listener
            .events()
            .contains(&"metrics wolfgalera.db-1 total=2 threads=Some(5)".to_string()));

        let (_cluster, _manager, quiet) = two_node_cluster().await;
        assert_eq!(quiet.count("metrics"), 0);
    }

    #[tokio::test]
    async fn test_get_connection_on_empty_active_set() {
        let cluster = MockCluster::new();
        let (manager, _listener) = manager(&cluster, &[N1]).await;
        let policy = FailingPolicy::default();

        let result = manager.get_connection_with_policy(&policy).await;
        assert!(matches!(result, Err(Error::NoActiveNode)));
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_policy_failures_exhaust_retries() {
        let (_cluster, manager, _listener) = two_node_cluster().await;
        let policy = FailingPolicy::default();

        match manager.get_connection_with_policy(&policy).await {
            Err(Error::NoHostAvailable { mut active_nodes }) => {
                active_nodes.sort();
                assert_eq!(active_nodes, vec![N1, N2]);
            }
            other => panic!("expected NoHostAvailable, got {:?}", other.map(|c| c.node().to_string())),
        }
        assert_eq!(policy.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_choice_counts_as_retry() {
        let (_cluster, manager, _listener) = two_node_cluster().await;

        let result = manager.get_connection_with_policy(&GhostPolicy).await;
        assert!(matches!(result, Err(Error::NoHostAvailable { .. })));
    }

    #[tokio::test]
    async fn test_get_connection_round_robins() {
        let (cluster, manager, _listener) = two_node_cluster().await;

        let first = manager.get_connection().await.unwrap();
        let second = manager.get_connection().await.unwrap();
        assert_ne!(first.node(), second.node());

        let closed_before = cluster.closed_connections(N1) + cluster.closed_connections(N2);
        first.close().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(
            cluster.closed_connections(N1) + cluster.closed_connections(N2),
            closed_before + 2
        );
    }

    #[tokio::test]
    async fn test_get_connection_with_consistency_and_policy() {
        let (cluster, manager, _listener) = two_node_cluster().await;

        let conn = manager
            .get_connection_with(Some(ConsistencyLevel::SyncReads), Some(&MasterSortingPolicy))
            .await
            .unwrap();
        assert_eq!(conn.node(), N1);
        conn.close().await.unwrap();

        assert_eq!(
            cluster.executed(N1),
            vec![
                "SET SESSION wsrep_sync_wait = 1",
                "SET SESSION wsrep_sync_wait = 0",
            ]
        );
        assert!(cluster.executed(N2).is_empty());
    }

    #[tokio::test]
    async fn test_default_consistency_level_on_plain_connections() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1]);
        let mut config = config(&[N1]);
        config.cluster.consistency_level = Some(ConsistencyLevel::SyncUpdateDelete);
        let (manager, _listener) = manager_with(&cluster, config).await;
        manager.discovery().await;

        let conn = manager.get_connection().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(cluster.executed(N1), vec!["SET SESSION wsrep_sync_wait = 2"]);
    }

    #[tokio::test]
    async fn test_acquire_failure_forces_discovery() {
        let (cluster, manager, _listener) = two_node_cluster().await;
        let probes = cluster.probes(N1);

        cluster.fail_acquire(N1);
        let result = manager.get_connection_with_policy(&MasterSortingPolicy).await;
        assert!(matches!(result, Err(Error::ConnectionAcquisition { .. })));
        assert_eq!(cluster.probes(N1), probes + 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (cluster, manager, _listener) = two_node_cluster().await;
        manager.start_discovery();

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.is_shut_down());
        assert_eq!(cluster.pools_closed(N1), 2);
        assert_eq!(cluster.pools_closed(N2), 2);
        assert!(manager.state().await.registered().is_empty());
        assert!(matches!(manager.get_connection().await, Err(Error::ShuttingDown)));

        let probes = cluster.probes(N1);
        manager.discovery().await;
        assert_eq!(cluster.probes(N1), probes);
    }

    #[tokio::test]
    async fn test_scheduler_runs_discovery() {
        let cluster = MockCluster::new();
        cluster.set_synced(N1, &[N1]);
        let mut config = config(&[N1]);
        config.discovery.period_ms = 10;
        let (manager, _listener) = manager_with(&cluster, config).await;

        manager.start_discovery();
        manager.start_discovery();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(manager.active_nodes().await, vec![N1]);
        assert!(cluster.probes(N1) >= 2);
        manager.shutdown().await;
    }
}
