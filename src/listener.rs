//! Cluster Event Listener
//!
//! Notification sink for node lifecycle events and periodic pool metrics.
//! Calls are fire-and-forget: the listener never influences cluster state.

use crate::metrics::PoolMetrics;

/// Receives node lifecycle events from a `ClusterManager`
pub trait ClusterListener: Send + Sync {
    fn on_activating_node(&self, node: &str);

    fn on_marking_node_as_down(&self, node: &str, cause: &str);

    fn on_removing_node(&self, node: &str);

    /// Pool gauges for one node, reported after each discovery cycle when
    /// metrics are enabled. `threads_connected` comes from the node's last
    /// status probe.
    fn on_pool_metrics(&self, _pool_name: &str, _metrics: &PoolMetrics, _threads_connected: Option<u32>) {}
}

/// Default listener: writes every event to the log
#[derive(Debug, Clone, Default)]
pub struct LoggingListener;

impl ClusterListener for LoggingListener {
    fn on_activating_node(&self, node: &str) {
        tracing::info!("Activating galera node: {}", node);
    }

    fn on_marking_node_as_down(&self, node: &str, cause: &str) {
        tracing::info!("Marking down galera node: {} because of {}", node, cause);
    }

    fn on_removing_node(&self, node: &str) {
        tracing::info!("Removing galera node: {}", node);
    }

    fn on_pool_metrics(&self, pool_name: &str, metrics: &PoolMetrics, threads_connected: Option<u32>) {
        tracing::info!(
            pool = pool_name,
            wait_p95_ms = ?metrics.wait_p95_ms,
            usage_p95_ms = ?metrics.usage_p95_ms,
            total = metrics.total_connections,
            idle = metrics.idle_connections,
            active = metrics.active_connections,
            pending = metrics.pending_connections,
            threads_connected = ?threads_connected,
            "Pool metrics"
        );
    }
}

/// Listener that records every event, for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    pub events: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[cfg(test)]
impl ClusterListener for RecordingListener {
    fn on_activating_node(&self, node: &str) {
        self.events.lock().push(format!("activate {}", node));
    }

    fn on_marking_node_as_down(&self, node: &str, cause: &str) {
        self.events.lock().push(format!("down {} {}", node, cause));
    }

    fn on_removing_node(&self, node: &str) {
        self.events.lock().push(format!("remove {}", node));
    }

    fn on_pool_metrics(&self, pool_name: &str, metrics: &PoolMetrics, threads_connected: Option<u32>) {
        self.events.lock().push(format!(
            "metrics {} total={} threads={:?}",
            pool_name, metrics.total_connections, threads_connected
        ));
    }
}
