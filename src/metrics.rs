//! Pool Metrics
//!
//! Gauge snapshot of a node pool plus a small latency reservoir used to
//! derive wait and usage percentiles.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default number of samples kept per histogram
pub const DEFAULT_RESERVOIR: usize = 1024;

/// Point-in-time gauges of one node pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Connections currently open
    pub total_connections: u32,
    /// Open connections sitting idle in the pool
    pub idle_connections: u32,
    /// Open connections lent out to callers
    pub active_connections: u32,
    /// Callers waiting for a connection
    pub pending_connections: u32,
    /// 95th percentile time spent waiting for a connection
    pub wait_p95_ms: Option<f64>,
    /// 95th percentile time a connection stayed borrowed
    pub usage_p95_ms: Option<f64>,
}

/// Bounded reservoir of the most recent latency samples
#[derive(Debug)]
pub struct LatencyHistogram {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl LatencyHistogram {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Record a sample, evicting the oldest once full
    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nearest-rank percentile (0-100) of the recorded samples
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        let rank = ((percentile.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[index])
    }

    /// 95th percentile in fractional milliseconds
    pub fn p95_ms(&self) -> Option<f64> {
        self.percentile(95.0).map(|d| d.as_secs_f64() * 1000.0)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVOIR)
    }
}
