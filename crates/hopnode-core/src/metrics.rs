//! Metrics Sink
//!
//! Named counters and gauges. [`MetricsRegistry`] keeps the latest
//! values in memory; an exporter can read them via [`MetricsRegistry::snapshot`].

use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::trace;

pub const SESSIONS_CREATED: &str = "hopnode_sessions_created_total";
pub const SESSIONS_DISCONNECTED: &str = "hopnode_sessions_disconnected_total";
pub const SESSIONS_EXPIRED: &str = "hopnode_sessions_expired_total";
pub const ACTIVE_SESSIONS: &str = "hopnode_active_sessions";
pub const NODE_STATUS: &str = "hopnode_node_status";
pub const NODE_LOAD: &str = "hopnode_node_load_score";
pub const NODE_CPU: &str = "hopnode_node_cpu_percent";
pub const NODE_MEMORY: &str = "hopnode_node_memory_percent";
pub const NODE_BANDWIDTH: &str = "hopnode_node_bandwidth_mbps";
pub const REGISTERED_PEERS: &str = "hopnode_registered_peers";

/// Destination for counters and gauges
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, by: u64);
    fn gauge(&self, name: &str, value: f64);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _by: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

/// In-memory metrics registry
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, u64>>,
    gauges: RwLock<BTreeMap<String, f64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().ok().and_then(|c| c.get(name).copied()).unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.read().ok().and_then(|g| g.get(name).copied())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().map(|c| c.clone()).unwrap_or_default(),
            gauges: self.gauges.read().map(|g| g.clone()).unwrap_or_default(),
        }
    }

    /// Render in a plain `name value` text format
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        for (name, value) in &snapshot.counters {
            out.push_str(&format!("{} {}\n", name, value));
        }
        for (name, value) in &snapshot.gauges {
            out.push_str(&format!("{} {}\n", name, value));
        }
        out
    }
}

impl MetricsSink for MetricsRegistry {
    fn increment(&self, name: &str, by: u64) {
        if let Ok(mut counters) = self.counters.write() {
            let entry = counters.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(by);
            trace!("{} += {} ({})", name, by, *entry);
        }
    }

    fn gauge(&self, name: &str, value: f64) {
        if let Ok(mut gauges) = self.gauges.write() {
            gauges.insert(name.to_string(), value);
            trace!("{} = {}", name, value);
        }
    }
}
