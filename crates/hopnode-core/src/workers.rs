//! Background Workers
//!
//! Four periodic loops keep the node record and metrics current:
//!
//! | Loop            | Default | Work                                            |
//! |-----------------|---------|-------------------------------------------------|
//! | heartbeat       | 30s     | peer count, node status, heartbeat timestamp    |
//! | session monitor | 60s     | hop sessions, keepalives, expire idle sessions  |
//! | metrics         | 15s     | CPU/memory, load score, node gauges             |
//! | traffic         | 1s      | byte counters → rate, bandwidth, samples        |
//!
//! Each loop is its own task with its own ticker. All of them watch one
//! shutdown signal and are joined by [`Workers::shutdown`].

use crate::metrics::{self, MetricsSink};
use crate::session::SessionCoordinator;
use crate::store::{NodePatch, NodeStatus, TrafficRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Loop periods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerIntervals {
    pub heartbeat_secs: u64,
    pub session_monitor_secs: u64,
    pub metrics_secs: u64,
    pub traffic_secs: u64,
    /// Sessions silent for longer than this are disconnected
    pub stale_session_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            session_monitor_secs: 60,
            metrics_secs: 15,
            traffic_secs: 1,
            stale_session_secs: 600,
        }
    }
}

/// Composite node load, 0 (idle) to 100 (saturated)
pub fn load_score(connections: u32, max_connections: u32, cpu_percent: f32, memory_percent: f32) -> f64 {
    let utilisation = if max_connections == 0 {
        1.0
    } else {
        connections as f64 / max_connections as f64
    };
    let score = 50.0 * utilisation + 0.3 * cpu_percent as f64 + 0.2 * memory_percent as f64;
    score.min(100.0)
}

/// Turns cumulative byte counters into a rate
#[derive(Debug, Default)]
pub struct TrafficSampler {
    last: Option<(u64, u64, Instant)>,
    bandwidth_mbps: f64,
}

impl TrafficSampler {
    /// Record counters read at `at`; returns bits/s since the previous read.
    ///
    /// The first read only sets the baseline. A counter that went backwards
    /// (interface recreated) counts as no traffic.
    pub fn sample(&mut self, sent: u64, received: u64, at: Instant) -> Option<f64> {
        let previous = self.last.replace((sent, received, at));
        let (prev_sent, prev_received, prev_at) = previous?;

        let elapsed = at.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let delta = sent.saturating_sub(prev_sent) + received.saturating_sub(prev_received);
        let rate = 8.0 * delta as f64 / elapsed;
        self.bandwidth_mbps = rate / 1_000_000.0;
        Some(rate)
    }

    pub fn bandwidth_mbps(&self) -> f64 {
        self.bandwidth_mbps
    }
}

/// State shared by the loops
pub struct WorkerContext {
    coordinator: Arc<SessionCoordinator>,
    metrics: Arc<dyn MetricsSink>,
    intervals: WorkerIntervals,
    /// Separate from the session lock so sampling never waits on session churn
    sampler: Mutex<TrafficSampler>,
}

impl WorkerContext {
    pub fn new(coordinator: Arc<SessionCoordinator>, metrics: Arc<dyn MetricsSink>, intervals: WorkerIntervals) -> Self {
        Self {
            coordinator,
            metrics,
            intervals,
            sampler: Mutex::new(TrafficSampler::default()),
        }
    }

    fn node_id(&self) -> &str {
        self.coordinator.node_id()
    }

    /// A panic mid-sample leaves at worst one stale baseline, so keep going
    fn sampler(&self) -> MutexGuard<'_, TrafficSampler> {
        self.sampler.lock().unwrap_or_else(|poisoned| {
            warn!("Traffic sampler lock poisoned, recovering");
            self.sampler.clear_poison();
            poisoned.into_inner()
        })
    }

    fn bandwidth_mbps(&self) -> f64 {
        self.sampler().bandwidth_mbps()
    }

    /// Report liveness and peer count
    pub async fn heartbeat(&self) {
        let peers = self.coordinator.interface().peer_count().await;
        let patch = NodePatch {
            status: Some(NodeStatus::Online),
            last_heartbeat: Some(Utc::now()),
            ..NodePatch::default()
        };

        if let Err(e) = self.coordinator.repository().patch_node(self.node_id(), &patch).await {
            warn!("Heartbeat for {} not recorded: {}", self.node_id(), e);
            return;
        }

        self.metrics.gauge(metrics::REGISTERED_PEERS, peers as f64);
        self.metrics.gauge(metrics::NODE_STATUS, NodeStatus::Online.gauge_value());
        debug!("Heartbeat: {} peers on {}", peers, self.node_id());
    }

    /// Pick up hop sessions, refresh keepalives, then expire idle sessions
    pub async fn monitor_sessions(&self) {
        match self.coordinator.realize_hop_sessions().await {
            Ok(0) => {}
            Ok(n) => info!("Activated {} hop sessions", n),
            Err(e) => warn!("Hop sessions not checked: {}", e),
        }

        match self.coordinator.interface().stats().await {
            Ok(stats) => {
                let touched = self.coordinator.refresh_keepalives(&stats.peers).await;
                trace!("{} keepalives refreshed", touched);
            }
            Err(e) => warn!("Could not read peer handshakes: {}", e),
        }

        let max_idle = chrono::Duration::seconds(self.intervals.stale_session_secs as i64);
        let expired = self.coordinator.expire_stale(max_idle).await;
        if expired > 0 {
            info!("Expired {} idle sessions", expired);
        }
    }

    /// Sample host load and publish node gauges
    pub async fn collect_metrics(&self, system: &mut System) {
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu = system.global_cpu_usage();
        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        let repo = self.coordinator.repository();
        let node = match repo.get_node(self.node_id()).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!("Node {} missing from store, skipping metrics", self.node_id());
                return;
            }
            Err(e) => {
                warn!("Could not load node {}: {}", self.node_id(), e);
                return;
            }
        };

        let load = load_score(node.current_connections, node.max_connections, cpu, memory);
        let bandwidth = self.bandwidth_mbps();
        let patch = NodePatch {
            load_score: Some(load),
            cpu_usage: Some(cpu),
            memory_usage: Some(memory),
            bandwidth_mbps: Some(bandwidth),
            ..NodePatch::default()
        };
        if let Err(e) = repo.patch_node(self.node_id(), &patch).await {
            warn!("Node metrics for {} not recorded: {}", self.node_id(), e);
        }

        self.metrics.gauge(metrics::NODE_STATUS, node.status.gauge_value());
        self.metrics.gauge(metrics::NODE_LOAD, load);
        self.metrics.gauge(metrics::NODE_CPU, cpu as f64);
        self.metrics.gauge(metrics::NODE_MEMORY, memory as f64);
        self.metrics.gauge(metrics::NODE_BANDWIDTH, bandwidth);
        debug!("Load {:.1} (cpu {:.1}%, mem {:.1}%, {} conns)", load, cpu, memory, node.current_connections);
    }

    /// Read interface counters and persist a traffic sample
    pub async fn sample_traffic(&self) {
        let stats = match self.coordinator.interface().stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("Traffic counters unavailable: {}", e);
                return;
            }
        };

        let (sent, received) = (stats.bytes_sent(), stats.bytes_received());
        let rate = self.sampler().sample(sent, received, Instant::now());
        let Some(rate) = rate else { return };

        self.metrics.gauge(metrics::NODE_BANDWIDTH, rate / 1_000_000.0);

        let record = TrafficRecord {
            node_id: self.node_id().to_string(),
            bytes_sent: sent,
            bytes_received: received,
            rate_bps: rate,
            sampled_at: Utc::now(),
        };
        if let Err(e) = self.coordinator.repository().record_traffic(&record).await {
            debug!("Traffic sample dropped: {}", e);
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Handle to the running loops
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Start every loop
    pub fn spawn(ctx: Arc<WorkerContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let intervals = ctx.intervals.clone();
        let mut handles = Vec::with_capacity(4);

        let (c, mut rx, mut tick) = (ctx.clone(), shutdown.subscribe(), ticker(intervals.heartbeat_secs));
        handles.push(("heartbeat", tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick.tick() => c.heartbeat().await,
                    _ = stopped(&mut rx) => break,
                }
            }
        })));

        let (c, mut rx, mut tick) = (ctx.clone(), shutdown.subscribe(), ticker(intervals.session_monitor_secs));
        handles.push(("session-monitor", tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick.tick() => c.monitor_sessions().await,
                    _ = stopped(&mut rx) => break,
                }
            }
        })));

        let (c, mut rx, mut tick) = (ctx.clone(), shutdown.subscribe(), ticker(intervals.metrics_secs));
        handles.push(("metrics", tokio::spawn(async move {
            let mut system = System::new();
            loop {
                tokio::select! {
                    _ = tick.tick() => c.collect_metrics(&mut system).await,
                    _ = stopped(&mut rx) => break,
                }
            }
        })));

        let (c, mut rx, mut tick) = (ctx, shutdown.subscribe(), ticker(intervals.traffic_secs));
        handles.push(("traffic", tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick.tick() => c.sample_traffic().await,
                    _ = stopped(&mut rx) => break,
                }
            }
        })));

        info!("Started {} background workers", handles.len());
        Self { shutdown, handles }
    }

    /// Receiver for other components that stop with the workers
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every loop and wait for all of them
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker {} ended abnormally: {}", name, e);
            }
        }
        info!("Background workers stopped");
    }
}
