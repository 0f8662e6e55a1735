//! Persistence Boundary
//!
//! The core only depends on [`Repository`]: record CRUD by primary key
//! plus a few composite filters. [`MemoryStore`] keeps everything in
//! process and backs both the daemon's standalone mode and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;
use uuid::Uuid;

/// Node operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
}

impl NodeStatus {
    /// Numeric form published as a gauge
    pub fn gauge_value(&self) -> f64 {
        match self {
            NodeStatus::Online => 1.0,
            NodeStatus::Maintenance => 0.5,
            NodeStatus::Offline => 0.0,
        }
    }
}

/// A relay node as stored by the fleet registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub country: String,
    pub city: String,
    /// Public endpoint clients dial (host:port)
    pub endpoint: String,
    /// Server public key (base64)
    pub public_key: String,
    /// Subnet tunnel addresses are allocated from
    pub subnet: Ipv4Network,
    pub status: NodeStatus,
    pub active: bool,
    pub multihop_capable: bool,
    pub current_connections: u32,
    pub max_connections: u32,
    /// Lower is better
    pub load_score: f64,
    pub latency_ms: u32,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub bandwidth_mbps: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn is_full(&self) -> bool {
        self.current_connections >= self.max_connections
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Disconnected,
}

/// One user's tunnel through this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSession {
    pub id: Uuid,
    pub user_id: String,
    pub node_id: String,
    pub protocol: String,
    pub tunnel_address: Ipv4Addr,
    /// Client public key (base64)
    pub peer_public_key: String,
    pub status: SessionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_keepalive: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub hop_chain_id: Option<Uuid>,
}

/// Hop chain status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Active,
    Inactive,
}

/// Persisted multi-hop chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: Uuid,
    pub user_id: String,
    pub entry_node: String,
    pub middle_nodes: Vec<String>,
    pub exit_node: String,
    pub protocol: String,
    pub status: ChainStatus,
    pub estimated_latency_ms: u32,
    pub speed_factor: f64,
    pub created_at: DateTime<Utc>,
}

/// One traffic sample for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub node_id: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rate_bps: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Node query filter; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub active: Option<bool>,
    pub multihop_capable: Option<bool>,
    pub country: Option<String>,
}

impl NodeFilter {
    /// Nodes eligible for hop chains
    pub fn multihop_pool() -> Self {
        Self {
            status: Some(NodeStatus::Online),
            active: Some(true),
            multihop_capable: Some(true),
            country: None,
        }
    }

    fn matches(&self, node: &NodeRecord) -> bool {
        self.status.is_none_or(|s| node.status == s)
            && self.active.is_none_or(|a| node.active == a)
            && self.multihop_capable.is_none_or(|m| node.multihop_capable == m)
            && self.country.as_deref().is_none_or(|c| node.country.eq_ignore_ascii_case(c))
    }
}

/// Partial node update; only `Some` fields are written
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub status: Option<NodeStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub load_score: Option<f64>,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
    pub bandwidth_mbps: Option<f64>,
}

/// Session query filter; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub node_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    /// Active sessions for one node
    pub fn active_on(node_id: &str) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            user_id: None,
            status: Some(SessionStatus::Active),
        }
    }

    fn matches(&self, session: &TunnelSession) -> bool {
        self.node_id.as_deref().is_none_or(|n| session.node_id == n)
            && self.user_id.as_deref().is_none_or(|u| session.user_id == u)
            && self.status.is_none_or(|s| session.status == s)
    }
}

/// Abstract record store consumed by the core
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, StoreError>;
    async fn put_node(&self, node: &NodeRecord) -> Result<(), StoreError>;
    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StoreError>;
    /// Apply telemetry fields without touching the connection counter
    async fn patch_node(&self, id: &str, patch: &NodePatch) -> Result<(), StoreError>;
    /// Atomically add `delta` to a node's connection counter (floored at 0)
    async fn adjust_connections(&self, node_id: &str, delta: i64) -> Result<u32, StoreError>;

    async fn insert_session(&self, session: &TunnelSession) -> Result<(), StoreError>;
    async fn update_session(&self, session: &TunnelSession) -> Result<(), StoreError>;
    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError>;
    async fn get_session(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError>;
    async fn find_sessions(&self, filter: &SessionFilter) -> Result<Vec<TunnelSession>, StoreError>;

    async fn insert_chain(&self, chain: &ChainRecord) -> Result<(), StoreError>;
    async fn update_chain(&self, chain: &ChainRecord) -> Result<(), StoreError>;
    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainRecord>, StoreError>;
    async fn chains_for_user(&self, user_id: &str) -> Result<Vec<ChainRecord>, StoreError>;

    async fn record_traffic(&self, sample: &TrafficRecord) -> Result<(), StoreError>;
}

/// In-process [`Repository`]
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    sessions: RwLock<HashMap<Uuid, TunnelSession>>,
    chains: RwLock<HashMap<Uuid, ChainRecord>>,
    traffic: RwLock<Vec<TrafficRecord>>,
    traffic_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_traffic_capacity(4096)
    }

    /// Keep at most `capacity` traffic samples (oldest dropped first)
    pub fn with_traffic_capacity(capacity: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            chains: RwLock::new(HashMap::new()),
            traffic: RwLock::new(Vec::new()),
            traffic_capacity: capacity,
        }
    }

    /// Most recent traffic samples, oldest first
    pub fn traffic_samples(&self) -> Vec<TrafficRecord> {
        self.traffic.read().map(|t| t.clone()).unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".into())
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.nodes.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn put_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.nodes.write().map_err(poisoned)?.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StoreError> {
        let nodes = self.nodes.read().map_err(poisoned)?;
        let mut out: Vec<NodeRecord> = nodes.values().filter(|n| filter.matches(n)).cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn patch_node(&self, id: &str, patch: &NodePatch) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        let node = nodes.get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
        if let Some(status) = patch.status {
            node.status = status;
        }
        if let Some(at) = patch.last_heartbeat {
            node.last_heartbeat = Some(at);
        }
        if let Some(load) = patch.load_score {
            node.load_score = load;
        }
        if let Some(cpu) = patch.cpu_usage {
            node.cpu_usage = cpu;
        }
        if let Some(mem) = patch.memory_usage {
            node.memory_usage = mem;
        }
        if let Some(bw) = patch.bandwidth_mbps {
            node.bandwidth_mbps = bw;
        }
        Ok(())
    }

    async fn adjust_connections(&self, node_id: &str, delta: i64) -> Result<u32, StoreError> {
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        let node = nodes.get_mut(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        let next = (node.current_connections as i64 + delta).max(0);
        node.current_connections = u32::try_from(next).unwrap_or(u32::MAX);
        Ok(node.current_connections)
    }

    async fn insert_session(&self, session: &TunnelSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {}", session.id)));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &TunnelSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {}", session.id))),
        }
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        self.sessions.write().map_err(poisoned)?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError> {
        Ok(self.sessions.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn find_sessions(&self, filter: &SessionFilter) -> Result<Vec<TunnelSession>, StoreError> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        Ok(sessions.values().filter(|s| filter.matches(s)).cloned().collect())
    }

    async fn insert_chain(&self, chain: &ChainRecord) -> Result<(), StoreError> {
        self.chains.write().map_err(poisoned)?.insert(chain.id, chain.clone());
        Ok(())
    }

    async fn update_chain(&self, chain: &ChainRecord) -> Result<(), StoreError> {
        let mut chains = self.chains.write().map_err(poisoned)?;
        if !chains.contains_key(&chain.id) {
            return Err(StoreError::NotFound(format!("chain {}", chain.id)));
        }
        chains.insert(chain.id, chain.clone());
        Ok(())
    }

    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainRecord>, StoreError> {
        Ok(self.chains.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn chains_for_user(&self, user_id: &str) -> Result<Vec<ChainRecord>, StoreError> {
        let chains = self.chains.read().map_err(poisoned)?;
        let mut out: Vec<ChainRecord> = chains.values().filter(|c| c.user_id == user_id).cloned().collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn record_traffic(&self, sample: &TrafficRecord) -> Result<(), StoreError> {
        let mut traffic = self.traffic.write().map_err(poisoned)?;
        if self.traffic_capacity == 0 {
            return Err(StoreError::Backend("traffic storage disabled".into()));
        }
        if traffic.len() >= self.traffic_capacity {
            traffic.remove(0);
        }
        traffic.push(sample.clone());
        Ok(())
    }
}

/// Store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
pub(crate) fn sample_node(id: &str, country: &str, city: &str) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        name: format!("{}-{}", country, id),
        country: country.to_string(),
        city: city.to_string(),
        endpoint: "198.51.100.10:51820".to_string(),
        public_key: crate::keys::KeyPair::generate().public.to_base64(),
        subnet: "10.8.0.0/24".parse().unwrap(),
        status: NodeStatus::Online,
        active: true,
        multihop_capable: true,
        current_connections: 0,
        max_connections: 100,
        load_score: 10.0,
        latency_ms: 20,
        cpu_usage: 0.0,
        memory_usage: 0.0,
        bandwidth_mbps: 0.0,
        last_heartbeat: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_filter() {
        let store = MemoryStore::new();
        let mut offline = sample_node("n2", "DE", "Berlin");
        offline.status = NodeStatus::Offline;
        store.put_node(&sample_node("n1", "DE", "Frankfurt")).await.unwrap();
        store.put_node(&offline).await.unwrap();
        store.put_node(&sample_node("n3", "NL", "Amsterdam")).await.unwrap();

        let pool = store.list_nodes(&NodeFilter::multihop_pool()).await.unwrap();
        assert_eq!(pool.len(), 2);

        let german = store
            .list_nodes(&NodeFilter { country: Some("de".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(german.len(), 2);
    }

    #[tokio::test]
    async fn test_adjust_connections_floors_at_zero() {
        let store = MemoryStore::new();
        store.put_node(&sample_node("n1", "DE", "Frankfurt")).await.unwrap();

        assert_eq!(store.adjust_connections("n1", 2).await.unwrap(), 2);
        assert_eq!(store.adjust_connections("n1", -5).await.unwrap(), 0);
        assert!(store.adjust_connections("missing", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_traffic_capacity() {
        let store = MemoryStore::with_traffic_capacity(2);
        for i in 0..3u64 {
            store
                .record_traffic(&TrafficRecord {
                    node_id: "n1".into(),
                    bytes_sent: i,
                    bytes_received: i,
                    rate_bps: 0.0,
                    sampled_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let samples = store.traffic_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].bytes_sent, 1);

        let disabled = MemoryStore::with_traffic_capacity(0);
        assert!(disabled.record_traffic(&samples[0]).await.is_err());
    }
}
