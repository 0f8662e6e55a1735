//! Multi-Hop Routing
//!
//! Builds chains of 2-4 relay nodes (double/triple VPN) where traffic
//! enters in one country and leaves in another.
//!
//! # Selection
//!
//! For each requested country, in order, the online multihop-capable node
//! with the lowest load score is picked, skipping nodes already in the
//! chain. The finished chain is validated before it is returned:
//!
//! - every hop is healthy (online, recent heartbeat)
//! - no two hops share a country or a city
//!
//! # Cost
//!
//! | Hops | Speed factor |
//! |------|--------------|
//! | 2    | 0.70         |
//! | 3    | 0.50         |
//! | 4    | 0.35         |

use crate::store::{ChainRecord, ChainStatus, NodeFilter, NodeRecord, NodeStatus, Repository, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MIN_HOPS: usize = 2;
pub const MAX_HOPS: usize = 4;

/// Router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Upper bound for one chain build
    pub build_timeout_secs: u64,
    /// Chains estimated above this are logged
    pub latency_warn_ms: u32,
    /// Added per hop to the summed node latency
    pub per_hop_overhead_ms: u32,
    /// Node heartbeat period; a node is stale after three missed beats
    pub heartbeat_interval_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            build_timeout_secs: 5,
            latency_warn_ms: 200,
            per_hop_overhead_ms: 5,
            heartbeat_interval_secs: 30,
        }
    }
}

impl RouterConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// Fraction of single-hop throughput kept by a chain of `hops` nodes
pub fn speed_reduction(hops: usize) -> f64 {
    match hops {
        2 => 0.70,
        3 => 0.50,
        4 => 0.35,
        _ => 0.70,
    }
}

/// A validated chain of relay nodes
#[derive(Debug, Clone)]
pub struct HopChain {
    pub id: Uuid,
    pub user_id: String,
    /// Entry first, exit last
    pub nodes: Vec<NodeRecord>,
    pub protocol: String,
    pub estimated_latency_ms: u32,
    pub speed_factor: f64,
    pub created_at: DateTime<Utc>,
}

impl HopChain {
    pub fn entry(&self) -> &NodeRecord {
        &self.nodes[0]
    }

    pub fn exit(&self) -> &NodeRecord {
        &self.nodes[self.nodes.len() - 1]
    }

    pub fn middle(&self) -> &[NodeRecord] {
        &self.nodes[1..self.nodes.len() - 1]
    }

    pub fn hop_count(&self) -> usize {
        self.nodes.len()
    }

    /// Country codes, entry to exit
    pub fn route(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.country.as_str()).collect()
    }

    pub fn to_record(&self) -> ChainRecord {
        ChainRecord {
            id: self.id,
            user_id: self.user_id.clone(),
            entry_node: self.entry().id.clone(),
            middle_nodes: self.middle().iter().map(|n| n.id.clone()).collect(),
            exit_node: self.exit().id.clone(),
            protocol: self.protocol.clone(),
            status: ChainStatus::Active,
            estimated_latency_ms: self.estimated_latency_ms,
            speed_factor: self.speed_factor,
            created_at: self.created_at,
        }
    }
}

/// Chain builder and validator
pub struct MultiHopRouter {
    repo: Arc<dyn Repository>,
    config: RouterConfig,
}

impl MultiHopRouter {
    pub fn new(repo: Arc<dyn Repository>, config: RouterConfig) -> Self {
        Self { repo, config }
    }

    /// Entry in one country, exit in another
    pub async fn build_double_hop(
        &self,
        user_id: &str,
        entry_country: &str,
        exit_country: &str,
        protocol: &str,
    ) -> Result<HopChain, RouteError> {
        self.build_chain(user_id, &[entry_country, exit_country], protocol).await
    }

    /// Entry, middle and exit across exactly three countries
    pub async fn build_triple_hop(
        &self,
        user_id: &str,
        countries: [&str; 3],
        protocol: &str,
    ) -> Result<HopChain, RouteError> {
        self.build_chain(user_id, &countries, protocol).await
    }

    /// Build, validate and persist a chain through `countries`
    pub async fn build_chain(
        &self,
        user_id: &str,
        countries: &[&str],
        protocol: &str,
    ) -> Result<HopChain, RouteError> {
        if !(MIN_HOPS..=MAX_HOPS).contains(&countries.len()) {
            return Err(RouteError::InvalidHopCount(countries.len()));
        }

        let timeout = self.config.build_timeout();
        match tokio::time::timeout(timeout, self.assemble(user_id, countries, protocol)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Chain build for {} timed out after {:?}", user_id, timeout);
                Err(RouteError::Timeout(timeout))
            }
        }
    }

    async fn assemble(&self, user_id: &str, countries: &[&str], protocol: &str) -> Result<HopChain, RouteError> {
        let pool = self.repo.list_nodes(&NodeFilter::multihop_pool()).await?;
        debug!("Building {}-hop chain from a pool of {} nodes", countries.len(), pool.len());

        let mut chosen: Vec<NodeRecord> = Vec::with_capacity(countries.len());
        for country in countries {
            let node = pool.iter()
                .filter(|n| n.country.eq_ignore_ascii_case(country))
                .filter(|n| !chosen.iter().any(|c| c.id == n.id))
                .min_by(|a, b| a.load_score.total_cmp(&b.load_score))
                .ok_or_else(|| RouteError::NoNodeAvailable(country.to_string()))?;
            chosen.push(node.clone());
        }

        self.validate_chain(&chosen)?;

        let latency = self.estimate_latency(&chosen);
        if latency > self.config.latency_warn_ms {
            warn!("High latency chain: {}ms estimated across {} hops", latency, chosen.len());
        }

        let chain = HopChain {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            speed_factor: speed_reduction(chosen.len()),
            nodes: chosen,
            protocol: protocol.to_string(),
            estimated_latency_ms: latency,
            created_at: Utc::now(),
        };

        self.repo.insert_chain(&chain.to_record()).await?;
        info!(
            "Built {}-hop chain {} for {}: {}",
            chain.hop_count(), chain.id, user_id, chain.route().join(" -> ")
        );
        Ok(chain)
    }

    fn is_healthy(&self, node: &NodeRecord, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::seconds((self.config.heartbeat_interval_secs * 3) as i64);
        node.status == NodeStatus::Online
            && node.last_heartbeat.is_some_and(|beat| now - beat <= grace)
    }

    /// Check health and geographic diversity of a candidate chain
    pub fn validate_chain(&self, nodes: &[NodeRecord]) -> Result<(), RouteError> {
        let now = Utc::now();
        if let Some(node) = nodes.iter().find(|n| !self.is_healthy(n, now)) {
            return Err(RouteError::Unhealthy(node.id.clone()));
        }

        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                if a.country.eq_ignore_ascii_case(&b.country) || a.city.eq_ignore_ascii_case(&b.city) {
                    return Err(RouteError::InsufficientDiversity {
                        first: a.id.clone(),
                        second: b.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Summed node latency plus a fixed per-hop overhead
    pub fn estimate_latency(&self, nodes: &[NodeRecord]) -> u32 {
        let base: u32 = nodes.iter().map(|n| n.latency_ms).sum();
        base + nodes.len() as u32 * self.config.per_hop_overhead_ms
    }

    pub async fn deactivate_chain(&self, id: Uuid) -> Result<ChainRecord, RouteError> {
        let mut chain = self.repo.get_chain(id).await?
            .ok_or(RouteError::ChainNotFound(id))?;
        chain.status = ChainStatus::Inactive;
        self.repo.update_chain(&chain).await?;
        info!("Deactivated chain {}", id);
        Ok(chain)
    }

    pub async fn chains_for_user(&self, user_id: &str) -> Result<Vec<ChainRecord>, RouteError> {
        Ok(self.repo.chains_for_user(user_id).await?)
    }
}

/// Routing errors
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("A chain needs 2 to 4 hops, got {0}")]
    InvalidHopCount(usize),

    #[error("No available node in {0}")]
    NoNodeAvailable(String),

    #[error("Node {0} is unhealthy")]
    Unhealthy(String),

    #[error("Insufficient geographic diversity between {first} and {second}")]
    InsufficientDiversity { first: String, second: String },

    #[error("Chain build timed out after {0:?}")]
    Timeout(Duration),

    #[error("Chain not found: {0}")]
    ChainNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{sample_node, MemoryStore};
    use crate::testing::SlowStore;

    async fn router_with(nodes: Vec<NodeRecord>) -> (MultiHopRouter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for node in &nodes {
            store.put_node(node).await.unwrap();
        }
        (MultiHopRouter::new(store.clone(), RouterConfig::default()), store)
    }

    fn loaded(id: &str, country: &str, city: &str, load: f64) -> NodeRecord {
        let mut node = sample_node(id, country, city);
        node.load_score = load;
        node
    }

    #[tokio::test]
    async fn test_double_hop_picks_least_loaded() {
        let (router, store) = router_with(vec![
            loaded("de-1", "DE", "Frankfurt", 40.0),
            loaded("de-2", "DE", "Berlin", 12.0),
            loaded("ch-1", "CH", "Zurich", 30.0),
        ])
        .await;

        let chain = router.build_double_hop("alice", "DE", "CH", "wireguard").await.unwrap();
        assert_eq!(chain.entry().id, "de-2");
        assert_eq!(chain.exit().id, "ch-1");
        assert!(chain.middle().is_empty());
        assert_eq!(chain.estimated_latency_ms, 20 + 20 + 2 * 5);
        assert_eq!(chain.speed_factor, 0.70);

        let stored = store.chains_for_user("alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].entry_node, "de-2");
    }

    #[tokio::test]
    async fn test_same_country_is_rejected() {
        let (router, store) = router_with(vec![
            loaded("de-1", "DE", "Frankfurt", 10.0),
            loaded("de-2", "DE", "Berlin", 20.0),
        ])
        .await;

        let err = router.build_double_hop("bob", "DE", "DE", "wireguard").await.unwrap_err();
        assert!(matches!(err, RouteError::InsufficientDiversity { .. }));
        assert!(store.chains_for_user("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_city_is_rejected() {
        let (router, _) = router_with(vec![
            loaded("a", "US", "Springfield", 10.0),
            loaded("b", "CA", "Springfield", 10.0),
        ])
        .await;

        assert!(matches!(
            router.build_double_hop("carol", "US", "CA", "wireguard").await,
            Err(RouteError::InsufficientDiversity { .. })
        ));
    }

    #[tokio::test]
    async fn test_triple_hop_and_missing_country() {
        let (router, _) = router_with(vec![
            loaded("se-1", "SE", "Stockholm", 10.0),
            loaded("is-1", "IS", "Reykjavik", 10.0),
            loaded("ch-1", "CH", "Zurich", 10.0),
        ])
        .await;

        let chain = router.build_triple_hop("dave", ["SE", "IS", "CH"], "wireguard").await.unwrap();
        assert_eq!(chain.route(), vec!["SE", "IS", "CH"]);
        assert_eq!(chain.middle().len(), 1);
        assert_eq!(chain.speed_factor, 0.50);

        assert!(matches!(
            router.build_double_hop("dave", "SE", "JP", "wireguard").await,
            Err(RouteError::NoNodeAvailable(c)) if c == "JP"
        ));
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_unhealthy() {
        let mut stale = loaded("nl-1", "NL", "Amsterdam", 5.0);
        stale.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(120));
        let (router, _) = router_with(vec![stale, loaded("ch-1", "CH", "Zurich", 10.0)]).await;

        assert!(matches!(
            router.build_double_hop("erin", "NL", "CH", "wireguard").await,
            Err(RouteError::Unhealthy(id)) if id == "nl-1"
        ));
    }

    #[tokio::test]
    async fn test_hop_count_bounds() {
        let (router, _) = router_with(vec![]).await;
        assert!(matches!(router.build_chain("f", &["DE"], "wg").await, Err(RouteError::InvalidHopCount(1))));
        assert!(matches!(
            router.build_chain("f", &["A", "B", "C", "D", "E"], "wg").await,
            Err(RouteError::InvalidHopCount(5))
        ));
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
        let config = RouterConfig {
            build_timeout_secs: 0,
            ..Default::default()
        };
        let router = MultiHopRouter::new(store, config);
        assert!(matches!(
            router.build_double_hop("g", "DE", "CH", "wireguard").await,
            Err(RouteError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivate_chain() {
        let (router, _) = router_with(vec![
            loaded("de-1", "DE", "Frankfurt", 10.0),
            loaded("ch-1", "CH", "Zurich", 10.0),
        ])
        .await;

        let chain = router.build_double_hop("h", "DE", "CH", "wireguard").await.unwrap();
        let record = router.deactivate_chain(chain.id).await.unwrap();
        assert_eq!(record.status, ChainStatus::Inactive);
        assert_eq!(router.chains_for_user("h").await.unwrap()[0].status, ChainStatus::Inactive);

        assert!(matches!(router.deactivate_chain(Uuid::new_v4()).await, Err(RouteError::ChainNotFound(_))));
    }

    #[test]
    fn test_speed_reduction() {
        assert_eq!(speed_reduction(2), 0.70);
        assert_eq!(speed_reduction(3), 0.50);
        assert_eq!(speed_reduction(4), 0.35);
        assert_eq!(speed_reduction(1), 0.70);
        assert_eq!(speed_reduction(7), 0.70);
    }
}
