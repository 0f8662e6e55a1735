//! Session Coordinator
//!
//! Drives the tunnel session lifecycle on this node:
//!
//! ```text
//! create_session ──► pending ──► active ──► disconnected
//!                       │
//!                       └── peer registration failed: record deleted
//! ```
//!
//! Address allocation and reservation happen under the session write lock,
//! so concurrent creates never hand out the same tunnel address. The
//! record is persisted and the peer registered after the lock is released.

use crate::interface::{InterfaceError, PeerConfig, PeerStats, TunnelInterface};
use crate::keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
use crate::metrics::{self, MetricsSink};
use crate::multihop::{HopChain, MultiHopRouter, RouteError};
use crate::store::{NodeRecord, Repository, SessionFilter, SessionStatus, StoreError, TunnelSession};
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Persistent keepalive pushed to every peer (seconds)
    pub keepalive_secs: u16,
    /// Generate a pre-shared key per session
    pub preshared_keys: bool,
    /// DNS servers handed to clients
    pub client_dns: Vec<IpAddr>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 25,
            preshared_keys: true,
            client_dns: vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
        }
    }
}

/// Everything a client needs to bring its side of the tunnel up.
///
/// The client private key only ever exists here; it is not persisted.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session: TunnelSession,
    pub client_private_key: PrivateKey,
    pub preshared_key: Option<PresharedKey>,
    pub server_public_key: PublicKey,
    pub endpoint: String,
    pub dns: Vec<IpAddr>,
    pub keepalive_secs: u16,
}

impl SessionGrant {
    /// Render as a `wg-quick` client configuration
    pub fn client_config(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", self.client_private_key.to_base64());
        let _ = writeln!(out, "Address = {}/32", self.session.tunnel_address);
        if !self.dns.is_empty() {
            let dns = self.dns.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(", ");
            let _ = writeln!(out, "DNS = {}", dns);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", self.server_public_key.to_base64());
        if let Some(psk) = &self.preshared_key {
            let _ = writeln!(out, "PresharedKey = {}", psk.to_base64());
        }
        let _ = writeln!(out, "Endpoint = {}", self.endpoint);
        let _ = writeln!(out, "AllowedIPs = 0.0.0.0/0, ::/0");
        let _ = writeln!(out, "PersistentKeepalive = {}", self.keepalive_secs);
        out
    }
}

/// Session lifecycle owner for one node
pub struct SessionCoordinator {
    node_id: String,
    config: SessionConfig,
    interface: Arc<TunnelInterface>,
    repo: Arc<dyn Repository>,
    metrics: Arc<dyn MetricsSink>,
    router: Option<Arc<MultiHopRouter>>,
    sessions: RwLock<HashMap<Uuid, TunnelSession>>,
}

impl SessionCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        config: SessionConfig,
        interface: Arc<TunnelInterface>,
        repo: Arc<dyn Repository>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            interface,
            repo,
            metrics,
            router: None,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Enable multi-hop sessions
    pub fn with_router(mut self, router: Arc<MultiHopRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn interface(&self) -> &Arc<TunnelInterface> {
        &self.interface
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    async fn node(&self) -> Result<NodeRecord, SessionError> {
        self.repo.get_node(&self.node_id).await?
            .ok_or_else(|| SessionError::NodeNotFound(self.node_id.clone()))
    }

    /// Create a single-hop session for `user_id`
    pub async fn create_session(&self, user_id: &str, protocol: &str) -> Result<SessionGrant, SessionError> {
        self.create(user_id, protocol, None).await
    }

    /// Build a chain through `countries` with this node as its entry.
    ///
    /// The client's session is created here. Every later hop gets a pending
    /// record whose peer is the hop before it; each hop's coordinator turns
    /// its record into a live peer with [`realize_hop_sessions`].
    ///
    /// [`realize_hop_sessions`]: SessionCoordinator::realize_hop_sessions
    pub async fn create_multihop_session(
        &self,
        user_id: &str,
        countries: &[&str],
        protocol: &str,
    ) -> Result<(HopChain, SessionGrant), SessionError> {
        let router = self.router.as_ref().ok_or(SessionError::MultihopUnavailable)?;
        let chain = router.build_chain(user_id, countries, protocol).await?;

        let result = if chain.entry().id != self.node_id {
            warn!("Chain {} enters at {}, not {}", chain.id, chain.entry().id, self.node_id);
            Err(SessionError::NotChainEntry {
                chain: chain.id,
                entry: chain.entry().id.clone(),
            })
        } else {
            self.create_chain_sessions(&chain, user_id, protocol).await
        };

        match result {
            Ok(grant) => Ok((chain, grant)),
            Err(e) => {
                if let Err(de) = router.deactivate_chain(chain.id).await {
                    warn!("Failed to deactivate chain {} after session error: {}", chain.id, de);
                }
                Err(e)
            }
        }
    }

    async fn create_chain_sessions(
        &self,
        chain: &HopChain,
        user_id: &str,
        protocol: &str,
    ) -> Result<SessionGrant, SessionError> {
        let grant = self.create(user_id, protocol, Some(chain.id)).await?;

        let now = Utc::now();
        let mut upstream = self.interface.public_key().to_base64();
        let mut pending = Vec::with_capacity(chain.hop_count() - 1);
        for hop in &chain.nodes[1..] {
            let record = TunnelSession {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                node_id: hop.id.clone(),
                protocol: protocol.to_string(),
                tunnel_address: Ipv4Addr::UNSPECIFIED,
                peer_public_key: std::mem::replace(&mut upstream, hop.public_key.clone()),
                status: SessionStatus::Pending,
                connected_at: now,
                last_keepalive: now,
                disconnected_at: None,
                hop_chain_id: Some(chain.id),
            };

            if let Err(e) = self.repo.insert_session(&record).await {
                error!("Failed to persist hop session on {} for chain {}: {}", hop.id, chain.id, e);
                for id in pending {
                    if let Err(de) = self.repo.delete_session(id).await {
                        warn!("Failed to delete hop session {}: {}", id, de);
                    }
                }
                if let Err(de) = self.disconnect_session(grant.session.id).await {
                    warn!("Failed to roll back session {}: {}", grant.session.id, de);
                }
                return Err(e.into());
            }
            pending.push(record.id);
        }

        debug!("Chain {}: {} hop sessions pending", chain.id, pending.len());
        Ok(grant)
    }

    async fn create(&self, user_id: &str, protocol: &str, chain: Option<Uuid>) -> Result<SessionGrant, SessionError> {
        let node = self.node().await?;
        let keypair = KeyPair::generate();
        let now = Utc::now();

        let mut session = {
            let mut sessions = self.sessions.write().await;

            let address = self.reserve_address(&sessions, &node)?;

            let session = TunnelSession {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                node_id: self.node_id.clone(),
                protocol: protocol.to_string(),
                tunnel_address: address,
                peer_public_key: keypair.public.to_base64(),
                status: SessionStatus::Pending,
                connected_at: now,
                last_keepalive: now,
                disconnected_at: None,
                hop_chain_id: chain,
            };
            sessions.insert(session.id, session.clone());
            session
        };

        session.status = SessionStatus::Active;
        if let Err(e) = self.repo.insert_session(&session).await {
            error!("Failed to persist session {}: {}", session.id, e);
            self.sessions.write().await.remove(&session.id);
            return Err(e.into());
        }

        let preshared = self.config.preshared_keys.then(PresharedKey::generate);
        let mut peer = PeerConfig::for_host(keypair.public, session.tunnel_address);
        peer.keepalive = Some(self.config.keepalive_secs);
        peer.preshared_key = preshared.clone();

        if let Err(e) = self.interface.add_peer(peer).await {
            error!("Peer registration failed for session {}, rolling back: {}", session.id, e);
            if let Err(de) = self.repo.delete_session(session.id).await {
                error!("Failed to delete session record {}: {}", session.id, de);
            }
            self.sessions.write().await.remove(&session.id);
            return Err(e.into());
        }

        if let Some(entry) = self.sessions.write().await.get_mut(&session.id) {
            entry.status = SessionStatus::Active;
        }

        if let Err(e) = self.repo.adjust_connections(&self.node_id, 1).await {
            warn!("Failed to bump connection count on {}: {}", self.node_id, e);
        }
        self.metrics.increment(metrics::SESSIONS_CREATED, 1);
        self.metrics.gauge(metrics::ACTIVE_SESSIONS, self.active_count().await as f64);

        info!(
            "Session {} created for {} on {} ({})",
            session.id, user_id, self.node_id, session.tunnel_address
        );

        Ok(SessionGrant {
            session,
            client_private_key: keypair.private,
            preshared_key: preshared,
            server_public_key: self.interface.public_key(),
            endpoint: node.endpoint,
            dns: self.config.client_dns.clone(),
            keepalive_secs: self.config.keepalive_secs,
        })
    }

    /// Capacity check plus address allocation; caller holds the write lock
    fn reserve_address(
        &self,
        sessions: &HashMap<Uuid, TunnelSession>,
        node: &NodeRecord,
    ) -> Result<Ipv4Addr, SessionError> {
        let held = sessions.values().filter(|s| s.node_id == self.node_id).count() as u32;
        let current = node.current_connections.max(held);
        if current >= node.max_connections {
            warn!("Node {} is full ({}/{})", self.node_id, current, node.max_connections);
            return Err(SessionError::NodeFull {
                current,
                max: node.max_connections,
            });
        }

        let used: HashSet<Ipv4Addr> = sessions.values()
            .filter(|s| s.node_id == self.node_id)
            .map(|s| s.tunnel_address)
            .collect();
        self.allocate_address(node.subnet, &used)
    }

    /// First free host address in `subnet`, skipping the server's own
    fn allocate_address(&self, subnet: Ipv4Network, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, SessionError> {
        let server = self.interface.address().ip();
        let (network, broadcast) = (subnet.network(), subnet.broadcast());
        let mut hosts = subnet.iter().filter(|a| *a != network && *a != broadcast);
        // the first host is reserved for the server
        hosts.next();

        hosts
            .find(|addr| *addr != server && !used.contains(addr))
            .ok_or(SessionError::AddressPoolExhausted(subnet))
    }

    /// Tear a session down
    pub async fn disconnect_session(&self, id: Uuid) -> Result<TunnelSession, SessionError> {
        let mut session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&id) {
                Some(s) if s.status == SessionStatus::Active => {}
                _ => return Err(SessionError::NotFound(id)),
            }
            sessions.remove(&id).ok_or(SessionError::NotFound(id))?
        };

        match PublicKey::from_base64(&session.peer_public_key) {
            Ok(key) => match self.interface.remove_peer(&key).await {
                Ok(()) => {}
                Err(InterfaceError::PeerNotFound(_)) => {
                    debug!("Peer for session {} was already gone", id);
                }
                Err(e) => warn!("Failed to remove peer for session {}: {}", id, e),
            },
            Err(e) => warn!("Session {} has an unusable peer key: {}", id, e),
        }

        let now = Utc::now();
        session.status = SessionStatus::Disconnected;
        session.disconnected_at = Some(now);
        if let Err(e) = self.repo.update_session(&session).await {
            error!("Failed to persist disconnect of {}: {}", id, e);
        }
        if let Err(e) = self.repo.adjust_connections(&self.node_id, -1).await {
            warn!("Failed to drop connection count on {}: {}", self.node_id, e);
        }

        self.metrics.increment(metrics::SESSIONS_DISCONNECTED, 1);
        self.metrics.gauge(metrics::ACTIVE_SESSIONS, self.active_count().await as f64);
        info!("Session {} disconnected after {}s", id, (now - session.connected_at).num_seconds());
        Ok(session)
    }

    /// Mark a session as alive now
    pub async fn record_keepalive(&self, id: Uuid) -> Result<(), SessionError> {
        self.touch(id, Utc::now()).await
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SessionError> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id)
                .filter(|s| s.status == SessionStatus::Active)
                .ok_or(SessionError::NotFound(id))?;
            if at <= session.last_keepalive {
                return Ok(());
            }
            session.last_keepalive = at;
            session.clone()
        };
        self.repo.update_session(&updated).await?;
        Ok(())
    }

    /// Advance keepalives from peer handshake times; returns sessions touched
    pub async fn refresh_keepalives(&self, peers: &[PeerStats]) -> usize {
        let handshakes: HashMap<&str, DateTime<Utc>> = peers.iter()
            .filter_map(|p| p.last_handshake.map(|at| (p.public_key.as_str(), at)))
            .collect();

        let candidates: Vec<(Uuid, DateTime<Utc>)> = self.sessions.read().await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .filter_map(|s| {
                handshakes.get(s.peer_public_key.as_str())
                    .filter(|at| **at > s.last_keepalive)
                    .map(|at| (s.id, *at))
            })
            .collect();

        let mut touched = 0;
        for (id, at) in candidates {
            match self.touch(id, at).await {
                Ok(()) => touched += 1,
                Err(e) => debug!("Keepalive refresh for {} skipped: {}", id, e),
            }
        }
        touched
    }

    /// Disconnect sessions silent for longer than `max_idle`
    pub async fn expire_stale(&self, max_idle: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_idle;
        let stale: Vec<Uuid> = self.sessions.read().await
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.last_keepalive < cutoff)
            .map(|s| s.id)
            .collect();

        let mut expired = 0;
        for id in stale {
            info!("Session {} idle past {}s, expiring", id, max_idle.num_seconds());
            match self.disconnect_session(id).await {
                Ok(_) => expired += 1,
                Err(e) => debug!("Expiry of {} skipped: {}", id, e),
            }
        }
        if expired > 0 {
            self.metrics.increment(metrics::SESSIONS_EXPIRED, expired as u64);
        }
        expired
    }

    pub async fn session(&self, id: Uuid) -> Option<TunnelSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<TunnelSession> {
        self.sessions.read().await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    /// Reload active sessions for this node and re-register their peers.
    ///
    /// Pre-shared keys are not persisted, so restored peers run without one.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let records = self.repo.find_sessions(&SessionFilter::active_on(&self.node_id)).await?;
        let mut restored = 0;

        for mut record in records {
            let registered = match PublicKey::from_base64(&record.peer_public_key) {
                Ok(key) => {
                    let mut peer = PeerConfig::for_host(key, record.tunnel_address);
                    peer.keepalive = Some(self.config.keepalive_secs);
                    self.interface.add_peer(peer).await.map_err(SessionError::from)
                }
                Err(e) => Err(SessionError::from(e)),
            };

            match registered {
                Ok(()) => {
                    self.sessions.write().await.insert(record.id, record);
                    restored += 1;
                }
                Err(e) => {
                    warn!("Could not restore session {}: {}", record.id, e);
                    record.status = SessionStatus::Disconnected;
                    record.disconnected_at = Some(Utc::now());
                    if let Err(e) = self.repo.update_session(&record).await {
                        error!("Failed to close unrestorable session {}: {}", record.id, e);
                    }
                }
            }
        }

        self.sync_connection_count().await;
        info!("Restored {} sessions on {}", restored, self.node_id);
        self.metrics.gauge(metrics::ACTIVE_SESSIONS, self.active_count().await as f64);
        Ok(restored)
    }

    /// Set the registry's connection counter to the live session count.
    ///
    /// A restarted node re-registers with a zero counter while its restored
    /// sessions are still connected.
    async fn sync_connection_count(&self) {
        let live = self.active_count().await as i64;
        let recorded = match self.repo.get_node(&self.node_id).await {
            Ok(Some(node)) => node.current_connections as i64,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not read connection count on {}: {}", self.node_id, e);
                return;
            }
        };

        if live != recorded {
            debug!("Connection count on {}: {} -> {}", self.node_id, recorded, live);
            if let Err(e) = self.repo.adjust_connections(&self.node_id, live - recorded).await {
                warn!("Failed to sync connection count on {}: {}", self.node_id, e);
            }
        }
    }

    /// Register peers for pending hop sessions assigned to this node
    pub async fn realize_hop_sessions(&self) -> Result<usize, SessionError> {
        let filter = SessionFilter {
            node_id: Some(self.node_id.clone()),
            user_id: None,
            status: Some(SessionStatus::Pending),
        };
        let pending: Vec<TunnelSession> = self.repo.find_sessions(&filter).await?
            .into_iter()
            .filter(|s| s.hop_chain_id.is_some())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let node = self.node().await?;
        let mut realized = 0;
        for record in pending {
            let id = record.id;
            match self.realize(record, &node).await {
                Ok(session) => {
                    info!(
                        "Hop session {} for chain {:?} active on {} ({})",
                        id, session.hop_chain_id, self.node_id, session.tunnel_address
                    );
                    realized += 1;
                }
                Err(e) => warn!("Could not realize hop session {}: {}", id, e),
            }
        }

        if realized > 0 {
            self.metrics.gauge(metrics::ACTIVE_SESSIONS, self.active_count().await as f64);
        }
        Ok(realized)
    }

    async fn realize(&self, mut record: TunnelSession, node: &NodeRecord) -> Result<TunnelSession, SessionError> {
        let key = match PublicKey::from_base64(&record.peer_public_key) {
            Ok(key) => key,
            Err(e) => {
                self.close_record(&mut record).await;
                return Err(e.into());
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            match self.reserve_address(&sessions, node) {
                Ok(address) => record.tunnel_address = address,
                Err(e) => {
                    drop(sessions);
                    self.close_record(&mut record).await;
                    return Err(e);
                }
            }
            sessions.insert(record.id, record.clone());
        }

        let mut peer = PeerConfig::for_host(key, record.tunnel_address);
        peer.keepalive = Some(self.config.keepalive_secs);
        if let Err(e) = self.interface.add_peer(peer).await {
            self.sessions.write().await.remove(&record.id);
            self.close_record(&mut record).await;
            return Err(e.into());
        }

        record.status = SessionStatus::Active;
        record.last_keepalive = Utc::now();
        if let Err(e) = self.repo.update_session(&record).await {
            error!("Failed to persist hop session {}: {}", record.id, e);
        }
        if let Some(entry) = self.sessions.write().await.get_mut(&record.id) {
            *entry = record.clone();
        }
        if let Err(e) = self.repo.adjust_connections(&self.node_id, 1).await {
            warn!("Failed to bump connection count on {}: {}", self.node_id, e);
        }
        self.metrics.increment(metrics::SESSIONS_CREATED, 1);
        Ok(record)
    }

    async fn close_record(&self, record: &mut TunnelSession) {
        record.status = SessionStatus::Disconnected;
        record.disconnected_at = Some(Utc::now());
        if let Err(e) = self.repo.update_session(record).await {
            error!("Failed to close session record {}: {}", record.id, e);
        }
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Node {0} is not registered")]
    NodeNotFound(String),

    #[error("Node is at capacity ({current}/{max})")]
    NodeFull { current: u32, max: u32 },

    #[error("No free tunnel address in {0}")]
    AddressPoolExhausted(Ipv4Network),

    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Multi-hop routing is not configured")]
    MultihopUnavailable,

    #[error("Chain {chain} enters at {entry}, not at this node")]
    NotChainEntry { chain: Uuid, entry: String },

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}
