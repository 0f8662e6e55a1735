//! Node Configuration
//!
//! One [`NodeConfig`] describes a relay node: its identity in the fleet,
//! the tunnel interface, session defaults, background loop periods, host
//! policies, obfuscation, chain building and the optional SOCKS5 relay.
//!
//! Loaded from TOML or JSON (picked by file extension). Every field has a
//! default, so a file only needs the values that differ.
//!
//! ```toml
//! command_timeout_secs = 10
//!
//! [node]
//! id = "fra-01"
//! country = "DE"
//! city = "Frankfurt"
//! endpoint = "203.0.113.10:51820"
//!
//! [interface]
//! name = "wg0"
//! address = "10.8.0.1/24"
//!
//! [policy]
//! kill_switch = true
//! ```

use crate::interface::InterfaceConfig;
use crate::multihop::RouterConfig;
use crate::obfuscation::ObfuscationConfig;
use crate::policy::SplitTunnelConfig;
use crate::proxy::ProxyConfig;
use crate::session::SessionConfig;
use crate::store::{NodeRecord, NodeStatus};
use crate::workers::WorkerIntervals;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Longest interface name the kernel accepts
const MAX_INTERFACE_NAME: usize = 15;

/// This node's identity in the fleet registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeIdentity {
    pub id: String,
    pub name: String,
    pub country: String,
    pub city: String,
    /// Public endpoint clients dial (host:port)
    pub endpoint: String,
    pub max_connections: u32,
    pub multihop_capable: bool,
    /// Advertised base latency used when ranking chains
    pub latency_ms: u32,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            name: "hopnode".to_string(),
            country: "XX".to_string(),
            city: "Unknown".to_string(),
            endpoint: "127.0.0.1:51820".to_string(),
            max_connections: 250,
            multihop_capable: true,
            latency_ms: 0,
        }
    }
}

/// Host policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Enable the kill switch at startup
    pub kill_switch: bool,
    /// Resolvers the kill switch keeps reachable
    pub dns: Vec<IpAddr>,
    /// Enable WebRTC leak blocking at startup
    pub webrtc_protection: bool,
    pub split_tunnel: SplitTunnelConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kill_switch: false,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
            webrtc_protection: false,
            split_tunnel: SplitTunnelConfig::default(),
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Upper bound for any external command (seconds)
    pub command_timeout_secs: u64,
    pub node: NodeIdentity,
    pub interface: InterfaceConfig,
    pub sessions: SessionConfig,
    pub workers: WorkerIntervals,
    pub policy: PolicyConfig,
    pub obfuscation: ObfuscationConfig,
    pub multihop: RouterConfig,
    pub socks: ProxyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 10,
            node: NodeIdentity::default(),
            interface: InterfaceConfig::default(),
            sessions: SessionConfig::default(),
            workers: WorkerIntervals::default(),
            policy: PolicyConfig::default(),
            obfuscation: ObfuscationConfig::default(),
            multihop: RouterConfig::default(),
            socks: ProxyConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML or JSON file, chosen by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let content = std::fs::read_to_string(path)?;
        let config = match ext.as_str() {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        info!("Loaded node config {} from {}", config.node.id, path.display());
        Ok(config)
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Template with every field at its default
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.command_timeout_secs == 0 {
            return invalid("command_timeout_secs must be positive".into());
        }
        if self.node.id.trim().is_empty() {
            return invalid("node.id must not be empty".into());
        }
        if self.node.max_connections == 0 {
            return invalid("node.max_connections must be positive".into());
        }

        let name = &self.interface.name;
        if name.is_empty() || name.len() > MAX_INTERFACE_NAME {
            return invalid(format!("interface.name {:?} must be 1-{} characters", name, MAX_INTERFACE_NAME));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
            return invalid(format!("interface.name {:?} contains invalid characters", name));
        }
        if self.interface.listen_port == 0 {
            return invalid("interface.listen_port must be positive".into());
        }
        if self.interface.address.prefix() > 30 {
            return invalid(format!("interface.address {} leaves no room for clients", self.interface.address));
        }
        if self.interface.post_down.len() > self.interface.post_up.len() {
            return invalid("interface.post_down has more entries than post_up".into());
        }

        if self.sessions.keepalive_secs == 0 {
            return invalid("sessions.keepalive_secs must be positive".into());
        }

        let w = &self.workers;
        for (field, value) in [
            ("heartbeat_secs", w.heartbeat_secs),
            ("session_monitor_secs", w.session_monitor_secs),
            ("metrics_secs", w.metrics_secs),
            ("traffic_secs", w.traffic_secs),
        ] {
            if value == 0 {
                return invalid(format!("workers.{} must be positive", field));
            }
        }

        if matches!(&self.obfuscation.scramble_key, Some(k) if k.is_empty()) {
            return invalid("obfuscation.scramble_key must not be empty".into());
        }

        if self.multihop.build_timeout_secs == 0 {
            return invalid("multihop.build_timeout_secs must be positive".into());
        }

        if self.socks.username.is_some() != self.socks.password.is_some() {
            return invalid("socks.username and socks.password must be set together".into());
        }
        if self.socks.max_connections == 0 || self.socks.buffer_size == 0 {
            return invalid("socks.max_connections and socks.buffer_size must be positive".into());
        }
        if self.socks.handshake_timeout_secs == 0 {
            return invalid("socks.handshake_timeout_secs must be positive".into());
        }

        let split = &self.policy.split_tunnel;
        for rule in split.include.iter().chain(split.exclude.iter()) {
            rule.validate().map_err(|e| ConfigError::Invalid(format!("policy.split_tunnel: {}", e)))?;
        }

        Ok(())
    }

    /// Registry record for this node, as announced at startup
    pub fn node_record(&self, public_key: &str) -> NodeRecord {
        NodeRecord {
            id: self.node.id.clone(),
            name: self.node.name.clone(),
            country: self.node.country.clone(),
            city: self.node.city.clone(),
            endpoint: self.node.endpoint.clone(),
            public_key: public_key.to_string(),
            subnet: Ipv4Network::new(self.interface.address.network(), self.interface.address.prefix())
                .unwrap_or(self.interface.address),
            status: NodeStatus::Online,
            active: true,
            multihop_capable: self.node.multihop_capable,
            current_connections: 0,
            max_connections: self.node.max_connections,
            load_score: 0.0,
            latency_ms: self.node.latency_ms,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            bandwidth_mbps: 0.0,
            last_heartbeat: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
