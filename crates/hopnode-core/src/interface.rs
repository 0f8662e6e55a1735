//! Tunnel Interface Manager
//!
//! Owns one kernel WireGuard interface on the node: its key material,
//! the peer table and the byte counters reported by `wg show dump`.
//!
//! # Setup sequence
//!
//! ```text
//! ip link add ─▶ wg set private-key ─▶ wg set listen-port ─▶ ip address add
//!      ─▶ ip link set up ─▶ post-up commands (in order)
//! ```
//!
//! Every applied step is recorded; if a later step fails the recorded
//! steps are reversed, newest first, before the error is returned.

use crate::exec::{CommandError, CommandRunner, CommandSpec};
use crate::keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Server-side interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface name (e.g. `wg0`)
    pub name: String,
    /// Server private key (base64). Generated when absent.
    pub private_key: Option<String>,
    /// UDP listen port
    pub listen_port: u16,
    /// Server address and the subnet clients are allocated from
    pub address: Ipv4Network,
    pub mtu: Option<u16>,
    /// Commands run after the interface is up, in order
    pub post_up: Vec<String>,
    /// Undo commands; `post_down[i]` reverses `post_up[i]`
    pub post_down: Vec<String>,
    /// Directory for key files handed to the tunnel tool
    pub key_dir: PathBuf,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        let server = Ipv4Addr::new(10, 8, 0, 1);
        Self {
            name: "wg0".to_string(),
            private_key: None,
            listen_port: 51820,
            address: Ipv4Network::new(server, 24).unwrap_or_else(|_| Ipv4Network::from(server)),
            mtu: None,
            post_up: Vec::new(),
            post_down: Vec::new(),
            key_dir: PathBuf::from("/etc/hopnode"),
        }
    }
}

/// A peer registered on the interface
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    /// Addresses routed to this peer
    pub allowed_ips: Vec<IpNetwork>,
    pub preshared_key: Option<PresharedKey>,
    /// Persistent keepalive interval (seconds)
    pub keepalive: Option<u16>,
    pub endpoint: Option<SocketAddr>,
}

impl PeerConfig {
    /// Peer with a single allowed host address and a 25s keepalive
    pub fn for_host(public_key: PublicKey, address: Ipv4Addr) -> Self {
        Self {
            public_key,
            allowed_ips: vec![IpNetwork::V4(Ipv4Network::from(address))],
            preshared_key: None,
            keepalive: Some(25),
            endpoint: None,
        }
    }
}

/// Counters for one peer, as reported by the tunnel tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Interface-wide counters
#[derive(Debug, Clone, Default)]
pub struct InterfaceStats {
    pub peers: Vec<PeerStats>,
}

impl InterfaceStats {
    pub fn bytes_sent(&self) -> u64 {
        self.peers.iter().map(|p| p.bytes_sent).sum()
    }

    pub fn bytes_received(&self) -> u64 {
        self.peers.iter().map(|p| p.bytes_received).sum()
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "peers: {}, TX: {:.2}MB, RX: {:.2}MB",
            self.peers.len(),
            self.bytes_sent() as f64 / (1024.0 * 1024.0),
            self.bytes_received() as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Parse `wg show <iface> dump` output.
///
/// The first line describes the interface itself; each following line
/// is one peer with eight tab-separated columns:
/// public-key, preshared-key, endpoint, allowed-ips, latest-handshake,
/// transfer-rx, transfer-tx, persistent-keepalive.
pub fn parse_dump(dump: &str) -> Vec<PeerStats> {
    dump.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 8 {
                return None;
            }

            let handshake: i64 = cols[4].trim().parse().unwrap_or(0);
            let last_handshake = if handshake > 0 {
                Utc.timestamp_opt(handshake, 0).single()
            } else {
                None
            };

            Some(PeerStats {
                public_key: cols[0].to_string(),
                endpoint: match cols[2] {
                    "(none)" | "" => None,
                    ep => Some(ep.to_string()),
                },
                allowed_ips: match cols[3] {
                    "(none)" | "" => Vec::new(),
                    ips => ips.split(',').map(|s| s.trim().to_string()).collect(),
                },
                last_handshake,
                bytes_received: cols[5].trim().parse().unwrap_or(0),
                bytes_sent: cols[6].trim().parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Snapshot of the interface bookkeeping
#[derive(Debug, Clone)]
pub struct NodeInterfaceState {
    pub interface_name: String,
    pub public_key: PublicKey,
    pub listen_port: u16,
    pub peers: Vec<PublicKey>,
    pub up: bool,
}

#[derive(Default)]
struct PeerTable {
    peers: HashMap<PublicKey, PeerConfig>,
    up: bool,
}

/// Manages one tunnel interface through the `ip` and `wg` tools
pub struct TunnelInterface {
    config: InterfaceConfig,
    keypair: KeyPair,
    runner: Arc<dyn CommandRunner>,
    table: RwLock<PeerTable>,
}

impl TunnelInterface {
    /// Create the manager; the interface itself is created by [`create`](Self::create)
    pub fn new(config: InterfaceConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, InterfaceError> {
        let private = match &config.private_key {
            Some(encoded) => PrivateKey::from_base64(encoded)?,
            None => {
                info!("No server key configured for {}, generating one", config.name);
                PrivateKey::generate()
            }
        };

        Ok(Self {
            keypair: KeyPair::from_private(private),
            config,
            runner,
            table: RwLock::new(PeerTable::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    /// Server address inside the tunnel subnet
    pub fn address(&self) -> Ipv4Network {
        self.config.address
    }

    fn key_path(&self) -> PathBuf {
        self.config.key_dir.join(format!("{}.key", self.config.name))
    }

    fn cmd<const N: usize>(program: &str, args: [&str; N]) -> CommandSpec {
        CommandSpec::new(program, args)
    }

    /// Create the interface and bring it up
    pub async fn create(&self) -> Result<(), InterfaceError> {
        let name = self.config.name.clone();
        info!("Creating tunnel interface {} on port {}", name, self.config.listen_port);

        let mut undo: Vec<CommandSpec> = Vec::new();
        match self.apply_setup(&mut undo).await {
            Ok(()) => {
                self.table.write().await.up = true;
                info!("Tunnel interface {} is up ({})", name, self.keypair.public);
                Ok(())
            }
            Err(e) => {
                error!("Interface setup failed, rolling back {} steps: {}", undo.len(), e);
                self.rollback(undo).await;
                Err(e)
            }
        }
    }

    async fn apply_setup(&self, undo: &mut Vec<CommandSpec>) -> Result<(), InterfaceError> {
        let name = self.config.name.as_str();

        self.runner.run(&Self::cmd("ip", ["link", "add", "dev", name, "type", "wireguard"])).await?;
        undo.push(Self::cmd("ip", ["link", "delete", "dev", name]));

        let key_path = self.key_path();
        write_secret(&key_path, &self.keypair.private.to_base64()).await?;
        let key_arg = key_path.to_string_lossy().into_owned();
        self.runner.run(&Self::cmd("wg", ["set", name, "private-key", key_arg.as_str()])).await?;

        let port = self.config.listen_port.to_string();
        self.runner.run(&Self::cmd("wg", ["set", name, "listen-port", port.as_str()])).await?;

        let address = self.config.address.to_string();
        self.runner.run(&Self::cmd("ip", ["address", "add", address.as_str(), "dev", name])).await?;

        if let Some(mtu) = self.config.mtu {
            let mtu = mtu.to_string();
            self.runner.run(&Self::cmd("ip", ["link", "set", "mtu", mtu.as_str(), "dev", name])).await?;
        }

        self.runner.run(&Self::cmd("ip", ["link", "set", "up", "dev", name])).await?;
        undo.push(Self::cmd("ip", ["link", "set", "down", "dev", name]));

        for (i, line) in self.config.post_up.iter().enumerate() {
            let command = CommandSpec::parse(line)
                .ok_or_else(|| InterfaceError::InvalidCommand(line.clone()))?;
            debug!("post-up[{}]: {}", i, command);
            self.runner.run(&command).await?;

            if let Some(down) = self.config.post_down.get(i).and_then(|l| CommandSpec::parse(l)) {
                undo.push(down);
            }
        }

        Ok(())
    }

    async fn rollback(&self, undo: Vec<CommandSpec>) {
        for command in undo.into_iter().rev() {
            if let Err(e) = self.runner.run(&command).await {
                warn!("Rollback step `{}` failed: {}", command, e);
            }
        }
        let _ = tokio::fs::remove_file(self.key_path()).await;
    }

    /// Tear the interface down (best effort)
    pub async fn destroy(&self) {
        let name = self.config.name.as_str();
        info!("Destroying tunnel interface {}", name);

        for line in self.config.post_down.iter().rev() {
            if let Some(command) = CommandSpec::parse(line) {
                if let Err(e) = self.runner.run(&command).await {
                    warn!("post-down `{}` failed: {}", command, e);
                }
            }
        }

        if let Err(e) = self.runner.run(&Self::cmd("ip", ["link", "delete", "dev", name])).await {
            warn!("Failed to delete interface {}: {}", name, e);
        }

        let _ = tokio::fs::remove_file(self.key_path()).await;

        let mut table = self.table.write().await;
        table.peers.clear();
        table.up = false;
    }

    /// Register (or update) a peer
    pub async fn add_peer(&self, peer: PeerConfig) -> Result<(), InterfaceError> {
        let name = self.config.name.as_str();
        let key = peer.public_key.to_base64();

        let allowed = peer.allowed_ips.iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut args = vec![
            "set".to_string(), name.to_string(),
            "peer".to_string(), key.clone(),
            "allowed-ips".to_string(), allowed,
        ];
        if let Some(keepalive) = peer.keepalive {
            args.push("persistent-keepalive".to_string());
            args.push(keepalive.to_string());
        }
        if let Some(endpoint) = peer.endpoint {
            args.push("endpoint".to_string());
            args.push(endpoint.to_string());
        }

        let psk_path = match &peer.preshared_key {
            Some(psk) => {
                let path = self.config.key_dir.join(format!("{}.psk", uuid::Uuid::new_v4()));
                write_secret(&path, &psk.to_base64()).await?;
                args.push("preshared-key".to_string());
                args.push(path.to_string_lossy().into_owned());
                Some(path)
            }
            None => None,
        };

        let result = self.runner.run(&CommandSpec::new("wg", args)).await;

        if let Some(path) = psk_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        result?;

        debug!("Peer {:?} registered on {}", peer.public_key, name);
        self.table.write().await.peers.insert(peer.public_key, peer);
        Ok(())
    }

    /// Deregister a peer. Absent peers are reported as [`InterfaceError::PeerNotFound`].
    pub async fn remove_peer(&self, public_key: &PublicKey) -> Result<(), InterfaceError> {
        if !self.table.read().await.peers.contains_key(public_key) {
            return Err(InterfaceError::PeerNotFound(public_key.to_base64()));
        }

        let key = public_key.to_base64();
        self.runner
            .run(&Self::cmd("wg", ["set", self.config.name.as_str(), "peer", key.as_str(), "remove"]))
            .await?;

        self.table.write().await.peers.remove(public_key);
        debug!("Peer {:?} removed from {}", public_key, self.config.name);
        Ok(())
    }

    /// Per-peer counters
    pub async fn stats(&self) -> Result<InterfaceStats, InterfaceError> {
        let dump = self.runner
            .run(&Self::cmd("wg", ["show", self.config.name.as_str(), "dump"]))
            .await?;
        Ok(InterfaceStats { peers: parse_dump(&dump) })
    }

    pub async fn has_peer(&self, public_key: &PublicKey) -> bool {
        self.table.read().await.peers.contains_key(public_key)
    }

    pub async fn peer_count(&self) -> usize {
        self.table.read().await.peers.len()
    }

    pub async fn peers(&self) -> Vec<PublicKey> {
        self.table.read().await.peers.keys().copied().collect()
    }

    pub async fn state(&self) -> NodeInterfaceState {
        let table = self.table.read().await;
        NodeInterfaceState {
            interface_name: self.config.name.clone(),
            public_key: self.keypair.public,
            listen_port: self.config.listen_port,
            peers: table.peers.keys().copied().collect(),
            up: table.up,
        }
    }
}

async fn write_secret(path: &std::path::Path, contents: &str) -> Result<(), InterfaceError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await
            .map_err(|e| InterfaceError::KeyFile(format!("{}: {}", dir.display(), e)))?;
    }
    tokio::fs::write(path, contents).await
        .map_err(|e| InterfaceError::KeyFile(format!("{}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
            .map_err(|e| InterfaceError::KeyFile(format!("{}: {}", path.display(), e)))?;
    }

    Ok(())
}

/// Interface errors
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Invalid post-up command: {0:?}")]
    InvalidCommand(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    fn test_config() -> InterfaceConfig {
        InterfaceConfig {
            key_dir: std::env::temp_dir().join(format!("hopnode-test-{}", uuid::Uuid::new_v4())),
            post_up: vec![
                "iptables -A FORWARD -i wg0 -j ACCEPT".into(),
                "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE".into(),
            ],
            post_down: vec![
                "iptables -D FORWARD -i wg0 -j ACCEPT".into(),
                "iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE".into(),
            ],
            ..InterfaceConfig::default()
        }
    }

    fn setup() -> (Arc<ScriptedRunner>, TunnelInterface) {
        let runner = Arc::new(ScriptedRunner::new());
        let iface = TunnelInterface::new(test_config(), runner.clone()).unwrap();
        (runner, iface)
    }

    #[tokio::test]
    async fn test_create_runs_steps_in_order() {
        let (runner, iface) = setup();
        iface.create().await.unwrap();

        let cmds = runner.commands();
        assert_eq!(cmds[0], "ip link add dev wg0 type wireguard");
        assert!(cmds[1].starts_with("wg set wg0 private-key "));
        assert_eq!(cmds[2], "wg set wg0 listen-port 51820");
        assert_eq!(cmds[3], "ip address add 10.8.0.1/24 dev wg0");
        assert_eq!(cmds[4], "ip link set up dev wg0");
        assert_eq!(cmds[5], "iptables -A FORWARD -i wg0 -j ACCEPT");
        assert_eq!(cmds[6], "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE");
        assert!(iface.state().await.up);

        iface.destroy().await;
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_post_up_failure() {
        let (runner, iface) = setup();
        runner.fail_on("POSTROUTING -o eth0 -j MASQUERADE");

        let err = iface.create().await;
        assert!(matches!(err, Err(InterfaceError::Command(_))));
        assert!(!iface.state().await.up);

        let cmds = runner.commands();
        let tail: Vec<&str> = cmds.iter().rev().take(3).map(|s| s.as_str()).collect();
        assert_eq!(tail, vec![
            "ip link delete dev wg0",
            "ip link set down dev wg0",
            "iptables -D FORWARD -i wg0 -j ACCEPT",
        ]);
        // the failed step itself is not undone
        assert_eq!(runner.count_matching("-D POSTROUTING"), 0);
    }

    #[tokio::test]
    async fn test_create_failure_before_anything_applied() {
        let (runner, iface) = setup();
        runner.fail_on("ip link add");

        assert!(iface.create().await.is_err());
        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let (runner, iface) = setup();
        let client = KeyPair::generate();
        let mut peer = PeerConfig::for_host(client.public, "10.8.0.2".parse().unwrap());
        peer.preshared_key = Some(PresharedKey::generate());

        iface.add_peer(peer).await.unwrap();
        assert_eq!(iface.peer_count().await, 1);
        assert!(iface.has_peer(&client.public).await);

        let add = runner.commands().pop().unwrap();
        assert!(add.contains(&format!("peer {} allowed-ips 10.8.0.2/32 persistent-keepalive 25", client.public)));
        assert!(add.contains("preshared-key"));

        iface.remove_peer(&client.public).await.unwrap();
        assert_eq!(iface.peer_count().await, 0);

        // second removal is an error the caller must tolerate
        let err = iface.remove_peer(&client.public).await;
        assert!(matches!(err, Err(InterfaceError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_add_does_not_register() {
        let (runner, iface) = setup();
        runner.fail_on("allowed-ips");

        let client = KeyPair::generate();
        let peer = PeerConfig::for_host(client.public, "10.8.0.9".parse().unwrap());
        assert!(iface.add_peer(peer).await.is_err());
        assert_eq!(iface.peer_count().await, 0);
    }

    #[test]
    fn test_parse_dump() {
        let dump = "cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n\
                    AAAA=\t(none)\t203.0.113.5:40000\t10.8.0.2/32\t1700000000\t1024\t2048\t25\n\
                    BBBB=\t(none)\t(none)\t10.8.0.3/32,fd00::3/128\t0\t0\t0\toff\n";
        let peers = parse_dump(dump);

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, "AAAA=");
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.5:40000"));
        assert_eq!(peers[0].bytes_received, 1024);
        assert_eq!(peers[0].bytes_sent, 2048);
        assert_eq!(peers[0].last_handshake.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].allowed_ips.len(), 2);
        assert!(peers[1].last_handshake.is_none());

        let stats = InterfaceStats { peers };
        assert_eq!(stats.bytes_sent(), 2048);
        assert_eq!(stats.bytes_received(), 1024);
    }

    #[test]
    fn test_parse_short_dump() {
        assert!(parse_dump("").is_empty());
        assert!(parse_dump("only-interface-line\t1\t2\t3").is_empty());
        assert!(parse_dump("iface\nAAAA=\t(none)\ttoo-short").is_empty());
    }

    #[tokio::test]
    async fn test_stats_from_runner() {
        let (runner, iface) = setup();
        runner.respond("dump", "iface\tpub\t51820\toff\nAAAA=\t(none)\t(none)\t10.8.0.2/32\t0\t10\t20\t25\n");

        let stats = iface.stats().await.unwrap();
        assert_eq!(stats.peers.len(), 1);
        assert_eq!(stats.bytes_sent(), 20);
    }

    #[test]
    fn test_configured_key_is_used() {
        let keypair = KeyPair::generate();
        let config = InterfaceConfig {
            private_key: Some(keypair.private.to_base64()),
            ..test_config()
        };
        let iface = TunnelInterface::new(config, Arc::new(ScriptedRunner::new())).unwrap();
        assert_eq!(iface.public_key(), keypair.public);

        let bad = InterfaceConfig { private_key: Some("nope".into()), ..test_config() };
        assert!(TunnelInterface::new(bad, Arc::new(ScriptedRunner::new())).is_err());
    }
}
