//! WebRTC Leak Protection
//!
//! Blocks STUN/TURN traffic that would leave outside the tunnel and reveal
//! the host's real address. Traffic on the tunnel interface is still allowed.

use super::{apply_rules, remove_rules, FirewallRule, HostPolicy, Platform, PolicyError};
use crate::exec::{CommandRunner, CommandSpec};
use crate::resolve::HostResolver;
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// STUN/TURN ports (3478-3479, 5349-5350, 19302-19309)
pub const STUN_PORTS: [u16; 12] = [
    3478, 3479, 5349, 5350, 19302, 19303, 19304, 19305, 19306, 19307, 19308, 19309,
];

/// Well-known public STUN servers
pub const STUN_HOSTS: [&str; 8] = [
    "stun.l.google.com",
    "stun1.l.google.com",
    "stun2.l.google.com",
    "stun3.l.google.com",
    "stun4.l.google.com",
    "stun.cloudflare.com",
    "global.stun.twilio.com",
    "stun.services.mozilla.com",
];

/// Nested under `com.apple/` so the stock `anchor "com.apple/*"` rule in
/// macOS's pf.conf evaluates it
const PF_ANCHOR: &str = "com.apple/hopnode.webrtc";
const PF_ANCHOR_FILE: &str = "hopnode.webrtc";
const NETSH_PREFIX: &str = "hopnode-webrtc";

/// Join [`STUN_PORTS`] with consecutive runs collapsed, e.g. `3478-3479`
fn port_list(separator: &str, range: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < STUN_PORTS.len() {
        let start = STUN_PORTS[i];
        let mut end = start;
        while i + 1 < STUN_PORTS.len() && STUN_PORTS[i + 1] == end + 1 {
            i += 1;
            end = STUN_PORTS[i];
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}{}{}", start, range, end));
        }
        i += 1;
    }
    parts.join(separator)
}

/// WebRTC leak guard
pub struct WebRtcGuard {
    interface: String,
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn HostResolver>,
    anchor_dir: PathBuf,
    applied: Mutex<Vec<FirewallRule>>,
}

impl WebRtcGuard {
    pub fn new(
        interface: impl Into<String>,
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            interface: interface.into(),
            platform,
            runner,
            resolver,
            anchor_dir: PathBuf::from("/etc/pf.anchors"),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Directory the pf anchor file is written to (darwin only)
    pub fn with_anchor_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.anchor_dir = dir.into();
        self
    }

    fn linux_rules(&self) -> Vec<FirewallRule> {
        let iface = self.interface.as_str();
        let ports = port_list(",", ":");
        let mut rules = Vec::new();

        let insert = |desc: String, rest: Vec<&str>| {
            let mut add = vec!["-I", "OUTPUT"];
            add.extend_from_slice(&rest);
            let mut del = vec!["-D", "OUTPUT"];
            del.extend_from_slice(&rest);
            FirewallRule::new(desc, CommandSpec::new("iptables", add), CommandSpec::new("iptables", del))
        };

        for proto in ["udp", "tcp"] {
            rules.push(insert(
                format!("block STUN/{} outside {}", proto, iface),
                vec!["!", "-o", iface, "-p", proto, "-m", "multiport", "--dports", ports.as_str(), "-j", "DROP"],
            ));
        }
        for host in STUN_HOSTS {
            rules.push(insert(
                format!("block {} outside {}", host, iface),
                vec!["!", "-o", iface, "-p", "udp", "-m", "string", "--string", host, "--algo", "bm", "-j", "DROP"],
            ));
        }
        // inserted last so they sit at the top of the chain
        for proto in ["udp", "tcp"] {
            rules.push(insert(
                format!("allow STUN/{} via {}", proto, iface),
                vec!["-o", iface, "-p", proto, "-m", "multiport", "--dports", ports.as_str(), "-j", "ACCEPT"],
            ));
        }
        rules
    }

    fn pf_anchor_path(&self) -> PathBuf {
        self.anchor_dir.join(PF_ANCHOR_FILE)
    }

    fn pf_ruleset(&self) -> String {
        let ports = port_list(" ", ":");
        let hosts = STUN_HOSTS.join(" ");
        format!(
            "pass out quick on {iface} proto {{ udp tcp }} to any port {{ {ports} }}\n\
             block drop out quick on ! {iface} proto {{ udp tcp }} to any port {{ {ports} }}\n\
             block drop out quick on ! {iface} proto {{ udp tcp }} to {{ {hosts} }}\n",
            iface = self.interface,
        )
    }

    async fn darwin_rules(&self) -> Result<Vec<FirewallRule>, PolicyError> {
        let path = self.pf_anchor_path();
        tokio::fs::create_dir_all(&self.anchor_dir).await?;
        tokio::fs::write(&path, self.pf_ruleset()).await?;
        debug!("Wrote pf anchor to {}", path.display());

        let path = path.display().to_string();
        Ok(vec![
            FirewallRule::new(
                "load pf anchor",
                CommandSpec::new("pfctl", ["-a", PF_ANCHOR, "-f", path.as_str()]),
                CommandSpec::new("pfctl", ["-a", PF_ANCHOR, "-F", "rules"]),
            ),
            FirewallRule::irreversible("enable pf", CommandSpec::new("pfctl", ["-E"])),
        ])
    }

    async fn resolve_hosts(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        for host in STUN_HOSTS {
            match self.resolver.resolve(host).await {
                Ok(resolved) => {
                    for addr in resolved {
                        if !addrs.contains(&addr) {
                            addrs.push(addr);
                        }
                    }
                }
                Err(e) => warn!("Could not resolve {}: {}", host, e),
            }
        }
        addrs
    }

    async fn windows_rules(&self) -> Result<Vec<FirewallRule>, PolicyError> {
        let ports = port_list(",", "-");
        let netsh = |name: &str, extra: &[String]| {
            let mut add = vec![
                "advfirewall".to_string(),
                "firewall".to_string(),
                "add".to_string(),
                "rule".to_string(),
                format!("name={}", name),
                "dir=out".to_string(),
            ];
            add.extend_from_slice(extra);
            let del = [
                "advfirewall".to_string(),
                "firewall".to_string(),
                "delete".to_string(),
                "rule".to_string(),
                format!("name={}", name),
            ];
            FirewallRule::new(
                format!("netsh rule {}", name),
                CommandSpec::new("netsh", add),
                CommandSpec::new("netsh", del),
            )
        };

        let mut rules = Vec::new();
        for proto in ["UDP", "TCP"] {
            for iface_type in ["lan", "wireless"] {
                let name = format!("{}-block-{}-{}", NETSH_PREFIX, proto.to_lowercase(), iface_type);
                rules.push(netsh(&name, &[
                    "action=block".to_string(),
                    format!("protocol={}", proto),
                    format!("remoteport={}", ports),
                    format!("interfacetype={}", iface_type),
                ]));
            }
        }

        let addrs = self.resolve_hosts().await;
        if addrs.is_empty() {
            warn!("No STUN host resolved, skipping address block");
        } else {
            let list = addrs.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(",");
            for iface_type in ["lan", "wireless"] {
                let name = format!("{}-block-hosts-{}", NETSH_PREFIX, iface_type);
                rules.push(netsh(&name, &[
                    "action=block".to_string(),
                    format!("remoteip={}", list),
                    format!("interfacetype={}", iface_type),
                ]));
            }
        }

        for proto in ["UDP", "TCP"] {
            let name = format!("{}-allow-{}-tunnel", NETSH_PREFIX, proto.to_lowercase());
            rules.push(netsh(&name, &[
                "action=allow".to_string(),
                format!("protocol={}", proto),
                format!("remoteport={}", ports),
                "interfacetype=ras".to_string(),
            ]));
        }
        Ok(rules)
    }

    /// The ordered rule plan for this platform
    pub async fn rules(&self) -> Result<Vec<FirewallRule>, PolicyError> {
        match self.platform {
            Platform::Linux => Ok(self.linux_rules()),
            Platform::Darwin => self.darwin_rules().await,
            Platform::Windows => self.windows_rules().await,
        }
    }
}

#[async_trait]
impl HostPolicy for WebRtcGuard {
    fn name(&self) -> &'static str {
        "webrtc_protection"
    }

    async fn enable(&self) -> Result<(), PolicyError> {
        let mut applied = self.applied.lock().await;
        if !applied.is_empty() {
            return Ok(());
        }

        let rules = self.rules().await?;
        info!("Enabling WebRTC leak protection ({}, {} rules)", self.platform, rules.len());
        *applied = apply_rules(self.runner.as_ref(), rules).await?;
        Ok(())
    }

    async fn disable(&self) -> Result<(), PolicyError> {
        let mut applied = self.applied.lock().await;
        if applied.is_empty() {
            return Ok(());
        }

        info!("Disabling WebRTC leak protection");
        let failures = remove_rules(self.runner.as_ref(), std::mem::take(&mut *applied)).await;
        if failures > 0 {
            warn!("WebRTC protection disabled with {} rule removal failures", failures);
        }

        if self.platform == Platform::Darwin {
            if let Err(e) = tokio::fs::remove_file(self.pf_anchor_path()).await {
                debug!("Anchor file not removed: {}", e);
            }
        }
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        !self.applied.lock().await.is_empty()
    }
}
