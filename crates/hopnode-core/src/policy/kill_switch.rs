//! Kill Switch
//!
//! Firewall-level kill switch: outbound traffic is denied by default and
//! only loopback, tunnel, established connections, DNS through the tunnel
//! and DHCP are let through.
//!
//! # Rule order
//!
//! 1. default-deny outbound
//! 2. allow loopback
//! 3. allow tunnel interface
//! 4. allow established/related
//! 5. allow DNS via tunnel (one rule per resolver)
//! 6. allow DHCP
//!
//! The plan runs once through `iptables` for IPv4 and again through
//! `ip6tables` for IPv6, so neither family can leak around the tunnel.
//! DNS servers go to the table of their own family and DHCPv6 uses ports
//! 546-547.
//!
//! A half-enabled kill switch is worse than none: if step k fails, steps
//! 1..k-1 are reversed before the error is returned.

use super::{apply_rules, remove_rules, FirewallRule, HostPolicy, Platform, PolicyError};
use crate::exec::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Kill switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// No rules installed, default policy allows traffic
    Disabled,
    /// Rules installed, non-tunnel traffic blocked
    Enabled,
}

impl KillSwitchState {
    /// Check if non-tunnel traffic is blocked
    pub fn is_blocking(&self) -> bool {
        matches!(self, KillSwitchState::Enabled)
    }
}

/// Kill switch controller
pub struct KillSwitch {
    interface: String,
    dns_servers: Vec<IpAddr>,
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    /// Rules applied by the last successful enable
    applied: Mutex<Vec<FirewallRule>>,
}

impl KillSwitch {
    /// Create a kill switch guarding `interface`
    pub fn new(
        interface: impl Into<String>,
        dns_servers: Vec<IpAddr>,
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            interface: interface.into(),
            dns_servers,
            platform,
            runner,
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Check current state
    pub async fn state(&self) -> KillSwitchState {
        if self.applied.lock().await.is_empty() {
            KillSwitchState::Disabled
        } else {
            KillSwitchState::Enabled
        }
    }

    /// The ordered rule plan for this host
    pub fn rules(&self) -> Result<Vec<FirewallRule>, PolicyError> {
        if self.platform != Platform::Linux {
            return Err(PolicyError::Unsupported("kill switch", self.platform));
        }

        let mut rules = self.family_rules("iptables", "67:68", |ip| ip.is_ipv4());
        rules.extend(self.family_rules("ip6tables", "546:547", |ip| ip.is_ipv6()));
        Ok(rules)
    }

    /// Rules 1-6 for one address family
    fn family_rules(&self, tool: &str, dhcp_ports: &str, family: impl Fn(&IpAddr) -> bool) -> Vec<FirewallRule> {
        let iface = self.interface.as_str();
        let ipt = |action: &str, rest: &[&str]| {
            let mut args = vec![action, "OUTPUT"];
            args.extend_from_slice(rest);
            CommandSpec::new(tool, args)
        };
        let pair = |desc: String, rest: &[&str]| {
            FirewallRule::new(format!("{} ({})", desc, tool), ipt("-A", rest), ipt("-D", rest))
        };

        let mut rules = vec![
            FirewallRule::new(
                format!("default-deny outbound ({})", tool),
                CommandSpec::new(tool, ["-P", "OUTPUT", "DROP"]),
                CommandSpec::new(tool, ["-P", "OUTPUT", "ACCEPT"]),
            ),
            pair("allow loopback".into(), &["-o", "lo", "-j", "ACCEPT"]),
            pair(format!("allow tunnel {}", iface), &["-o", iface, "-j", "ACCEPT"]),
            pair(
                "allow established".into(),
                &["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
            ),
        ];

        let servers: Vec<String> = self.dns_servers.iter()
            .filter(|ip| family(*ip))
            .map(|ip| ip.to_string())
            .collect();
        if servers.is_empty() {
            rules.push(pair(
                "allow DNS via tunnel".into(),
                &["-o", iface, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
            ));
        }
        for dest in &servers {
            rules.push(pair(
                format!("allow DNS {} via tunnel", dest),
                &["-o", iface, "-d", dest.as_str(), "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
            ));
        }

        rules.push(pair(
            "allow DHCP".into(),
            &["-p", "udp", "--dport", dhcp_ports, "--sport", dhcp_ports, "-j", "ACCEPT"],
        ));

        rules
    }
}

#[async_trait]
impl HostPolicy for KillSwitch {
    fn name(&self) -> &'static str {
        "kill_switch"
    }

    async fn enable(&self) -> Result<(), PolicyError> {
        let mut applied = self.applied.lock().await;
        if !applied.is_empty() {
            return Ok(());
        }

        let rules = self.rules()?;
        info!("Enabling kill switch ({} rules on {})", rules.len(), self.interface);

        *applied = apply_rules(self.runner.as_ref(), rules).await?;
        info!("Kill switch enabled");
        Ok(())
    }

    async fn disable(&self) -> Result<(), PolicyError> {
        let mut applied = self.applied.lock().await;
        if applied.is_empty() {
            return Ok(());
        }

        info!("Disabling kill switch");
        let rules = std::mem::take(&mut *applied);
        let failures = remove_rules(self.runner.as_ref(), rules).await;
        if failures > 0 {
            warn!("Kill switch disabled with {} rule removal failures", failures);
        }
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        self.state().await.is_blocking()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    fn kill_switch(runner: Arc<ScriptedRunner>) -> KillSwitch {
        KillSwitch::new("wg0", vec!["10.8.0.1".parse().unwrap()], Platform::Linux, runner)
    }

    #[tokio::test]
    async fn test_enable_applies_rules_in_order() {
        let runner = Arc::new(ScriptedRunner::new());
        let ks = kill_switch(runner.clone());

        ks.enable().await.unwrap();
        assert_eq!(ks.state().await, KillSwitchState::Enabled);

        assert_eq!(runner.commands(), vec![
            "iptables -P OUTPUT DROP",
            "iptables -A OUTPUT -o lo -j ACCEPT",
            "iptables -A OUTPUT -o wg0 -j ACCEPT",
            "iptables -A OUTPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT",
            "iptables -A OUTPUT -o wg0 -d 10.8.0.1 -p udp --dport 53 -j ACCEPT",
            "iptables -A OUTPUT -p udp --dport 67:68 --sport 67:68 -j ACCEPT",
            "ip6tables -P OUTPUT DROP",
            "ip6tables -A OUTPUT -o lo -j ACCEPT",
            "ip6tables -A OUTPUT -o wg0 -j ACCEPT",
            "ip6tables -A OUTPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT",
            "ip6tables -A OUTPUT -o wg0 -p udp --dport 53 -j ACCEPT",
            "ip6tables -A OUTPUT -p udp --dport 546:547 --sport 546:547 -j ACCEPT",
        ]);

        // enabling again is a no-op
        ks.enable().await.unwrap();
        assert_eq!(runner.commands().len(), 12);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_previous_steps() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_on("ESTABLISHED");
        let ks = kill_switch(runner.clone());

        let err = ks.enable().await.unwrap_err();
        assert!(matches!(err, PolicyError::RuleFailed { step: 4, .. }));
        assert_eq!(ks.state().await, KillSwitchState::Disabled);

        let cmds = runner.commands();
        assert_eq!(&cmds[4..], &[
            "iptables -D OUTPUT -o wg0 -j ACCEPT".to_string(),
            "iptables -D OUTPUT -o lo -j ACCEPT".to_string(),
            "iptables -P OUTPUT ACCEPT".to_string(),
        ]);

        // disable on a rolled-back switch does nothing
        runner.clear_log();
        ks.disable().await.unwrap();
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failure_at_first_step_touches_nothing_else() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_on("iptables -P OUTPUT DROP");
        let ks = kill_switch(runner.clone());

        assert!(matches!(ks.enable().await, Err(PolicyError::RuleFailed { step: 1, .. })));
        assert_eq!(runner.commands(), vec!["iptables -P OUTPUT DROP"]);
    }

    #[tokio::test]
    async fn test_disable_is_best_effort() {
        let runner = Arc::new(ScriptedRunner::new());
        let ks = kill_switch(runner.clone());
        ks.enable().await.unwrap();

        runner.fail_on("-D OUTPUT -o lo");
        runner.clear_log();
        ks.disable().await.unwrap();

        assert_eq!(ks.state().await, KillSwitchState::Disabled);
        assert_eq!(runner.commands().len(), 12);
        assert_eq!(runner.commands()[0], "ip6tables -D OUTPUT -p udp --dport 546:547 --sport 546:547 -j ACCEPT");
        assert_eq!(runner.commands().last().unwrap(), "iptables -P OUTPUT ACCEPT");
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let runner = Arc::new(ScriptedRunner::new());
        let ks = KillSwitch::new("utun3", vec![], Platform::Darwin, runner.clone());
        assert!(matches!(ks.enable().await, Err(PolicyError::Unsupported(..))));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_dns_rule_without_servers() {
        let ks = KillSwitch::new("wg0", vec![], Platform::Linux, Arc::new(ScriptedRunner::new()));
        let rules = ks.rules().unwrap();
        assert_eq!(rules.len(), 12);
        assert_eq!(rules[4].apply.to_string(), "iptables -A OUTPUT -o wg0 -p udp --dport 53 -j ACCEPT");
        assert_eq!(rules[10].apply.to_string(), "ip6tables -A OUTPUT -o wg0 -p udp --dport 53 -j ACCEPT");
    }

    #[tokio::test]
    async fn test_ipv6_leg_covers_ipv6_resolvers() {
        let runner = Arc::new(ScriptedRunner::new());
        let dns = vec!["10.8.0.1".parse().unwrap(), "fd00::1".parse().unwrap()];
        let ks = KillSwitch::new("wg0", dns, Platform::Linux, runner.clone());
        ks.enable().await.unwrap();

        let cmds = runner.commands();
        assert!(cmds.contains(&"ip6tables -P OUTPUT DROP".to_string()));
        assert!(cmds.contains(&"ip6tables -A OUTPUT -o wg0 -d fd00::1 -p udp --dport 53 -j ACCEPT".to_string()));
        assert_eq!(runner.count_matching("iptables -A OUTPUT -o wg0 -d fd00::1"), 0);
        assert_eq!(runner.count_matching("ip6tables -A OUTPUT -o wg0 -d 10.8.0.1"), 0);
    }

    #[tokio::test]
    async fn test_ipv6_failure_rolls_back_ipv4() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_on("ip6tables -P OUTPUT DROP");
        let ks = kill_switch(runner.clone());

        assert!(matches!(ks.enable().await, Err(PolicyError::RuleFailed { step: 7, .. })));
        assert_eq!(ks.state().await, KillSwitchState::Disabled);
        assert_eq!(runner.commands().last().unwrap(), "iptables -P OUTPUT ACCEPT");
        assert_eq!(runner.count_matching("iptables -D OUTPUT"), 5);
    }
}
