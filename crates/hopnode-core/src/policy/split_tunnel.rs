//! Split Tunneling
//!
//! Include rules route their destinations through the tunnel via a
//! secondary routing table; exclude rules pin their destinations to the
//! main table so they bypass the tunnel. Exclude rules use a lower
//! `ip rule` priority, so they win over includes.

use super::{apply_rules, remove_rules, FirewallRule, HostPolicy, PolicyError};
use crate::exec::{CommandRunner, CommandSpec};
use crate::resolve::HostResolver;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Split-tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitTunnelConfig {
    pub enabled: bool,
    /// Secondary routing table id
    pub table: u32,
    pub include_priority: u32,
    pub exclude_priority: u32,
    pub include: Vec<SplitRule>,
    pub exclude: Vec<SplitRule>,
}

impl Default for SplitTunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            table: 100,
            include_priority: 200,
            exclude_priority: 100,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// What a rule matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Ip,
    Domain,
    Subnet,
}

/// Whether matching traffic goes through or around the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDirection {
    Include,
    Exclude,
}

/// A stored split-tunnel rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRule {
    pub kind: RuleKind,
    pub value: String,
}

impl SplitRule {
    pub fn new(kind: RuleKind, value: impl Into<String>) -> Self {
        Self { kind, value: value.into() }
    }

    /// Reject malformed rules before they are stored
    pub fn validate(&self) -> Result<(), PolicyError> {
        match self.kind {
            RuleKind::Ip => {
                self.value.parse::<IpAddr>()
                    .map_err(|_| PolicyError::InvalidIp(self.value.clone()))?;
            }
            RuleKind::Subnet => {
                if !self.value.contains('/') {
                    return Err(PolicyError::InvalidCidr(self.value.clone()));
                }
                self.value.parse::<IpNetwork>()
                    .map_err(|_| PolicyError::InvalidCidr(self.value.clone()))?;
            }
            RuleKind::Domain => {
                if !is_valid_domain(&self.value) {
                    return Err(PolicyError::InvalidDomain(self.value.clone()));
                }
            }
        }
        Ok(())
    }
}

fn is_valid_domain(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

struct AppliedRule {
    direction: RouteDirection,
    rule: SplitRule,
    commands: Vec<FirewallRule>,
}

#[derive(Default)]
struct SplitState {
    enabled: bool,
    include: Vec<SplitRule>,
    exclude: Vec<SplitRule>,
    applied: Vec<AppliedRule>,
}

/// Split-tunnel routing controller
pub struct SplitTunnel {
    interface: String,
    config: SplitTunnelConfig,
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn HostResolver>,
    state: Mutex<SplitState>,
}

impl SplitTunnel {
    pub fn new(
        interface: impl Into<String>,
        config: SplitTunnelConfig,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        let state = SplitState {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            ..SplitState::default()
        };

        Self {
            interface: interface.into(),
            config,
            runner,
            resolver,
            state: Mutex::new(state),
        }
    }

    pub async fn add_include_rule(&self, kind: RuleKind, value: &str) -> Result<(), PolicyError> {
        self.add_rule(RouteDirection::Include, SplitRule::new(kind, value)).await
    }

    pub async fn add_exclude_rule(&self, kind: RuleKind, value: &str) -> Result<(), PolicyError> {
        self.add_rule(RouteDirection::Exclude, SplitRule::new(kind, value)).await
    }

    async fn add_rule(&self, direction: RouteDirection, rule: SplitRule) -> Result<(), PolicyError> {
        rule.validate()?;

        let mut state = self.state.lock().await;
        let list = match direction {
            RouteDirection::Include => &state.include,
            RouteDirection::Exclude => &state.exclude,
        };
        if list.contains(&rule) {
            return Ok(());
        }

        if state.enabled {
            let applied = self.apply_rule(direction, &rule).await?;
            state.applied.push(applied);
        }

        debug!("Split tunnel {:?} rule added: {:?} {}", direction, rule.kind, rule.value);
        match direction {
            RouteDirection::Include => state.include.push(rule),
            RouteDirection::Exclude => state.exclude.push(rule),
        }
        Ok(())
    }

    /// Drop a rule from the catalogue, reversing it if applied
    pub async fn remove_rule(&self, direction: RouteDirection, kind: RuleKind, value: &str) -> Result<(), PolicyError> {
        let target = SplitRule::new(kind, value);
        let mut state = self.state.lock().await;

        let list = match direction {
            RouteDirection::Include => &mut state.include,
            RouteDirection::Exclude => &mut state.exclude,
        };
        let before = list.len();
        list.retain(|r| r != &target);
        if list.len() == before {
            return Err(PolicyError::RuleNotFound(value.to_string()));
        }

        if let Some(pos) = state.applied.iter().position(|a| a.direction == direction && a.rule == target) {
            let applied = state.applied.remove(pos);
            remove_rules(self.runner.as_ref(), applied.commands).await;
        }
        Ok(())
    }

    /// Include rules in the catalogue
    pub async fn include_rules(&self) -> Vec<SplitRule> {
        self.state.lock().await.include.clone()
    }

    /// Exclude rules in the catalogue
    pub async fn exclude_rules(&self) -> Vec<SplitRule> {
        self.state.lock().await.exclude.clone()
    }

    async fn targets(&self, rule: &SplitRule) -> Result<Vec<IpNetwork>, PolicyError> {
        let targets = match rule.kind {
            RuleKind::Ip => {
                let ip: IpAddr = rule.value.parse()
                    .map_err(|_| PolicyError::InvalidIp(rule.value.clone()))?;
                vec![IpNetwork::from(ip)]
            }
            RuleKind::Subnet => {
                let net: IpNetwork = rule.value.parse()
                    .and_then(|n: IpNetwork| IpNetwork::new(n.network(), n.prefix()))
                    .map_err(|_| PolicyError::InvalidCidr(rule.value.clone()))?;
                vec![net]
            }
            RuleKind::Domain => {
                let addrs = self.resolver.resolve(&rule.value).await?;
                debug!("{} resolved to {:?}", rule.value, addrs);
                addrs.into_iter().map(IpNetwork::from).collect()
            }
        };
        Ok(targets)
    }

    fn commands_for(&self, direction: RouteDirection, target: IpNetwork) -> Vec<FirewallRule> {
        let family = match target {
            IpNetwork::V4(_) => "-4",
            IpNetwork::V6(_) => "-6",
        };
        let dest = target.to_string();
        let table = self.config.table.to_string();
        let ip = |args: &[&str]| {
            let mut full = vec![family];
            full.extend_from_slice(args);
            CommandSpec::new("ip", full)
        };

        match direction {
            RouteDirection::Include => {
                let prio = self.config.include_priority.to_string();
                vec![
                    FirewallRule::new(
                        format!("route {} via {}", dest, self.interface),
                        ip(&["route", "add", &dest, "dev", &self.interface, "table", &table]),
                        ip(&["route", "del", &dest, "dev", &self.interface, "table", &table]),
                    ),
                    FirewallRule::new(
                        format!("rule to {} lookup {}", dest, table),
                        ip(&["rule", "add", "to", &dest, "lookup", &table, "priority", &prio]),
                        ip(&["rule", "del", "to", &dest, "lookup", &table, "priority", &prio]),
                    ),
                ]
            }
            RouteDirection::Exclude => {
                let prio = self.config.exclude_priority.to_string();
                vec![FirewallRule::new(
                    format!("rule to {} lookup main", dest),
                    ip(&["rule", "add", "to", &dest, "lookup", "main", "priority", &prio]),
                    ip(&["rule", "del", "to", &dest, "lookup", "main", "priority", &prio]),
                )]
            }
        }
    }

    async fn apply_rule(&self, direction: RouteDirection, rule: &SplitRule) -> Result<AppliedRule, PolicyError> {
        let mut commands = Vec::new();
        for target in self.targets(rule).await? {
            commands.extend(self.commands_for(direction, target));
        }

        let commands = apply_rules(self.runner.as_ref(), commands).await?;
        Ok(AppliedRule {
            direction,
            rule: rule.clone(),
            commands,
        })
    }
}

#[async_trait]
impl HostPolicy for SplitTunnel {
    fn name(&self) -> &'static str {
        "split_tunnel"
    }

    async fn enable(&self) -> Result<(), PolicyError> {
        let mut state = self.state.lock().await;
        if state.enabled {
            return Ok(());
        }

        info!(
            "Enabling split tunnel (table {}, {} include, {} exclude)",
            self.config.table, state.include.len(), state.exclude.len()
        );

        let plan: Vec<(RouteDirection, SplitRule)> = state.include.iter()
            .map(|r| (RouteDirection::Include, r.clone()))
            .chain(state.exclude.iter().map(|r| (RouteDirection::Exclude, r.clone())))
            .collect();

        let mut applied: Vec<AppliedRule> = Vec::new();
        for (direction, rule) in plan {
            match self.apply_rule(direction, &rule).await {
                Ok(a) => applied.push(a),
                Err(e) => {
                    warn!("Split tunnel rule {} failed, rolling back: {}", rule.value, e);
                    for a in applied.into_iter().rev() {
                        remove_rules(self.runner.as_ref(), a.commands).await;
                    }
                    return Err(e);
                }
            }
        }

        state.applied = applied;
        state.enabled = true;
        Ok(())
    }

    async fn disable(&self) -> Result<(), PolicyError> {
        let mut state = self.state.lock().await;
        info!("Disabling split tunnel");

        let table = self.config.table.to_string();
        for family in ["-4", "-6"] {
            let flush = CommandSpec::new("ip", [family, "route", "flush", "table", table.as_str()]);
            if let Err(e) = self.runner.run(&flush).await {
                warn!("Failed to flush table {}: {}", table, e);
            }
        }

        // routes are gone with the flush; only the policy rules need deleting
        for applied in std::mem::take(&mut state.applied).into_iter().rev() {
            let rules: Vec<FirewallRule> = applied.commands.into_iter()
                .filter(|r| r.apply.args.get(1).map(String::as_str) == Some("rule"))
                .collect();
            remove_rules(self.runner.as_ref(), rules).await;
        }

        state.include.clear();
        state.exclude.clear();
        state.enabled = false;
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }
}
