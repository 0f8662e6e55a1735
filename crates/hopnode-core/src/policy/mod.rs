//! Network Policy Engine
//!
//! Host-wide traffic policy that runs independently of sessions:
//!
//! - [`KillSwitch`]: default-deny outbound firewall, tunnel traffic only
//! - [`SplitTunnel`]: per-IP/domain/subnet routing through or around the tunnel
//! - [`WebRtcGuard`]: blocks STUN/TURN outside the tunnel
//!
//! Each policy implements [`HostPolicy`]. Enabling applies an ordered list
//! of rules; a failure part-way reverses what was applied. Disabling is
//! best effort so teardown can never get stuck on a broken firewall tool.

mod kill_switch;
mod split_tunnel;
mod webrtc;

pub use kill_switch::{KillSwitch, KillSwitchState};
pub use split_tunnel::{RuleKind, SplitRule, SplitTunnel, SplitTunnelConfig, RouteDirection};
pub use webrtc::{WebRtcGuard, STUN_HOSTS, STUN_PORTS};

use crate::exec::{CommandError, CommandRunner, CommandSpec};
use crate::resolve::ResolveError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Host platform a policy variant targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    /// Platform this binary was built for (Linux for anything unrecognised)
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Windows => "windows",
        };
        write!(f, "{}", name)
    }
}

/// A host-level policy that can be switched on and off
#[async_trait]
pub trait HostPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn enable(&self) -> Result<(), PolicyError>;
    async fn disable(&self) -> Result<(), PolicyError>;
    async fn is_enabled(&self) -> bool;
}

/// One firewall/routing rule and the command that reverses it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub description: String,
    pub apply: CommandSpec,
    pub undo: Option<CommandSpec>,
}

impl FirewallRule {
    pub fn new(description: impl Into<String>, apply: CommandSpec, undo: CommandSpec) -> Self {
        Self {
            description: description.into(),
            apply,
            undo: Some(undo),
        }
    }

    /// Rule with no inverse (its effect is cleared by another rule's undo)
    pub fn irreversible(description: impl Into<String>, apply: CommandSpec) -> Self {
        Self {
            description: description.into(),
            apply,
            undo: None,
        }
    }
}

/// Apply `rules` in order. On failure every rule applied so far is
/// reversed, newest first, and the failing step is reported.
pub(crate) async fn apply_rules(
    runner: &dyn CommandRunner,
    rules: Vec<FirewallRule>,
) -> Result<Vec<FirewallRule>, PolicyError> {
    let mut applied: Vec<FirewallRule> = Vec::with_capacity(rules.len());

    for (index, rule) in rules.into_iter().enumerate() {
        debug!("Applying rule {}: {}", index + 1, rule.description);
        if let Err(source) = runner.run(&rule.apply).await {
            error!(
                "Rule {} ({}) failed, rolling back {} applied rules: {}",
                index + 1, rule.description, applied.len(), source
            );
            let failed = remove_rules(runner, applied).await;
            return Err(PolicyError::RuleFailed {
                step: index + 1,
                rule: rule.description,
                rollback_failures: failed,
                source,
            });
        }
        applied.push(rule);
    }

    Ok(applied)
}

/// Reverse `rules`, newest first. Failures are logged and counted.
pub(crate) async fn remove_rules(runner: &dyn CommandRunner, rules: Vec<FirewallRule>) -> usize {
    let mut failures = 0;
    for rule in rules.into_iter().rev() {
        let Some(undo) = rule.undo else { continue };
        if let Err(e) = runner.run(&undo).await {
            warn!("Failed to remove rule ({}): {}", rule.description, e);
            failures += 1;
        }
    }
    failures
}

/// The three host policies under one roof
pub struct NetworkPolicyEngine {
    pub kill_switch: KillSwitch,
    pub split_tunnel: SplitTunnel,
    pub webrtc: WebRtcGuard,
}

impl NetworkPolicyEngine {
    pub fn new(kill_switch: KillSwitch, split_tunnel: SplitTunnel, webrtc: WebRtcGuard) -> Self {
        Self { kill_switch, split_tunnel, webrtc }
    }

    fn policies(&self) -> [&dyn HostPolicy; 3] {
        [&self.kill_switch, &self.split_tunnel, &self.webrtc]
    }

    /// Enabled/disabled flag per policy
    pub async fn status(&self) -> BTreeMap<&'static str, bool> {
        let mut status = BTreeMap::new();
        for policy in self.policies() {
            status.insert(policy.name(), policy.is_enabled().await);
        }
        status
    }

    /// Disable everything (shutdown path, never fails)
    pub async fn disable_all(&self) {
        for policy in self.policies() {
            if let Err(e) = policy.disable().await {
                warn!("Failed to disable {}: {}", policy.name(), e);
            }
        }
    }
}

/// Policy errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Rule {step} ({rule}) failed: {source} ({rollback_failures} rollback failures)")]
    RuleFailed {
        step: usize,
        rule: String,
        rollback_failures: usize,
        #[source]
        source: CommandError,
    },

    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    #[error("{0} is not supported on {1}")]
    Unsupported(&'static str, Platform),

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    fn rule(n: usize) -> FirewallRule {
        let n = n.to_string();
        FirewallRule::new(
            format!("rule {}", n),
            CommandSpec::new("fw", ["add", n.as_str()]),
            CommandSpec::new("fw", ["del", n.as_str()]),
        )
    }

    #[tokio::test]
    async fn test_apply_rules_rolls_back_in_reverse() {
        let runner = ScriptedRunner::new();
        runner.fail_on("fw add 3");

        let err = apply_rules(&runner, (1..=4).map(rule).collect()).await.unwrap_err();
        match err {
            PolicyError::RuleFailed { step, rollback_failures, .. } => {
                assert_eq!(step, 3);
                assert_eq!(rollback_failures, 0);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(runner.commands(), vec![
            "fw add 1", "fw add 2", "fw add 3", "fw del 2", "fw del 1",
        ]);
    }

    #[tokio::test]
    async fn test_remove_rules_counts_failures() {
        let runner = ScriptedRunner::new();
        runner.fail_on("fw del 1");
        let failures = remove_rules(&runner, (1..=2).map(rule).collect()).await;
        assert_eq!(failures, 1);
        assert_eq!(runner.commands(), vec!["fw del 2", "fw del 1"]);
    }

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::Darwin.to_string(), "darwin");
    }
}
