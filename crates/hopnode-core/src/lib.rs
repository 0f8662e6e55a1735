//! hopnode - VPN Relay Node Core
//!
//! Node-side tunnel, session and traffic-protection subsystem of a relay
//! fleet. One node owns a kernel WireGuard interface, hands out tunnel
//! sessions, chains itself with other nodes for multi-hop routes and
//! enforces host network policy.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────┐
//!  create_session ──▶│    SessionCoordinator    │◀── Workers (heartbeat,
//!  disconnect     ──▶│  address pool, lifecycle │     monitor, metrics,
//!                    └──┬──────────┬─────────┬──┘     traffic)
//!                       │          │         │
//!              ┌────────▼───┐ ┌────▼─────┐ ┌─▼──────────┐
//!              │  Tunnel    │ │ MultiHop │ │ Repository │
//!              │ Interface  │ │  Router  │ │  (store)   │
//!              └────────┬───┘ └──────────┘ └────────────┘
//!                       │ ip / wg
//!                       ▼
//!               CommandRunner ◀── NetworkPolicyEngine (kill switch,
//!                                  split tunnel, WebRTC guard)
//!
//!  ObfuscatedSocket ── wraps tunnel datagrams at the transport boundary
//!  Socks5Relay      ── independent listener
//! ```
//!
//! # Seams
//!
//! Everything that touches the outside world sits behind a trait so the
//! core runs against scripted doubles in tests:
//!
//! - [`CommandRunner`]: host commands (`ip`, `wg`, `iptables`, `ip6tables`, `pfctl`, `netsh`)
//! - [`Repository`]: node, session, chain and traffic records
//! - [`MetricsSink`]: counters and gauges
//! - [`HostResolver`]: hostname lookups

pub mod config;
pub mod exec;
pub mod interface;
pub mod keys;
pub mod metrics;
pub mod multihop;
pub mod obfuscation;
pub mod policy;
pub mod proxy;
pub mod resolve;
pub mod session;
pub mod store;
pub mod workers;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, NodeConfig, NodeIdentity, PolicyConfig};
pub use exec::{CommandError, CommandRunner, CommandSpec, SystemCommandRunner};
pub use interface::{
    InterfaceConfig, InterfaceError, InterfaceStats, NodeInterfaceState, PeerConfig, PeerStats,
    TunnelInterface,
};
pub use keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use metrics::{MetricsRegistry, MetricsSink, NoopMetrics};
pub use multihop::{HopChain, MultiHopRouter, RouteError, RouterConfig};
pub use obfuscation::{ObfuscatedSocket, ObfuscationConfig, ObfuscationError, ObfuscationLayer, ObfuscationMode};
pub use policy::{
    HostPolicy, KillSwitch, KillSwitchState, NetworkPolicyEngine, Platform, PolicyError, RouteDirection,
    RuleKind, SplitRule, SplitTunnel, SplitTunnelConfig, WebRtcGuard,
};
pub use proxy::{ProxyConfig, ProxyError, Socks5Relay};
pub use resolve::{DnsHostResolver, HostResolver, ResolveError};
pub use session::{SessionConfig, SessionCoordinator, SessionError, SessionGrant};
pub use store::{MemoryStore, NodeRecord, NodeStatus, Repository, StoreError, TunnelSession};
pub use workers::{WorkerContext, WorkerIntervals, Workers};
