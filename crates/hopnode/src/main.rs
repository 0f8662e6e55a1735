//! hopnode: VPN relay node daemon
//!
//! `hopnode [config-path]`
//!
//! Brings the tunnel interface up, restores sessions, applies the
//! configured host policies and runs the background workers (plus the
//! SOCKS5 relay when enabled) until Ctrl-C. Shutdown reverses startup.

use anyhow::{Context, Result};
use hopnode_core::{
    DnsHostResolver, HostPolicy, HostResolver, KillSwitch, MemoryStore, MetricsRegistry, MultiHopRouter,
    NetworkPolicyEngine, NodeConfig, ObfuscationLayer, Platform, Repository, SessionCoordinator, Socks5Relay,
    SplitTunnel, SystemCommandRunner, TunnelInterface, WebRtcGuard, WorkerContext, Workers,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => NodeConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            info!("No config path given, using defaults");
            NodeConfig::default_config()
        }
    };

    info!("hopnode {} starting as {}", env!("CARGO_PKG_VERSION"), config.node.id);
    run(config).await?;
    info!("hopnode stopped");
    Ok(())
}

async fn run(config: NodeConfig) -> Result<()> {
    let runner = Arc::new(SystemCommandRunner::new(config.command_timeout()));
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(MetricsRegistry::new());

    let interface = Arc::new(TunnelInterface::new(config.interface.clone(), runner.clone())?);
    let record = config.node_record(&interface.public_key().to_base64());
    store.put_node(&record).await?;

    interface.create().await.context("creating tunnel interface")?;

    let router = Arc::new(MultiHopRouter::new(store.clone(), config.multihop.clone()));
    let coordinator = Arc::new(
        SessionCoordinator::new(
            config.node.id.clone(),
            config.sessions.clone(),
            interface.clone(),
            store.clone(),
            metrics.clone(),
        )
        .with_router(router),
    );

    if let Err(e) = coordinator.restore_sessions().await {
        warn!("Session restore failed: {}", e);
    }

    let engine = build_policies(&config, runner.clone());
    if let Err(e) = enable_policies(&config, &engine).await {
        error!("Policy setup failed: {:#}", e);
        engine.disable_all().await;
        interface.destroy().await;
        return Err(e);
    }

    let obfuscation = ObfuscationLayer::new(&config.obfuscation)?;
    info!("Obfuscation: {}", obfuscation.status());

    let workers = Workers::spawn(Arc::new(WorkerContext::new(
        coordinator.clone(),
        metrics.clone(),
        config.workers.clone(),
    )));

    let relay = if config.socks.enabled {
        match Socks5Relay::bind(config.socks.clone()).await {
            Ok(relay) => {
                info!("SOCKS5 relay available at {}", relay.proxy_url());
                Some(tokio::spawn(relay.run(workers.subscribe())))
            }
            Err(e) => {
                error!("SOCKS5 relay disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    info!("Node {} ready ({} sessions)", config.node.id, coordinator.active_count().await);
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");

    workers.shutdown().await;
    if let Some(handle) = relay {
        match handle.await {
            Ok(Err(e)) => warn!("SOCKS5 relay stopped with error: {}", e),
            Err(e) => warn!("SOCKS5 relay task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    engine.disable_all().await;
    interface.destroy().await;
    debug!("Final metrics:\n{}", metrics.render());
    Ok(())
}

fn build_policies(config: &NodeConfig, runner: Arc<SystemCommandRunner>) -> NetworkPolicyEngine {
    let resolver: Arc<dyn HostResolver> = match DnsHostResolver::from_system() {
        Ok(resolver) => Arc::new(resolver),
        Err(e) => {
            warn!("System resolver unavailable ({}), using Cloudflare", e);
            Arc::new(DnsHostResolver::cloudflare(Duration::from_secs(5)))
        }
    };

    let platform = Platform::current();
    let name = config.interface.name.clone();

    NetworkPolicyEngine::new(
        KillSwitch::new(name.clone(), config.policy.dns.clone(), platform, runner.clone()),
        SplitTunnel::new(name.clone(), config.policy.split_tunnel.clone(), runner.clone(), resolver.clone()),
        WebRtcGuard::new(name, platform, runner, resolver),
    )
}

async fn enable_policies(config: &NodeConfig, engine: &NetworkPolicyEngine) -> Result<()> {
    if config.policy.kill_switch {
        engine.kill_switch.enable().await.context("enabling kill switch")?;
    }
    if config.policy.split_tunnel.enabled {
        engine.split_tunnel.enable().await.context("enabling split tunnel")?;
    }
    if config.policy.webrtc_protection {
        engine.webrtc.enable().await.context("enabling WebRTC protection")?;
    }

    for (policy, enabled) in engine.status().await {
        debug!("Policy {}: {}", policy, if enabled { "on" } else { "off" });
    }
    Ok(())
}
