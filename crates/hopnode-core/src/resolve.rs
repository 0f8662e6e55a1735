//! Hostname Resolution
//!
//! Split-tunnel domain rules and the Windows WebRTC guard need the
//! addresses behind a hostname. Resolution sits behind [`HostResolver`].

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Resolves a hostname to one or more addresses
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Resolver backed by hickory
pub struct DnsHostResolver {
    resolver: TokioAsyncResolver,
}

impl DnsHostResolver {
    /// Use the system resolver configuration
    pub fn from_system() -> Result<Self, ResolveError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ResolveError::Resolver(e.to_string()))?;
        info!("DNS resolver initialized from system configuration");
        Ok(Self { resolver })
    }

    /// Use Cloudflare upstreams with the given query timeout
    pub fn cloudflare(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts),
        }
    }
}

#[async_trait]
impl HostResolver for DnsHostResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let lookup = self.resolver.lookup_ip(host).await
            .map_err(|e| ResolveError::Failed(host.to_string(), e.to_string()))?;

        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses(host.to_string()));
        }

        debug!("Resolved {} to {} addresses", host, addrs.len());
        Ok(addrs)
    }
}

/// Resolution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Resolver error: {0}")]
    Resolver(String),

    #[error("Resolution of {0} failed: {1}")]
    Failed(String, String),

    #[error("No addresses found for {0}")]
    NoAddresses(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literal_skips_lookup() {
        let resolver = DnsHostResolver::cloudflare(Duration::from_millis(10));
        let addrs = resolver.resolve("192.0.2.7").await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
    }
}
