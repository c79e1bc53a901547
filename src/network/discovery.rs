//! DNS-based peer discovery.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use crate::chain::NetworkParams;

/// Resolves the network's DNS seeds into peer addresses.
pub struct DnsDiscovery {
    resolver: TokioAsyncResolver,
}

impl DnsDiscovery {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Query every seed for the network and return deduplicated addresses
    /// on the default port.
    pub async fn discover_peers(&self, params: &NetworkParams) -> Vec<SocketAddr> {
        let mut addresses = Vec::new();
        for seed in params.dns_seeds {
            tracing::debug!(%seed, "Querying DNS seed");
            match self.resolver.lookup_ip(*seed).await {
                Ok(lookup) => {
                    let ips: Vec<IpAddr> = lookup.iter().collect();
                    tracing::debug!(%seed, count = ips.len(), "DNS seed answered");
                    for ip in ips {
                        addresses.push(SocketAddr::new(ip, params.default_port));
                    }
                }
                Err(e) => {
                    tracing::warn!(%seed, "DNS seed lookup failed: {}", e);
                }
            }
        }
        addresses.sort();
        addresses.dedup();
        tracing::info!(count = addresses.len(), "Discovered peer addresses");
        addresses
    }
}

impl Default for DnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}
