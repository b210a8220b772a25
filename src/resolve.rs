use anyhow::anyhow;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::IpFamily;
use crate::error::EngineError;

/// A resolved probe destination, immutable for the lifetime of one run
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub address: IpAddr,
}

/// Resolve a hostname or IP literal to a single destination address.
///
/// IP literals short-circuit resolution but are still checked against the
/// requested family. Under `IpFamily::Auto`, IPv4 is preferred when both
/// families resolve.
pub async fn resolve_target(host: &str, family: IpFamily) -> Result<Target, EngineError> {
    if let Ok(address) = host.parse::<IpAddr>() {
        if !family_matches(address, family) {
            return Err(EngineError::Resolution {
                host: host.to_string(),
                source: anyhow!("address is not {}", family_name(family)),
            });
        }
        return Ok(Target {
            host: host.to_string(),
            address,
        });
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| EngineError::Resolution {
            host: host.to_string(),
            source: anyhow!(e),
        })?;

    let candidates: Vec<IpAddr> = lookup
        .iter()
        .filter(|ip| family_matches(*ip, family))
        .collect();

    let address = match family {
        IpFamily::V6 => candidates.first().copied(),
        // Auto and V4 both prefer IPv4 when one is available
        _ => candidates
            .iter()
            .find(|ip| ip.is_ipv4())
            .or(candidates.first())
            .copied(),
    };

    address
        .map(|address| Target {
            host: host.to_string(),
            address,
        })
        .ok_or_else(|| EngineError::Resolution {
            host: host.to_string(),
            source: anyhow!("no {} addresses found", family_name(family)),
        })
}

fn family_matches(ip: IpAddr, family: IpFamily) -> bool {
    match family {
        IpFamily::Auto => true,
        IpFamily::V4 => ip.is_ipv4(),
        IpFamily::V6 => ip.is_ipv6(),
    }
}

fn family_name(family: IpFamily) -> &'static str {
    match family {
        IpFamily::Auto => "IPv4 or IPv6",
        IpFamily::V4 => "IPv4",
        IpFamily::V6 => "IPv6",
    }
}

struct CacheEntry {
    hostname: Option<String>,
    cached_at: Instant,
}

/// Reverse-DNS lookups with a TTL-bounded cache.
///
/// Negative results are cached too, so unresolvable router addresses are not
/// re-queried every cycle. Lookups happen off the probe path; snapshot
/// capture only reads the cache.
pub struct RdnsCache {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<IpAddr, CacheEntry>>,
    cache_ttl: Duration,
}

impl RdnsCache {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600),
        }
    }

    /// Non-blocking cache read. `Some(entry)` when a fresh entry exists; the
    /// inner Option is None for cached negative results.
    pub fn cached(&self, ip: IpAddr) -> Option<Option<String>> {
        let cache = self.cache.read();
        cache
            .get(&ip)
            .filter(|entry| entry.cached_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.hostname.clone())
    }

    /// Lookup reverse DNS for an IP, filling the cache
    pub async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        if let Some(hostname) = self.cached(ip) {
            return hostname;
        }

        let hostname = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
            Err(e) => {
                trace!(%ip, error = %e, "reverse lookup failed");
                None
            }
        };

        self.cache.write().insert(
            ip,
            CacheEntry {
                hostname: hostname.clone(),
                cached_at: Instant::now(),
            },
        );
        hostname
    }
}

impl Default for RdnsCache {
    fn default() -> Self {
        Self::new()
    }
}
