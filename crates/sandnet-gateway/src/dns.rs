//! Host-side DNS.
//!
//! Both the guest-visible DNS gate and connect-time pinning resolve through
//! this one service, so the address handed to the guest and the address the
//! mediator actually connects to can never come from different sources.
//! Overrides exist for deterministic tests.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use crate::metrics::Metrics;

pub struct DnsService {
    overrides: HashMap<String, Ipv4Addr>,
    default_ttl_secs: u32,
    metrics: Metrics,
}

impl DnsService {
    pub fn new(default_ttl_secs: u32, metrics: Metrics) -> Self {
        Self {
            overrides: HashMap::new(),
            default_ttl_secs,
            metrics,
        }
    }

    /// Pin `name` to a fixed address (tests, split-horizon entries).
    pub fn with_override(mut self, name: &str, addr: Ipv4Addr) -> Self {
        self.overrides.insert(name.to_ascii_lowercase(), addr);
        self
    }

    /// Resolve a hostname to a single IPv4 address. Deterministic for the
    /// process lifetime modulo the system resolver: the first IPv4 answer
    /// wins, so the DNS gate and connect-time pinning agree.
    pub async fn resolve_ipv4(&self, name: &str) -> Option<(Ipv4Addr, u32)> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.metrics.dns_lookup();

        if let Some(addr) = self.overrides.get(&name) {
            return Some((*addr, self.default_ttl_secs));
        }

        // Literal addresses resolve to themselves.
        if let Ok(addr) = name.parse::<Ipv4Addr>() {
            return Some((addr, self.default_ttl_secs));
        }

        // Port 0 is a placeholder; only the addresses matter.
        let addrs = tokio::net::lookup_host((name.as_str(), 0)).await.ok()?;
        for addr in addrs {
            if let IpAddr::V4(v4) = addr.ip() {
                return Some((v4, self.default_ttl_secs));
            }
        }
        None
    }
}
