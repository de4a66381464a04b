//! Egress policy: host allowlist, internal-range blocking, port policy and
//! secret bindings.
//!
//! Decisions are made per logical request with the destination host, the
//! host-resolved (pinned) IP and the port. DNS answers are deliberately NOT
//! policy-gated on hostname — enforcement happens at connect time, where the
//! pinned IP defeats rebinding.

use core::net::Ipv4Addr;
use std::fmt;

/// A minimal IPv4 CIDR (e.g. `10.0.0.0/8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl IpCidr {
    pub const fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            network,
            prefix_len,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let prefix_len = self.prefix_len.min(32);
        let mask = if prefix_len == 0 {
            0u32
        } else {
            u32::MAX << (32 - prefix_len)
        };
        u32::from(self.network) & mask == u32::from(ip) & mask
    }
}

/// Ranges a sandboxed guest must never reach: RFC1918, loopback, link-local,
/// CGNAT, "this network", the IETF protocol block, benchmarking, multicast
/// and the class E/broadcast tail.
pub const INTERNAL_RANGES: &[IpCidr] = &[
    IpCidr::new(Ipv4Addr::new(0, 0, 0, 0), 8),
    IpCidr::new(Ipv4Addr::new(10, 0, 0, 0), 8),
    IpCidr::new(Ipv4Addr::new(100, 64, 0, 0), 10),
    IpCidr::new(Ipv4Addr::new(127, 0, 0, 0), 8),
    IpCidr::new(Ipv4Addr::new(169, 254, 0, 0), 16),
    IpCidr::new(Ipv4Addr::new(172, 16, 0, 0), 12),
    IpCidr::new(Ipv4Addr::new(192, 0, 0, 0), 24),
    IpCidr::new(Ipv4Addr::new(192, 168, 0, 0), 16),
    IpCidr::new(Ipv4Addr::new(198, 18, 0, 0), 15),
    IpCidr::new(Ipv4Addr::new(224, 0, 0, 0), 4),
    IpCidr::new(Ipv4Addr::new(240, 0, 0, 0), 4),
];

pub fn is_internal_ip(ip: Ipv4Addr) -> bool {
    INTERNAL_RANGES.iter().any(|cidr| cidr.contains(ip))
}

/// One pattern from the host allowlist. `*` matches exactly one DNS label,
/// anywhere in the pattern (`*.example.com`, `api.*.net`). Comparison is
/// case-insensitive with any trailing dot stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    labels: Vec<String>,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().trim_end_matches('.');
        if pattern.is_empty() {
            return None;
        }
        let labels: Vec<String> = pattern
            .split('.')
            .map(|l| l.to_ascii_lowercase())
            .collect();
        if labels.iter().any(|l| l.is_empty()) {
            return None;
        }
        Some(Self { labels })
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        let host_labels: Vec<&str> = host.split('.').collect();
        if host_labels.len() != self.labels.len() {
            return false;
        }
        self.labels
            .iter()
            .zip(host_labels)
            .all(|(pat, host)| pat == "*" || pat.eq_ignore_ascii_case(host))
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels.join("."))
    }
}

/// A registered secret. The guest only ever sees the `$NAME` placeholder;
/// the real value is substituted host-side, and only toward hosts matching
/// the binding.
#[derive(Debug, Clone)]
pub struct SecretBinding {
    pub name: String,
    pub value: String,
    pub hosts: Vec<HostPattern>,
}

impl SecretBinding {
    /// The stable string the guest uses in place of the value.
    pub fn placeholder(&self) -> String {
        format!("${}", self.name)
    }

    pub fn allows_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|p| p.matches(host))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Stable reason codes for blocked requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    HostNotAllowed,
    IpInternal,
    PortNotAllowed,
    SecretOnDisallowedHost,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::HostNotAllowed => "host_not_allowed",
            BlockReason::IpInternal => "ip_internal",
            BlockReason::PortNotAllowed => "port_not_allowed",
            BlockReason::SecretOnDisallowedHost => "secret_on_disallowed_host",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Blocked(BlockReason),
}

impl PolicyDecision {
    pub fn is_allowed(self) -> bool {
        self == PolicyDecision::Allowed
    }
}

/// Policy configuration as handed over by the VM manager.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Host patterns admitted for HTTP/TLS. Empty means deny-all.
    pub allowed_hosts: Vec<String>,
    pub block_internal_ranges: bool,
    pub ports_http: Vec<u16>,
    pub ports_tls: Vec<u16>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            block_internal_ranges: true,
            ports_http: vec![80],
            ports_tls: vec![443],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    patterns: Vec<HostPattern>,
    block_internal_ranges: bool,
    ports_http: Vec<u16>,
    ports_tls: Vec<u16>,
}

impl PolicyEngine {
    pub fn new(cfg: &PolicyConfig) -> Self {
        let patterns = cfg
            .allowed_hosts
            .iter()
            .filter_map(|p| {
                let parsed = HostPattern::parse(p);
                if parsed.is_none() {
                    tracing::warn!(pattern = %p, "ignoring unparsable host pattern");
                }
                parsed
            })
            .collect();
        Self {
            patterns,
            block_internal_ranges: cfg.block_internal_ranges,
            ports_http: cfg.ports_http.clone(),
            ports_tls: cfg.ports_tls.clone(),
        }
    }

    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
    }

    pub fn allows_ip(&self, ip: Ipv4Addr) -> bool {
        !self.block_internal_ranges || !is_internal_ip(ip)
    }

    pub fn allows_port(&self, scheme: Scheme, port: u16) -> bool {
        match scheme {
            Scheme::Http => self.ports_http.contains(&port),
            Scheme::Https => self.ports_tls.contains(&port),
        }
    }

    /// Full connect-time decision for a logical request.
    pub fn decide(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
        resolved_ip: Ipv4Addr,
    ) -> PolicyDecision {
        if !self.allows_host(host) {
            return PolicyDecision::Blocked(BlockReason::HostNotAllowed);
        }
        if !self.allows_ip(resolved_ip) {
            return PolicyDecision::Blocked(BlockReason::IpInternal);
        }
        if !self.allows_port(scheme, port) {
            return PolicyDecision::Blocked(BlockReason::PortNotAllowed);
        }
        PolicyDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(hosts: &[&str]) -> PolicyEngine {
        PolicyEngine::new(&PolicyConfig {
            allowed_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn literal_patterns_match_case_insensitively() {
        let e = engine(&["api.github.com"]);
        assert!(e.allows_host("api.github.com"));
        assert!(e.allows_host("API.GitHub.COM"));
        assert!(e.allows_host("api.github.com."));
        assert!(!e.allows_host("github.com"));
        assert!(!e.allows_host("evil-api.github.com"));
    }

    #[test]
    fn leading_wildcard_matches_exactly_one_label() {
        let e = engine(&["*.example.com"]);
        assert!(e.allows_host("a.example.com"));
        assert!(!e.allows_host("example.com"));
        assert!(!e.allows_host("a.b.example.com"));
    }

    #[test]
    fn embedded_wildcard_is_supported() {
        let e = engine(&["api.*.net"]);
        assert!(e.allows_host("api.prod.net"));
        assert!(!e.allows_host("api.a.b.net"));
        assert!(!e.allows_host("www.prod.net"));
    }

    #[test]
    fn empty_allowlist_denies_all() {
        let e = engine(&[]);
        assert_eq!(
            e.decide(Scheme::Https, "api.github.com", 443, Ipv4Addr::new(140, 82, 112, 6)),
            PolicyDecision::Blocked(BlockReason::HostNotAllowed)
        );
    }

    #[test]
    fn internal_ranges_are_blocked_by_default() {
        let e = engine(&["internal.example.com"]);
        for ip in [
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(169, 254, 9, 9),
            Ipv4Addr::new(100, 64, 0, 1),
            Ipv4Addr::new(224, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 255),
            Ipv4Addr::new(0, 0, 0, 0),
        ] {
            assert_eq!(
                e.decide(Scheme::Https, "internal.example.com", 443, ip),
                PolicyDecision::Blocked(BlockReason::IpInternal),
                "expected {ip} to be blocked"
            );
        }
        assert_eq!(
            e.decide(
                Scheme::Https,
                "internal.example.com",
                443,
                Ipv4Addr::new(93, 184, 216, 34)
            ),
            PolicyDecision::Allowed
        );
    }

    #[test]
    fn internal_range_blocking_can_be_disabled() {
        let e = PolicyEngine::new(&PolicyConfig {
            allowed_hosts: vec!["internal.example.com".into()],
            block_internal_ranges: false,
            ..Default::default()
        });
        assert!(e
            .decide(
                Scheme::Https,
                "internal.example.com",
                443,
                Ipv4Addr::new(10, 0, 0, 1)
            )
            .is_allowed());
    }

    #[test]
    fn non_default_ports_are_blocked() {
        let e = engine(&["example.com"]);
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        assert_eq!(
            e.decide(Scheme::Https, "example.com", 8443, ip),
            PolicyDecision::Blocked(BlockReason::PortNotAllowed)
        );
        assert_eq!(
            e.decide(Scheme::Http, "example.com", 8080, ip),
            PolicyDecision::Blocked(BlockReason::PortNotAllowed)
        );
        assert!(e.decide(Scheme::Http, "example.com", 80, ip).is_allowed());
        assert!(e.decide(Scheme::Https, "example.com", 443, ip).is_allowed());
    }

    #[test]
    fn secret_binding_placeholder_and_hosts() {
        let binding = SecretBinding {
            name: "TOKEN".into(),
            value: "sk-real".into(),
            hosts: vec![HostPattern::parse("api.github.com").unwrap()],
        };
        assert_eq!(binding.placeholder(), "$TOKEN");
        assert!(binding.allows_host("api.github.com"));
        assert!(!binding.allows_host("evil.example.com"));
    }
}
