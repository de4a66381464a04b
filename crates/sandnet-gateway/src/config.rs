//! Gateway configuration.
//!
//! The core receives structured values from the VM manager; nothing here is
//! read from a config file. The binary supplements the defaults from the
//! environment the same way the rest of the deployment scripts do.

use std::path::PathBuf;
use std::time::Duration;

use sandnet_stack::{PolicyConfig, SecretBinding, StackConfig};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub stack: StackConfig,
    pub policy: PolicyConfig,
    pub secrets: Vec<SecretBinding>,

    /// Where the interposition CA and its published certificate live.
    pub mitm_dir: PathBuf,
    /// Extra PEM roots trusted for upstream TLS, on top of the built-in
    /// webpki set.
    pub extra_roots_pem: Option<PathBuf>,

    /// TTL reported to the guest when the host resolver gives none.
    pub dns_default_ttl_secs: u32,

    pub upstream_connect_timeout: Duration,
    /// Request bodies are buffered for placeholder substitution; larger
    /// bodies get a synthetic 413.
    pub max_request_body: usize,
    /// Outbound frame queue depth before the guest is quenched.
    pub frame_write_buffer: usize,
    /// Leaf certificate cache entries.
    pub leaf_cache_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            stack: StackConfig::default(),
            policy: PolicyConfig::default(),
            secrets: Vec::new(),
            mitm_dir: PathBuf::from("var/mitm"),
            extra_roots_pem: None,
            dns_default_ttl_secs: 60,
            upstream_connect_timeout: Duration::from_secs(10),
            max_request_body: 32 * 1024 * 1024,
            frame_write_buffer: 256,
            leaf_cache_size: 256,
        }
    }
}

impl GatewayConfig {
    /// Environment overrides used by the standalone binary. The embedding VM
    /// manager passes structured values instead.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(hosts) = std::env::var("SANDNET_ALLOWED_HOSTS") {
            cfg.policy.allowed_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(v) = std::env::var("SANDNET_BLOCK_INTERNAL_RANGES") {
            let enabled = matches!(v.trim(), "1" | "true" | "yes" | "on");
            cfg.policy.block_internal_ranges = enabled;
            cfg.stack.block_internal_ranges = enabled;
        }

        if let Ok(dir) = std::env::var("SANDNET_MITM_DIR") {
            if !dir.trim().is_empty() {
                cfg.mitm_dir = PathBuf::from(dir);
            }
        }

        if let Ok(v) = std::env::var("SANDNET_MAX_FLOWS") {
            if let Ok(n) = v.parse() {
                cfg.stack.max_flows = n;
            }
        }

        if let Ok(v) = std::env::var("SANDNET_HTTP_PORTS") {
            if let Some(ports) = parse_ports(&v) {
                cfg.policy.ports_http = ports;
            }
        }
        if let Ok(v) = std::env::var("SANDNET_TLS_PORTS") {
            if let Some(ports) = parse_ports(&v) {
                cfg.policy.ports_tls = ports;
            }
        }

        cfg
    }
}

fn parse_ports(raw: &str) -> Option<Vec<u16>> {
    let ports: Vec<u16> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect();
    (!ports.is_empty()).then_some(ports)
}
