use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cheap shared counters for the session loop and mediators.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    flows_http: AtomicU64,
    flows_tls: AtomicU64,
    requests_allowed: AtomicU64,
    requests_blocked: AtomicU64,
    upstream_errors: AtomicU64,
    tls_handshake_failures: AtomicU64,
    dns_lookups: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub flows_http: u64,
    pub flows_tls: u64,
    pub requests_allowed: u64,
    pub requests_blocked: u64,
    pub upstream_errors: u64,
    pub tls_handshake_failures: u64,
    pub dns_lookups: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http_flow(&self) {
        self.inner.flows_http.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tls_flow(&self) {
        self.inner.flows_tls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_allowed(&self) {
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_blocked(&self) {
        self.inner.requests_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.inner.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tls_handshake_failure(&self) {
        self.inner
            .tls_handshake_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_lookup(&self) {
        self.inner.dns_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            flows_http: self.inner.flows_http.load(Ordering::Relaxed),
            flows_tls: self.inner.flows_tls.load(Ordering::Relaxed),
            requests_allowed: self.inner.requests_allowed.load(Ordering::Relaxed),
            requests_blocked: self.inner.requests_blocked.load(Ordering::Relaxed),
            upstream_errors: self.inner.upstream_errors.load(Ordering::Relaxed),
            tls_handshake_failures: self.inner.tls_handshake_failures.load(Ordering::Relaxed),
            dns_lookups: self.inner.dns_lookups.load(Ordering::Relaxed),
        }
    }
}
