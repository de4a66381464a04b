//! The host HTTP client contract.
//!
//! The mediator talks to an [`UpstreamClient`] rather than a concrete
//! library: `send` takes the fully-rewritten logical request and returns a
//! response head plus a streaming body. [`HostClient`] implements it with
//! reqwest; tests substitute their own recorders.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};

use crate::config::GatewayConfig;
use crate::error::UpstreamError;

use super::head::HeaderMap;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    /// End-to-end headers only; framing and Host are the client's job.
    pub headers: HeaderMap,
    /// `None` when the guest request carried no body framing.
    pub body: Option<Vec<u8>>,
    /// Host plus the pinned address the connection must use. DNS rebinding
    /// dies here: whatever the guest's DNS said, this is where we connect.
    pub pinned_host: String,
    pub pinned_addr: SocketAddr,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    /// Known body length, if the origin declared one after redirects.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, UpstreamError>>,
}

pub trait UpstreamClient: Send + Sync {
    /// Issue the request host-side. Redirects are followed internally; the
    /// returned response is the final one.
    fn send(
        &self,
        request: UpstreamRequest,
    ) -> BoxFuture<'static, Result<UpstreamResponse, UpstreamError>>;
}

/// reqwest-backed production client.
pub struct HostClient {
    connect_timeout: Duration,
    extra_roots: Vec<reqwest::Certificate>,
}

impl HostClient {
    pub fn new(cfg: &GatewayConfig) -> anyhow::Result<Self> {
        let mut extra_roots = Vec::new();
        if let Some(path) = &cfg.extra_roots_pem {
            let pem = std::fs::read(path)?;
            extra_roots = reqwest::Certificate::from_pem_bundle(&pem)?;
        }
        Ok(Self {
            connect_timeout: cfg.upstream_connect_timeout,
            extra_roots,
        })
    }

    fn build_client(&self, request: &UpstreamRequest) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .no_proxy()
            // Connections for the pinned host go to the pinned address,
            // bypassing any later (possibly rebound) resolution.
            .resolve(&request.pinned_host, request.pinned_addr);
        for root in &self.extra_roots {
            builder = builder.add_root_certificate(root.clone());
        }
        builder.build()
    }
}

impl UpstreamClient for HostClient {
    fn send(
        &self,
        request: UpstreamRequest,
    ) -> BoxFuture<'static, Result<UpstreamResponse, UpstreamError>> {
        let client = self.build_client(&request);
        Box::pin(async move {
            let client = client.map_err(|e| UpstreamError::Connect(e.into()))?;

            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|e| UpstreamError::Request(e.into()))?;
            let mut builder = client.request(method, &request.url);
            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| UpstreamError::Request(e.into()))?;

            let status = response.status().as_u16();
            let reason = response
                .status()
                .canonical_reason()
                .unwrap_or("")
                .to_string();
            let mut headers = HeaderMap::new();
            for (name, value) in response.headers() {
                headers.append(
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
            let content_length = response.content_length();
            let body = response
                .bytes_stream()
                .map_err(|e| UpstreamError::Body(e.into()))
                .boxed();

            Ok(UpstreamResponse {
                status,
                reason,
                headers,
                content_length,
                body,
            })
        })
    }
}
