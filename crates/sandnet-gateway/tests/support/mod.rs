//! Shared scaffolding for the gateway tests: a recording upstream client
//! and a tiny HTTP response reader for the guest side.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use sandnet_gateway::dns::DnsService;
use sandnet_gateway::error::UpstreamError;
use sandnet_gateway::http::head::HeaderMap;
use sandnet_gateway::http::upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};
use sandnet_gateway::http::FlowShared;
use sandnet_gateway::metrics::Metrics;
use sandnet_stack::{PolicyConfig, PolicyEngine, SecretBinding};

/// One canned upstream reply.
pub struct MockResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub content_length: Option<u64>,
    pub body: Vec<Bytes>,
}

impl MockResponse {
    pub fn ok_with_body(body: &str) -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: vec![("content-type", "text/plain".to_string())],
            content_length: Some(body.len() as u64),
            body: vec![Bytes::copy_from_slice(body.as_bytes())],
        }
    }

    pub fn streamed(chunks: &[&str]) -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: vec![("content-type", "text/plain".to_string())],
            content_length: None,
            body: chunks
                .iter()
                .map(|c| Bytes::copy_from_slice(c.as_bytes()))
                .collect(),
        }
    }
}

/// Recording upstream: pops canned responses, remembers every request.
#[derive(Default)]
pub struct MockUpstream {
    pub requests: Mutex<Vec<UpstreamRequest>>,
    pub responses: Mutex<VecDeque<Result<MockResponse, &'static str>>>,
}

impl MockUpstream {
    pub fn with_responses(
        responses: impl IntoIterator<Item = Result<MockResponse, &'static str>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.into_iter().collect()),
        })
    }

    pub fn recorded(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for MockUpstream {
    fn send(
        &self,
        request: UpstreamRequest,
    ) -> BoxFuture<'static, Result<UpstreamResponse, UpstreamError>> {
        self.requests.lock().unwrap().push(request);
        let canned = self.responses.lock().unwrap().pop_front();
        Box::pin(async move {
            match canned {
                Some(Ok(mock)) => {
                    let mut headers = HeaderMap::new();
                    for (name, value) in mock.headers {
                        headers.append(name.to_string(), value);
                    }
                    let chunks: Vec<Result<Bytes, UpstreamError>> =
                        mock.body.into_iter().map(Ok).collect();
                    Ok(UpstreamResponse {
                        status: mock.status,
                        reason: mock.reason.to_string(),
                        headers,
                        content_length: mock.content_length,
                        body: stream::iter(chunks).boxed(),
                    })
                }
                Some(Err(message)) => Err(UpstreamError::Connect(anyhow::anyhow!(message))),
                None => Err(UpstreamError::Connect(anyhow::anyhow!(
                    "no canned response left"
                ))),
            }
        })
    }
}

pub const GITHUB_IP: Ipv4Addr = Ipv4Addr::new(140, 82, 112, 6);
pub const EVIL_IP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 66);

/// FlowShared wired to the mock upstream, deterministic DNS and an
/// allowlist.
pub fn shared_with(
    client: Arc<MockUpstream>,
    allowed_hosts: &[&str],
    secrets: Vec<SecretBinding>,
) -> Arc<FlowShared> {
    let metrics = Metrics::new();
    let dns = DnsService::new(60, metrics.clone())
        .with_override("api.github.com", GITHUB_IP)
        .with_override("evil.example.com", EVIL_IP)
        .with_override("icanhazip.com", Ipv4Addr::new(104, 16, 184, 241))
        .with_override("internal.example.com", Ipv4Addr::new(10, 0, 0, 5));
    Arc::new(FlowShared {
        policy: PolicyEngine::new(&PolicyConfig {
            allowed_hosts: allowed_hosts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }),
        secrets,
        dns: Arc::new(dns),
        client,
        hooks: Default::default(),
        metrics,
        max_request_body: 1024 * 1024,
    })
}

/// Read one HTTP/1.1 response (status line, headers, body per framing).
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> (String, Vec<(String, String)>, Vec<u8>) {
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await.expect("response read");
        assert_ne!(n, 0, "EOF before response head: {:?}", String::from_utf8_lossy(buf));
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).expect("UTF-8 head");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("").to_string();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            l.split_once(':')
                .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
        })
        .collect();

    let mut rest = buf.split_off(head_end);
    std::mem::swap(buf, &mut rest);
    // `buf` now holds bytes after the head.

    let content_length = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let chunked = headers
        .iter()
        .any(|(n, v)| n == "transfer-encoding" && v.eq_ignore_ascii_case("chunked"));

    let body = if chunked {
        read_chunked_body(reader, buf).await
    } else if let Some(len) = content_length {
        while buf.len() < len {
            let mut chunk = [0u8; 4096];
            let n = reader.read(&mut chunk).await.expect("body read");
            assert_ne!(n, 0, "EOF inside body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let rest = buf.split_off(len);
        std::mem::replace(buf, rest)
    } else {
        Vec::new()
    };

    (status_line, headers, body)
}

async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            let n = reader.read(&mut chunk).await.expect("chunk size read");
            assert_ne!(n, 0, "EOF inside chunked body");
            buf.extend_from_slice(&chunk[..n]);
        };
        let size_line = String::from_utf8(buf[..line_end].to_vec()).unwrap();
        let size = usize::from_str_radix(size_line.trim(), 16).expect("chunk size");
        let rest = buf.split_off(line_end + 2);
        *buf = rest;

        let needed = size + 2;
        while buf.len() < needed {
            let mut chunk = [0u8; 4096];
            let n = reader.read(&mut chunk).await.expect("chunk read");
            assert_ne!(n, 0, "EOF inside chunk");
            buf.extend_from_slice(&chunk[..n]);
        }
        if size == 0 {
            let rest = buf.split_off(2);
            *buf = rest;
            return body;
        }
        body.extend_from_slice(&buf[..size]);
        let rest = buf.split_off(needed);
        *buf = rest;
    }
}
