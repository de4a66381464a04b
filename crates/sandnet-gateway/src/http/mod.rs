//! The HTTP mediator.
//!
//! One mediator task runs per admitted flow. It terminates the guest's
//! HTTP/1.1, builds the logical request, applies secret substitution and
//! policy, re-issues the request through the host client, and streams the
//! final response back. Synthetic responses stand in for everything the
//! policy or the upstream path refuses — the guest connection survives them
//! so keep-alive clients can carry on.

pub mod body;
pub mod head;
pub mod secrets;
pub mod synth;
pub mod upstream;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use sandnet_stack::{PolicyDecision, PolicyEngine, Scheme, SecretBinding};

use crate::dns::DnsService;
use crate::error::FlowEnd;
use crate::hooks::Hooks;
use crate::metrics::Metrics;

use body::{encode_chunk, final_chunk, MessageReader};
use head::{parse_request_head, BodyMode, HeaderMap, RequestHead, ResponseHead};
use upstream::{UpstreamClient, UpstreamRequest};

/// Everything a mediator needs that is shared across flows.
pub struct FlowShared {
    pub policy: PolicyEngine,
    pub secrets: Vec<SecretBinding>,
    pub dns: Arc<DnsService>,
    pub client: Arc<dyn UpstreamClient>,
    pub hooks: Hooks,
    pub metrics: Metrics,
    pub max_request_body: usize,
}

/// Identity of one mediated flow.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub flow_id: u32,
    pub scheme: Scheme,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    /// Host to assume when the request carries none (the SNI on TLS flows).
    pub default_host: Option<String>,
}

/// Headers that never cross the mediation boundary in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    const HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Run the mediation loop over an established guest byte stream.
pub async fn mediate<S>(stream: S, info: FlowInfo, shared: Arc<FlowShared>) -> FlowEnd
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read_half);
    let mut writer = write_half;
    // One resolution per host for the lifetime of the flow.
    let mut pinned: HashMap<String, Ipv4Addr> = HashMap::new();

    loop {
        let head_bytes = match reader.read_head().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                // Guest half-closed between requests.
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
            Err(err) => {
                tracing::debug!(flow_id = info.flow_id, %err, "request read failed");
                return FlowEnd::Reset;
            }
        };

        let mut head = match parse_request_head(&head_bytes) {
            Ok(head) => head,
            Err(detail) => {
                let _ = writer.write_all(&synth::bad_request(detail)).await;
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
        };

        let mode = match head.body_mode() {
            Ok(mode) => mode,
            Err(detail) => {
                let _ = writer.write_all(&synth::bad_request(detail)).await;
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
        };
        let had_body = mode != BodyMode::None;
        let mut request_body = match reader.read_body(mode, shared.max_request_body).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                let _ = writer.write_all(&synth::payload_too_large()).await;
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
            Err(err) => {
                tracing::debug!(flow_id = info.flow_id, %err, "body read failed");
                return FlowEnd::Reset;
            }
        };

        let keep_alive = head.wants_keep_alive();

        let (host, port, path) = match effective_target(&head, &info) {
            Ok(target) => target,
            Err(detail) => {
                if write_synthetic(&mut writer, synth::bad_request(detail), keep_alive).await
                    == WriteOutcome::Reset
                {
                    return FlowEnd::Reset;
                }
                if keep_alive {
                    continue;
                }
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
        };

        // Secrets before anything leaves the host. A placeholder aimed at a
        // host outside its binding blocks the request outright.
        if let Err(reason) =
            secrets::substitute(&mut head, &mut request_body, &shared.secrets, &host)
        {
            shared.metrics.request_blocked();
            tracing::info!(flow_id = info.flow_id, %host, reason = reason.as_str(), "request blocked");
            if write_synthetic(&mut writer, synth::blocked(reason), keep_alive).await
                == WriteOutcome::Reset
            {
                return FlowEnd::Reset;
            }
            if !keep_alive {
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
            continue;
        }

        // Connect-time resolution, pinned for the rest of the flow.
        let resolved = match pinned.get(&host) {
            Some(ip) => Some(*ip),
            None => match shared.dns.resolve_ipv4(&host).await {
                Some((ip, _ttl)) => {
                    pinned.insert(host.clone(), ip);
                    Some(ip)
                }
                None => None,
            },
        };
        let Some(resolved_ip) = resolved else {
            shared.metrics.upstream_error();
            if write_synthetic(&mut writer, synth::bad_gateway(), keep_alive).await
                == WriteOutcome::Reset
            {
                return FlowEnd::Reset;
            }
            if !keep_alive {
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
            continue;
        };

        match shared.policy.decide(info.scheme, &host, port, resolved_ip) {
            PolicyDecision::Allowed => {}
            PolicyDecision::Blocked(reason) => {
                shared.metrics.request_blocked();
                tracing::info!(flow_id = info.flow_id, %host, reason = reason.as_str(), "request blocked");
                if write_synthetic(&mut writer, synth::blocked(reason), keep_alive).await
                    == WriteOutcome::Reset
                {
                    return FlowEnd::Reset;
                }
                if !keep_alive {
                    let _ = writer.shutdown().await;
                    return FlowEnd::Graceful;
                }
                continue;
            }
        }

        if let Err(message) = shared.hooks.run_request(&mut head) {
            tracing::warn!(flow_id = info.flow_id, %message, "request hook failed");
            if write_synthetic(&mut writer, synth::hook_failed(), keep_alive).await
                == WriteOutcome::Reset
            {
                return FlowEnd::Reset;
            }
            if !keep_alive {
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
            continue;
        }

        let request = UpstreamRequest {
            method: head.method.clone(),
            url: build_url(info.scheme, &host, port, &path),
            headers: end_to_end_headers(&head.headers),
            body: (had_body || !request_body.is_empty()).then_some(request_body),
            pinned_host: host.clone(),
            pinned_addr: SocketAddr::from((resolved_ip, port)),
        };

        let mut response = match shared.client.send(request).await {
            Ok(response) => response,
            Err(err) => {
                shared.metrics.upstream_error();
                tracing::debug!(flow_id = info.flow_id, %host, %err, "upstream failed");
                if write_synthetic(&mut writer, synth::bad_gateway(), keep_alive).await
                    == WriteOutcome::Reset
                {
                    return FlowEnd::Reset;
                }
                if !keep_alive {
                    let _ = writer.shutdown().await;
                    return FlowEnd::Graceful;
                }
                continue;
            }
        };

        let mut response_head = ResponseHead {
            status: response.status,
            reason: response.reason.clone(),
            headers: end_to_end_headers(&response.headers),
        };
        if let Err(message) = shared.hooks.run_response(&mut response_head) {
            tracing::warn!(flow_id = info.flow_id, %message, "response hook failed");
            if write_synthetic(&mut writer, synth::hook_failed(), keep_alive).await
                == WriteOutcome::Reset
            {
                return FlowEnd::Reset;
            }
            if !keep_alive {
                let _ = writer.shutdown().await;
                return FlowEnd::Graceful;
            }
            continue;
        }

        // Re-frame the body toward the guest: exact length when the origin
        // declared one, chunked otherwise.
        let chunked = response.content_length.is_none();
        response_head.headers.remove("content-length");
        if chunked {
            response_head.headers.set("Transfer-Encoding", "chunked");
        } else if let Some(len) = response.content_length {
            response_head
                .headers
                .set("Content-Length", len.to_string());
        }
        response_head
            .headers
            .set("Connection", if keep_alive { "keep-alive" } else { "close" });

        if writer.write_all(&response_head.serialize()).await.is_err() {
            return FlowEnd::Reset;
        }

        // Body streaming. Failures here are mid-response: the head is
        // already committed, so the only honest exit is a reset.
        while let Some(chunk) = response.body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    shared.metrics.upstream_error();
                    tracing::debug!(flow_id = info.flow_id, %err, "upstream body failed mid-stream");
                    return FlowEnd::Reset;
                }
            };
            let wire = if chunked {
                encode_chunk(&chunk)
            } else {
                chunk.to_vec()
            };
            if writer.write_all(&wire).await.is_err() {
                return FlowEnd::Reset;
            }
        }
        if chunked && writer.write_all(final_chunk()).await.is_err() {
            return FlowEnd::Reset;
        }

        shared.metrics.request_allowed();

        if !keep_alive {
            let _ = writer.shutdown().await;
            return FlowEnd::Graceful;
        }
    }
}

#[derive(PartialEq, Eq)]
enum WriteOutcome {
    Ok,
    Reset,
}

async fn write_synthetic<W: AsyncWrite + Unpin>(
    writer: &mut W,
    wire: Vec<u8>,
    _keep_alive: bool,
) -> WriteOutcome {
    if writer.write_all(&wire).await.is_err() {
        WriteOutcome::Reset
    } else {
        WriteOutcome::Ok
    }
}

/// Resolve the request target to (host, port, path).
fn effective_target(
    head: &RequestHead,
    info: &FlowInfo,
) -> Result<(String, u16, String), &'static str> {
    let target = head.target.as_str();

    // Absolute-form: authority and path come from the target itself.
    for (prefix, default_port) in [("http://", 80u16), ("https://", 443u16)] {
        if let Some(rest) = strip_prefix_ignore_case(target, prefix) {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], rest[idx..].to_string()),
                None => (rest, "/".to_string()),
            };
            let (host, port) = split_host_port(authority, default_port)?;
            return Ok((host, port, path));
        }
    }

    // Origin-form (and OPTIONS *): host from the Host header, the TLS SNI,
    // or as a last resort the literal address the guest dialed.
    if target.starts_with('/') || target == "*" {
        let path = if target == "*" {
            "*".to_string()
        } else {
            target.to_string()
        };
        if let Some(value) = head.headers.get("host") {
            let (host, port) = split_host_port(value, info.remote_port)?;
            return Ok((host, port, path));
        }
        if let Some(host) = &info.default_host {
            return Ok((host.clone(), info.remote_port, path));
        }
        return Ok((info.remote_ip.to_string(), info.remote_port, path));
    }

    Err("unsupported request target")
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), &'static str> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err("empty host");
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            let port: u16 = port.parse().map_err(|_| "invalid port")?;
            (host, port)
        }
        _ => (authority, default_port),
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err("empty host");
    }
    Ok((host, port))
}

fn build_url(scheme: Scheme, host: &str, port: u16, path: &str) -> String {
    let (scheme_str, default_port) = match scheme {
        Scheme::Http => ("http", 80),
        Scheme::Https => ("https", 443),
    };
    let path = if path == "*" { "/" } else { path };
    if port == default_port {
        format!("{scheme_str}://{host}{path}")
    } else {
        format!("{scheme_str}://{host}:{port}{path}")
    }
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("expect")
        {
            continue;
        }
        out.append(name.to_string(), value.to_string());
    }
    out
}
