//! Synthetic responses produced entirely by the gateway.
//!
//! These are the only responses a guest sees for blocked, failed or
//! malformed exchanges; they never carry host internals.

use sandnet_stack::BlockReason;

use super::head::{HeaderMap, ResponseHead};

fn synthetic(status: u16, reason: &str, body: &str) -> Vec<u8> {
    let mut headers = HeaderMap::new();
    headers.append("Content-Type", "text/plain; charset=utf-8");
    headers.append("Content-Length", body.len().to_string());
    headers.append("Connection", "keep-alive");
    let mut out = ResponseHead {
        status,
        reason: reason.to_string(),
        headers,
    }
    .serialize();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Policy rejection: 403 with the stable reason code as the body.
pub fn blocked(reason: BlockReason) -> Vec<u8> {
    synthetic(403, "Forbidden", reason.as_str())
}

/// Upstream failure before response headers arrived.
pub fn bad_gateway() -> Vec<u8> {
    synthetic(502, "Bad Gateway", "upstream request failed")
}

/// A user hook raised; the hook's own message stays in the host logs.
pub fn hook_failed() -> Vec<u8> {
    synthetic(500, "Internal Server Error", "request hook failed")
}

/// Unparsable or unsupported request syntax.
pub fn bad_request(detail: &str) -> Vec<u8> {
    synthetic(400, "Bad Request", detail)
}

/// Request body over the mediation buffer limit.
pub fn payload_too_large() -> Vec<u8> {
    synthetic(413, "Payload Too Large", "request body too large")
}
