//! Gateway error taxonomy.
//!
//! Nothing here crosses a flow boundary except [`LinkError`]: a dead frame
//! socket tears the whole session down, everything else is converted into a
//! synthetic response or a reset on the one flow it concerns.

use thiserror::Error;

/// Fatal session errors: the frame link itself.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("frame link closed by peer")]
    Closed,
    #[error("frame exceeds link MTU ({0} bytes)")]
    Oversized(usize),
    #[error("frame link i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Host-side request failures. Everything maps to a synthetic 502 unless the
/// response body was already underway, in which case the flow is reset.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream connect failed: {0}")]
    Connect(anyhow::Error),
    #[error("upstream request failed: {0}")]
    Request(anyhow::Error),
    #[error("upstream body failed: {0}")]
    Body(anyhow::Error),
}

/// Why a mediator task ended.
#[derive(Debug)]
pub enum FlowEnd {
    /// Clean end: guest EOF or `Connection: close`; a FIN was sent.
    Graceful,
    /// The flow must be reset (mid-body failure, TLS handshake failure,
    /// protocol violation).
    Reset,
}
