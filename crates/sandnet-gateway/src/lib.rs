#![forbid(unsafe_code)]

//! Tokio driver for the sandbox egress stack.
//!
//! Consumes a connected frame socket (QEMU stream netdev framing) plus a
//! [`GatewayConfig`] from the VM manager, and mediates everything the guest
//! does on the network: HTTP termination and re-issue, TLS interposition
//! with a local CA, the DNS gate, and the policy engine around all of it.

pub mod config;
pub mod dns;
pub mod error;
pub mod flow_stream;
pub mod frame_io;
pub mod hooks;
pub mod http;
pub mod metrics;
pub mod session;
pub mod tls;

pub use config::GatewayConfig;
pub use error::{FlowEnd, LinkError, UpstreamError};
pub use session::{run_session, SessionState};
