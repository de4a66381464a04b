#![forbid(unsafe_code)]

//! Sans-I/O userspace network stack for the sandbox guest link.
//!
//! [`NetworkStack`] consumes raw Ethernet frames from the guest NIC and
//! emits [`Action`]s for a driver to fulfill: frames to write back, host DNS
//! lookups to perform, and mediator lifecycles for admitted TCP flows. See
//! the `sandnet-gateway` crate for the tokio driver.

pub mod classifier;
pub mod policy;
pub mod stack;
pub mod tcp;

pub use policy::{
    BlockReason, HostPattern, IpCidr, PolicyConfig, PolicyDecision, PolicyEngine, Scheme,
    SecretBinding,
};
pub use stack::{
    Action, DnsResolved, FlowProto, NetworkStack, StackConfig, StackCounters,
};
pub use tcp::Millis;
