//! TLS interposition.
//!
//! A TLS flow reaches this module with its ClientHello already buffered and
//! the SNI extracted. We terminate the guest's session against a leaf
//! minted for that SNI, then run the ordinary HTTP mediator over the
//! decrypted stream; the upstream half of the interposition happens inside
//! the host client, which dials the real origin over its own verified TLS.

pub mod store;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::error::FlowEnd;
use crate::http::{self, FlowInfo, FlowShared};
use store::CertStore;

/// Terminate the guest TLS session and mediate the HTTP inside it.
pub async fn mediate_tls<S>(
    stream: S,
    sni: String,
    mut info: FlowInfo,
    shared: Arc<FlowShared>,
    certs: Arc<CertStore>,
) -> FlowEnd
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let config = match certs.server_config_for(&sni) {
        Ok(config) => config,
        Err(err) => {
            shared.metrics.tls_handshake_failure();
            tracing::warn!(flow_id = info.flow_id, %sni, %err, "leaf synthesis failed");
            return FlowEnd::Reset;
        }
    };

    let acceptor = TlsAcceptor::from(config);
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(err) => {
            shared.metrics.tls_handshake_failure();
            tracing::debug!(flow_id = info.flow_id, %sni, %err, "guest handshake failed");
            return FlowEnd::Reset;
        }
    };

    info.default_host = Some(sni);
    http::mediate(tls, info, shared).await
}
