#![forbid(unsafe_code)]

//! Standalone gateway binary.
//!
//! Listens on a Unix socket for the QEMU stream netdev connection and runs
//! one session per connection. Configuration comes from the environment
//! (see `GatewayConfig::from_env`); embedders use the library directly.

use std::sync::Arc;

use sandnet_gateway::http::upstream::HostClient;
use sandnet_gateway::http::FlowShared;
use sandnet_gateway::tls::store::CertStore;
use sandnet_gateway::{run_session, GatewayConfig, SessionState};
use sandnet_stack::PolicyEngine;

#[derive(Default)]
struct CliArgs {
    socket: Option<String>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--socket" {
            let value = args
                .next()
                .ok_or_else(|| "--socket requires a path".to_string())?;
            out.socket = Some(value);
            continue;
        }
        if let Some(value) = arg.strip_prefix("--socket=") {
            out.socket = Some(value.to_string());
            continue;
        }
        if arg == "--help" || arg == "-h" {
            println!(
                "Usage: sandnet-gateway [--socket <path>]\n\
                 \n\
                 Options:\n\
                 \t--socket <path>\tUnix socket to listen on for the QEMU stream netdev\n\
                 \t\t\t(default /tmp/sandnet-gateway.sock)"
            );
            std::process::exit(0);
        }
        return Err(format!("unknown argument {arg:?}"));
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(GatewayConfig::from_env());
    let metrics = sandnet_gateway::metrics::Metrics::new();

    let certs = Arc::new(CertStore::open(&cfg.mitm_dir, cfg.leaf_cache_size)?);
    tracing::info!(
        dir = %cfg.mitm_dir.display(),
        "interposition CA ready; guest images should trust ca.cert.pem"
    );

    let shared = Arc::new(FlowShared {
        policy: PolicyEngine::new(&cfg.policy),
        secrets: cfg.secrets.clone(),
        dns: Arc::new(sandnet_gateway::dns::DnsService::new(
            cfg.dns_default_ttl_secs,
            metrics.clone(),
        )),
        client: Arc::new(HostClient::new(&cfg)?),
        hooks: Default::default(),
        metrics,
        max_request_body: cfg.max_request_body,
    });

    let socket_path = cli
        .socket
        .unwrap_or_else(|| "/tmp/sandnet-gateway.sock".to_string());
    let _ = std::fs::remove_file(&socket_path);
    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    tracing::info!(path = %socket_path, "listening for guest link");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, _) = accepted?;
                let state = SessionState {
                    cfg: cfg.clone(),
                    shared: shared.clone(),
                    certs: certs.clone(),
                };
                if let Err(err) = run_session(socket, state).await {
                    tracing::warn!(%err, "session ended with link error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
