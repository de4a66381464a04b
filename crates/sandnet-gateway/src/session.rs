//! The per-link session loop.
//!
//! One session owns the frame socket and the [`NetworkStack`]. Everything
//! per-flow (mediation, TLS handshakes, host requests) runs in spawned
//! tasks wired back through channels; the loop itself only moves frames,
//! fulfills stack actions and drives timers. Dropping a flow's handle
//! cancels its task and with it any in-flight host request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc as futures_mpsc;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sandnet_stack::{Action, DnsResolved, FlowProto, Millis, NetworkStack, Scheme};

use crate::config::GatewayConfig;
use crate::error::{FlowEnd, LinkError};
use crate::flow_stream::{FlowCmd, GuestEvent, GuestStream};
use crate::frame_io::frame_pair;
use crate::http::{self, FlowInfo, FlowShared};
use crate::tls::{self, store::CertStore};

pub struct SessionState {
    pub cfg: Arc<GatewayConfig>,
    pub shared: Arc<FlowShared>,
    pub certs: Arc<CertStore>,
}

struct FlowHandle {
    guest_tx: futures_mpsc::UnboundedSender<GuestEvent>,
    task: JoinHandle<()>,
}

impl FlowHandle {
    fn close(self) {
        self.task.abort();
    }
}

fn elapsed_ms(start: tokio::time::Instant) -> Millis {
    start.elapsed().as_millis().min(u64::MAX as u128) as u64
}

/// Drive one guest link until it closes or fails.
pub async fn run_session<S>(socket: S, state: SessionState) -> Result<(), LinkError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut frame_reader, mut frame_writer) = frame_pair(socket);

    // Outbound frames go through a bounded queue; when it fills, the stack
    // quenches the guest with a zero window until the socket drains.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(state.cfg.frame_write_buffer);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(err) = frame_writer.send_frame(&frame).await {
                tracing::debug!(%err, "frame write failed");
                break;
            }
        }
    });

    let (cmd_tx, mut cmd_rx) = futures_mpsc::channel::<FlowCmd>(256);
    let (dns_tx, mut dns_rx) = mpsc::channel::<DnsResolved>(64);

    let mut stack = NetworkStack::new(state.cfg.stack.clone());
    let mut flows: HashMap<u32, FlowHandle> = HashMap::new();
    let start = tokio::time::Instant::now();

    tracing::info!("guest link session opened");

    let result = loop {
        // +1ms so the millisecond clock has definitely passed the deadline
        // when the timer arm runs.
        let next_deadline = stack
            .next_timer()
            .map(|t| start + Duration::from_millis(t + 1));

        tokio::select! {
            frame = frame_reader.recv_frame() => {
                match frame {
                    Ok(frame) => {
                        let actions = stack.handle_guest_frame(&frame, elapsed_ms(start));
                        if let Err(err) = process_actions(
                            &mut stack, actions, &state, &mut flows,
                            &frame_tx, &cmd_tx, &dns_tx,
                        ).await {
                            break Err(err);
                        }
                    }
                    Err(LinkError::Closed) => break Ok(()),
                    Err(err) => break Err(err),
                }
            }
            Some(cmd) = cmd_rx.next() => {
                let now = elapsed_ms(start);
                let actions = match cmd {
                    FlowCmd::Data { flow_id, data } => stack.flow_send(flow_id, &data, now),
                    FlowCmd::Shutdown { flow_id } => stack.flow_shutdown(flow_id, now),
                    FlowCmd::Reset { flow_id } => {
                        if let Some(handle) = flows.remove(&flow_id) {
                            handle.close();
                        }
                        stack.flow_reset(flow_id)
                    }
                    FlowCmd::Done { flow_id } => {
                        flows.remove(&flow_id);
                        Vec::new()
                    }
                };
                if let Err(err) = process_actions(
                    &mut stack, actions, &state, &mut flows,
                    &frame_tx, &cmd_tx, &dns_tx,
                ).await {
                    break Err(err);
                }
            }
            Some(resolved) = dns_rx.recv() => {
                let actions = stack.handle_dns_resolved(resolved, elapsed_ms(start));
                if let Err(err) = process_actions(
                    &mut stack, actions, &state, &mut flows,
                    &frame_tx, &cmd_tx, &dns_tx,
                ).await {
                    break Err(err);
                }
            }
            _ = sleep_until_deadline(next_deadline), if next_deadline.is_some() => {
                let actions = stack.handle_timers(elapsed_ms(start));
                if let Err(err) = process_actions(
                    &mut stack, actions, &state, &mut flows,
                    &frame_tx, &cmd_tx, &dns_tx,
                ).await {
                    break Err(err);
                }
            }
        }
    };

    for (_, handle) in flows.drain() {
        handle.close();
    }
    drop(frame_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;

    let counters = stack.counters();
    let metrics = state.shared.metrics.snapshot();
    tracing::info!(?counters, ?metrics, "guest link session closed");
    result
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_actions(
    stack: &mut NetworkStack,
    actions: Vec<Action>,
    state: &SessionState,
    flows: &mut HashMap<u32, FlowHandle>,
    frame_tx: &mpsc::Sender<Vec<u8>>,
    cmd_tx: &futures_mpsc::Sender<FlowCmd>,
    dns_tx: &mpsc::Sender<DnsResolved>,
) -> Result<(), LinkError> {
    let mut queue: VecDeque<Action> = actions.into();

    while let Some(action) = queue.pop_front() {
        match action {
            Action::EmitFrame(frame) => {
                send_frame_quenching(stack, frame_tx, frame).await?;
            }

            Action::DnsResolve { request_id, name } => {
                let dns = state.shared.dns.clone();
                let dns_tx = dns_tx.clone();
                tokio::spawn(async move {
                    let resolved = match dns.resolve_ipv4(&name).await {
                        Some((addr, ttl_secs)) => DnsResolved {
                            request_id,
                            name,
                            addr: Some(addr),
                            ttl_secs,
                        },
                        None => DnsResolved {
                            request_id,
                            name,
                            addr: None,
                            ttl_secs: 0,
                        },
                    };
                    let _ = dns_tx.send(resolved).await;
                });
            }

            Action::FlowAccepted {
                flow_id,
                proto,
                remote_ip,
                remote_port,
                data,
            } => {
                // TLS on a non-admitted port never gets a handshake.
                if let FlowProto::Tls { .. } = proto {
                    if !state.shared.policy.allows_port(Scheme::Https, remote_port) {
                        state.shared.metrics.request_blocked();
                        tracing::info!(flow_id, remote_port, "TLS port not admitted");
                        queue.extend(stack.flow_reset(flow_id));
                        continue;
                    }
                }

                let (guest_tx, guest_rx) = futures_mpsc::unbounded();
                let _ = guest_tx.unbounded_send(GuestEvent::Data(data));
                let stream = GuestStream::new(flow_id, guest_rx, cmd_tx.clone());

                let scheme = match proto {
                    FlowProto::Http => Scheme::Http,
                    FlowProto::Tls { .. } => Scheme::Https,
                };
                let info = FlowInfo {
                    flow_id,
                    scheme,
                    remote_ip,
                    remote_port,
                    default_host: None,
                };
                let shared = state.shared.clone();
                let certs = state.certs.clone();
                let mut end_tx = cmd_tx.clone();

                let task = tokio::spawn(async move {
                    let end = match proto {
                        FlowProto::Http => {
                            shared.metrics.http_flow();
                            http::mediate(stream, info, shared).await
                        }
                        FlowProto::Tls { sni } => {
                            shared.metrics.tls_flow();
                            tls::mediate_tls(stream, sni, info, shared, certs).await
                        }
                    };
                    let cmd = match end {
                        FlowEnd::Graceful => FlowCmd::Done { flow_id },
                        FlowEnd::Reset => FlowCmd::Reset { flow_id },
                    };
                    let _ = end_tx.send(cmd).await;
                });

                flows.insert(flow_id, FlowHandle { guest_tx, task });
            }

            Action::FlowData { flow_id, data } => {
                if let Some(handle) = flows.get(&flow_id) {
                    let _ = handle.guest_tx.unbounded_send(GuestEvent::Data(data));
                }
            }

            Action::FlowEof { flow_id } => {
                if let Some(handle) = flows.get(&flow_id) {
                    let _ = handle.guest_tx.unbounded_send(GuestEvent::Eof);
                }
            }

            Action::FlowClosed { flow_id } => {
                // Cancellation point: dropping the task aborts any in-flight
                // host request for this flow.
                if let Some(handle) = flows.remove(&flow_id) {
                    handle.close();
                }
            }
        }
    }

    Ok(())
}

/// Queue a frame for the link; when the queue is full, quench the guest
/// until the socket drains.
async fn send_frame_quenching(
    stack: &mut NetworkStack,
    frame_tx: &mpsc::Sender<Vec<u8>>,
    frame: Vec<u8>,
) -> Result<(), LinkError> {
    match frame_tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkError::Closed),
        Err(mpsc::error::TrySendError::Full(frame)) => {
            stack.set_link_blocked(true);
            let result = frame_tx.send(frame).await;
            stack.set_link_blocked(false);
            result.map_err(|_| LinkError::Closed)
        }
    }
}
