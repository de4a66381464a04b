mod support;

use std::net::Ipv4Addr;

use sandnet_packet::tcp::TcpFlags;
use sandnet_stack::{Action, FlowProto, NetworkStack, StackConfig};
use support::*;

const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

fn stack_up() -> (NetworkStack, StackConfig) {
    let mut stack = NetworkStack::new(StackConfig::default());
    let cfg = stack.config().clone();
    bring_up(&mut stack);
    (stack, cfg)
}

#[test]
fn http_prefix_is_admitted_with_buffered_bytes() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40000, REMOTE, 80, 1000, 100);

    let request = b"GET / HTTP/1.1\r\nHost: icanhazip.com\r\n\r\n";
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40000,
        80,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        request,
    );
    let actions = stack.handle_guest_frame(&frame, 110);

    let accepted = actions.iter().find_map(|a| match a {
        Action::FlowAccepted {
            flow_id,
            proto,
            remote_ip,
            remote_port,
            data,
        } => Some((*flow_id, proto.clone(), *remote_ip, *remote_port, data.clone())),
        _ => None,
    });
    let (flow_id, proto, remote_ip, remote_port, data) = accepted.expect("flow admitted");
    assert_eq!(proto, FlowProto::Http);
    assert_eq!(remote_ip, REMOTE);
    assert_eq!(remote_port, 80);
    assert_eq!(data, request);

    // Later segments surface as FlowData in order.
    let more = b"GET /again HTTP/1.1\r\n\r\n";
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40000,
        80,
        guest_next + request.len() as u32,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        more,
    );
    let actions = stack.handle_guest_frame(&frame, 120);
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::FlowData { flow_id: id, data } if *id == flow_id && data == more
    )));
}

#[test]
fn tls_client_hello_is_admitted_with_sni() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40001, REMOTE, 443, 5000, 100);

    let hello = build_client_hello(Some("api.github.com"));
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40001,
        443,
        guest_next,
        our_next,
        TcpFlags::ACK,
        65535,
        &hello,
    );
    let actions = stack.handle_guest_frame(&frame, 110);

    let accepted = actions.iter().find_map(|a| match a {
        Action::FlowAccepted { proto, data, .. } => Some((proto.clone(), data.clone())),
        _ => None,
    });
    let (proto, data) = accepted.expect("TLS flow admitted");
    assert_eq!(
        proto,
        FlowProto::Tls {
            sni: "api.github.com".into()
        }
    );
    assert_eq!(data, hello, "exact hello bytes must reach the mediator");
}

#[test]
fn tls_without_sni_is_reset() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40002, REMOTE, 443, 5000, 100);

    let hello = build_client_hello(None);
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40002,
        443,
        guest_next,
        our_next,
        TcpFlags::ACK,
        65535,
        &hello,
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    let reply_frames = frames(&actions);
    assert!(reply_frames
        .iter()
        .any(|f| parse_tcp_frame(f).flags & TcpFlags::RST != 0));
    assert!(!actions.iter().any(|a| matches!(a, Action::FlowAccepted { .. })));
    assert_eq!(stack.flow_count(), 0);
}

#[test]
fn connect_verb_is_reset() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40003, REMOTE, 443, 7000, 100);

    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40003,
        443,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        b"CONNECT proxy.example.com:443 HTTP/1.1\r\n\r\n",
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    let reply_frames = frames(&actions);
    assert!(reply_frames
        .iter()
        .any(|f| parse_tcp_frame(f).flags & TcpFlags::RST != 0));
    assert_eq!(stack.counters().flows_rejected_classifier, 1);
}

#[test]
fn garbage_bytes_are_reset() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40004, Ipv4Addr::new(10, 0, 2, 2), 22, 7000, 100);

    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        Ipv4Addr::new(10, 0, 2, 2),
        40004,
        22,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        b"SSH-2.0-OpenSSH_9.5\r\n",
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    let reply_frames = frames(&actions);
    assert!(reply_frames
        .iter()
        .any(|f| parse_tcp_frame(f).flags & TcpFlags::RST != 0));
}

#[test]
fn silent_flows_time_out_to_rst() {
    let (mut stack, cfg) = stack_up();
    // nc 10.0.2.2 22 — connects, sends nothing.
    let _ = open_flow(&mut stack, &cfg, 40005, Ipv4Addr::new(10, 0, 2, 2), 22, 7000, 100);
    assert_eq!(stack.flow_count(), 1);

    let deadline = stack.next_timer().expect("classifier deadline pending");
    assert_eq!(deadline, 100 + 5000);

    let actions = stack.handle_timers(deadline);
    let reply_frames = frames(&actions);
    assert!(reply_frames
        .iter()
        .any(|f| parse_tcp_frame(f).flags & TcpFlags::RST != 0));
    assert_eq!(stack.flow_count(), 0);
    assert_eq!(stack.counters().flows_rejected_classifier, 1);
}

#[test]
fn mediator_bytes_flow_back_and_get_acked() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40006, REMOTE, 80, 1000, 100);

    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40006,
        80,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        request,
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    let flow_id = actions
        .iter()
        .find_map(|a| match a {
            Action::FlowAccepted { flow_id, .. } => Some(*flow_id),
            _ => None,
        })
        .expect("flow admitted");

    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let actions = stack.flow_send(flow_id, response, 120);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    let seg = parse_tcp_frame(&reply_frames[0]);
    assert_eq!(seg.src_ip, REMOTE, "response impersonates the remote");
    assert_eq!(seg.src_port, 80);
    assert_eq!(seg.payload, response);
    assert_eq!(seg.seq, our_next);

    // Guest ACKs; mediator half-closes; guest sees FIN.
    let ack = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40006,
        80,
        guest_next + request.len() as u32,
        our_next + response.len() as u32,
        TcpFlags::ACK,
        65535,
        &[],
    );
    stack.handle_guest_frame(&ack, 130);

    let actions = stack.flow_shutdown(flow_id, 140);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    assert_ne!(parse_tcp_frame(&reply_frames[0]).flags & TcpFlags::FIN, 0);
}

#[test]
fn guest_fin_surfaces_as_flow_eof() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40007, REMOTE, 80, 1000, 100);

    let request = b"GET / HTTP/1.1\r\n\r\n";
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40007,
        80,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        request,
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    let flow_id = actions
        .iter()
        .find_map(|a| match a {
            Action::FlowAccepted { flow_id, .. } => Some(*flow_id),
            _ => None,
        })
        .expect("flow admitted");

    let fin = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40007,
        80,
        guest_next + request.len() as u32,
        our_next,
        TcpFlags::ACK | TcpFlags::FIN,
        65535,
        &[],
    );
    let actions = stack.handle_guest_frame(&fin, 120);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::FlowEof { flow_id: id } if *id == flow_id)));
}

#[test]
fn mediator_reset_rsts_the_guest() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40008, REMOTE, 80, 1000, 100);

    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40008,
        80,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        b"GET / HTTP/1.1\r\n\r\n",
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    let flow_id = actions
        .iter()
        .find_map(|a| match a {
            Action::FlowAccepted { flow_id, .. } => Some(*flow_id),
            _ => None,
        })
        .expect("flow admitted");

    let actions = stack.flow_reset(flow_id);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    assert_ne!(parse_tcp_frame(&reply_frames[0]).flags & TcpFlags::RST, 0);
    assert_eq!(stack.flow_count(), 0);
}

#[test]
fn fragmented_client_prefix_is_buffered_until_classifiable() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40009, REMOTE, 80, 1000, 100);

    // First half of the request line: no verdict yet.
    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40009,
        80,
        guest_next,
        our_next,
        TcpFlags::ACK,
        65535,
        b"GET /ind",
    );
    let actions = stack.handle_guest_frame(&frame, 110);
    assert!(!actions.iter().any(|a| matches!(a, Action::FlowAccepted { .. })));
    assert_eq!(stack.flow_count(), 1);

    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40009,
        80,
        guest_next + 8,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        b"ex.html HTTP/1.1\r\n\r\n",
    );
    let actions = stack.handle_guest_frame(&frame, 120);
    let data = actions
        .iter()
        .find_map(|a| match a {
            Action::FlowAccepted { data, .. } => Some(data.clone()),
            _ => None,
        })
        .expect("flow admitted after reassembly");
    assert_eq!(data, b"GET /index.html HTTP/1.1\r\n\r\n");
}

#[test]
fn bad_tcp_checksum_resets_the_flow() {
    let (mut stack, cfg) = stack_up();
    let (our_next, guest_next) = open_flow(&mut stack, &cfg, 40010, REMOTE, 80, 1000, 100);

    let mut frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        40010,
        80,
        guest_next,
        our_next,
        TcpFlags::ACK | TcpFlags::PSH,
        65535,
        b"GET / HTTP/1.1\r\n\r\n",
    );
    // Corrupt a payload byte after checksumming.
    let last = frame.len() - 1;
    frame[last] ^= 0xff;

    let actions = stack.handle_guest_frame(&frame, 110);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    assert_ne!(parse_tcp_frame(&reply_frames[0]).flags & TcpFlags::RST, 0);
    assert_eq!(stack.flow_count(), 0);
}

#[test]
fn stray_segment_for_unknown_flow_gets_rst() {
    let (mut stack, cfg) = stack_up();

    let frame = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        REMOTE,
        41000,
        80,
        123456,
        654321,
        TcpFlags::ACK,
        65535,
        b"late data",
    );
    let actions = stack.handle_guest_frame(&frame, 50);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1);
    let rst = parse_tcp_frame(&reply_frames[0]);
    assert_ne!(rst.flags & TcpFlags::RST, 0);
    assert_eq!(rst.seq, 654321);
}
