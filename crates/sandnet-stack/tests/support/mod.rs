//! Frame-building helpers shared by the stack integration tests.
#![allow(dead_code)]

use std::net::Ipv4Addr;

use sandnet_packet::dns::{encode_qname, DNS_CLASS_IN, DNS_TYPE_A};
use sandnet_packet::ethernet::{EthernetFrame, EthernetFrameBuilder, ETHERTYPE_IPV4};
use sandnet_packet::ipv4::{Ipv4Packet, Ipv4PacketBuilder, IPPROTO_TCP, IPPROTO_UDP};
use sandnet_packet::tcp::{TcpSegment, TcpSegmentBuilder};
use sandnet_packet::udp::{UdpPacket, UdpPacketBuilder};
use sandnet_packet::MacAddr;
use sandnet_stack::{Action, NetworkStack, StackConfig};

pub const GUEST_MAC: MacAddr = MacAddr([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

pub fn wrap_ipv4(
    dest_mac: MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> Vec<u8> {
    let ip = Ipv4PacketBuilder {
        src,
        dst,
        protocol,
        ident: 99,
        ttl: 64,
        payload,
    }
    .build_vec()
    .unwrap();
    EthernetFrameBuilder {
        dest_mac,
        src_mac: GUEST_MAC,
        ethertype: ETHERTYPE_IPV4,
        payload: &ip,
    }
    .build_vec()
    .unwrap()
}

pub fn wrap_udp(
    dest_mac: MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp = UdpPacketBuilder {
        src,
        dst,
        src_port,
        dst_port,
        payload,
    }
    .build_vec()
    .unwrap();
    wrap_ipv4(dest_mac, src, dst, IPPROTO_UDP, &udp)
}

#[allow(clippy::too_many_arguments)]
pub fn wrap_tcp(
    dest_mac: MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp = TcpSegmentBuilder {
        src,
        dst,
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        mss: None,
        payload,
    }
    .build_vec()
    .unwrap();
    wrap_ipv4(dest_mac, src, dst, IPPROTO_TCP, &tcp)
}

pub fn build_dhcp_discover(xid: u32, mac: MacAddr) -> Vec<u8> {
    let mut msg = vec![0u8; 236];
    msg[0] = 1; // BOOTREQUEST
    msg[1] = 1;
    msg[2] = 6;
    msg[4..8].copy_from_slice(&xid.to_be_bytes());
    msg[28..34].copy_from_slice(&mac.0);
    msg.extend_from_slice(&[99, 130, 83, 99]);
    msg.extend_from_slice(&[53, 1, 1, 255]);
    msg
}

pub fn build_dhcp_request(xid: u32, mac: MacAddr, requested: Ipv4Addr) -> Vec<u8> {
    let mut msg = vec![0u8; 236];
    msg[0] = 1;
    msg[1] = 1;
    msg[2] = 6;
    msg[4..8].copy_from_slice(&xid.to_be_bytes());
    msg[28..34].copy_from_slice(&mac.0);
    msg.extend_from_slice(&[99, 130, 83, 99]);
    msg.extend_from_slice(&[53, 1, 3]);
    msg.extend_from_slice(&[50, 4]);
    msg.extend_from_slice(&requested.octets());
    msg.push(255);
    msg
}

pub fn build_dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut q = Vec::new();
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    q.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    q.extend_from_slice(&[0; 6]);
    q.extend_from_slice(&encode_qname(name).unwrap());
    q.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
    q.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
    q
}

/// Run the DHCP handshake so the stack considers the lease assigned.
pub fn bring_up(stack: &mut NetworkStack) {
    let cfg = stack.config().clone();
    let discover = wrap_udp(
        MacAddr::BROADCAST,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &build_dhcp_discover(0x1111, GUEST_MAC),
    );
    let actions = stack.handle_guest_frame(&discover, 0);
    assert!(!actions.is_empty(), "expected a DHCP OFFER");

    let request = wrap_udp(
        MacAddr::BROADCAST,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &build_dhcp_request(0x1111, GUEST_MAC, cfg.guest_ip),
    );
    let actions = stack.handle_guest_frame(&request, 1);
    assert!(!actions.is_empty(), "expected a DHCP ACK");
    assert!(stack.is_ip_assigned());
}

/// All EmitFrame payloads from an action batch.
pub fn frames(actions: &[Action]) -> Vec<Vec<u8>> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::EmitFrame(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

pub struct ParsedTcp {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Vec<u8>,
}

pub fn parse_tcp_frame(frame: &[u8]) -> ParsedTcp {
    let eth = EthernetFrame::parse(frame).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    let seg = TcpSegment::parse(ip.payload, ip.src, ip.dst).unwrap();
    ParsedTcp {
        src_ip: ip.src,
        dst_ip: ip.dst,
        src_port: seg.src_port,
        dst_port: seg.dst_port,
        seq: seg.seq,
        ack: seg.ack,
        flags: seg.flags,
        window: seg.window,
        payload: seg.payload.to_vec(),
    }
}

pub fn parse_udp_frame(frame: &[u8]) -> (Ipv4Addr, Ipv4Addr, u16, u16, Vec<u8>) {
    let eth = EthernetFrame::parse(frame).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    let udp = UdpPacket::parse(ip.payload, ip.src, ip.dst).unwrap();
    (ip.src, ip.dst, udp.src_port, udp.dst_port, udp.payload.to_vec())
}

/// Minimal TLS ClientHello carrying `sni`, as a guest TLS client would open
/// with.
pub fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);

    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let mut entry = Vec::new();
        entry.push(0u8); // host_name
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name.as_bytes());
        let mut list = Vec::new();
        list.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        list.extend_from_slice(&entry);
        extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name
        extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&list);
    }
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(0x01);
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut wire = Vec::new();
    wire.push(0x16);
    wire.extend_from_slice(&[0x03, 0x01]);
    wire.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    wire.extend_from_slice(&handshake);
    wire
}

/// Complete a TCP handshake toward `remote`; returns (our SYN-ACK seq + 1,
/// guest next seq).
pub fn open_flow(
    stack: &mut NetworkStack,
    cfg: &StackConfig,
    guest_port: u16,
    remote: Ipv4Addr,
    remote_port: u16,
    guest_isn: u32,
    now: u64,
) -> (u32, u32) {
    let syn = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        remote,
        guest_port,
        remote_port,
        guest_isn,
        0,
        sandnet_packet::tcp::TcpFlags::SYN,
        65535,
        &[],
    );
    let actions = stack.handle_guest_frame(&syn, now);
    let reply_frames = frames(&actions);
    assert_eq!(reply_frames.len(), 1, "expected a SYN-ACK");
    let syn_ack = parse_tcp_frame(&reply_frames[0]);
    assert_eq!(
        syn_ack.flags,
        sandnet_packet::tcp::TcpFlags::SYN | sandnet_packet::tcp::TcpFlags::ACK
    );
    assert_eq!(syn_ack.ack, guest_isn + 1);

    let ack = wrap_tcp(
        cfg.our_mac,
        cfg.guest_ip,
        remote,
        guest_port,
        remote_port,
        guest_isn + 1,
        syn_ack.seq.wrapping_add(1),
        sandnet_packet::tcp::TcpFlags::ACK,
        65535,
        &[],
    );
    let actions = stack.handle_guest_frame(&ack, now + 1);
    assert!(frames(&actions).is_empty());

    (syn_ack.seq.wrapping_add(1), guest_isn + 1)
}
