//! The sans-I/O network stack terminating the guest link.
//!
//! Frames from the guest NIC go in, [`Action`]s come out. The stack owns
//! ARP, DHCP, ICMP echo, the UDP/DNS gate and every TCP flow; the driver
//! fulfills actions (frame writes, host DNS lookups, mediator lifecycles)
//! and feeds results back in. All timing is explicit through a millisecond
//! clock so behavior is fully deterministic under test.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use sandnet_packet::arp::{ArpPacket, ARP_OP_REPLY, ARP_OP_REQUEST};
use sandnet_packet::dhcp::{DhcpMessageType, DhcpReplyBuilder, DhcpRequest};
use sandnet_packet::dns::{
    parse_single_query, DnsResponseBuilder, DnsResponseCode, DNS_CLASS_IN, DNS_TYPE_A,
};
use sandnet_packet::ethernet::{EthernetFrame, EthernetFrameBuilder, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use sandnet_packet::icmp::{
    IcmpEcho, IcmpUnreachableBuilder, ICMP_CODE_FRAGMENTATION_NEEDED, ICMP_TYPE_ECHO_REQUEST,
};
use sandnet_packet::ipv4::{Ipv4Packet, Ipv4PacketBuilder, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use sandnet_packet::tcp::{TcpFlags, TcpSegment, TcpSegmentBuilder};
use sandnet_packet::tls_hello;
use sandnet_packet::udp::{UdpPacket, UdpPacketBuilder};
use sandnet_packet::{MacAddr, PacketError};

use crate::classifier::{self, Verdict};
use crate::policy;
use crate::tcp::{Millis, SegmentOut, StreamEvent, TcpConn};

const EGRESS_TTL: u8 = 64;

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub our_mac: MacAddr,
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
    pub mtu: u16,

    pub dhcp_lease_time_secs: u32,
    /// Ceiling applied to TTLs in DNS answers handed to the guest.
    pub dns_max_ttl_secs: u32,

    /// Concurrent TCP flow cap; additional SYNs are answered with RST.
    pub max_flows: u32,
    /// In-flight host DNS resolution cap; excess queries get SERVFAIL.
    pub max_pending_dns: u32,

    /// Never hand internal-range IPs to the guest in DNS answers.
    pub block_internal_ranges: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            our_mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            gateway_ip: Ipv4Addr::new(10, 0, 2, 2),
            guest_ip: Ipv4Addr::new(10, 0, 2, 15),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns_ip: Ipv4Addr::new(10, 0, 2, 3),
            mtu: 1500,
            dhcp_lease_time_secs: 3600,
            dns_max_ttl_secs: 60,
            max_flows: 1024,
            max_pending_dns: 256,
            block_internal_ranges: true,
        }
    }
}

/// What an admitted flow speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowProto {
    Http,
    Tls { sni: String },
}

/// Work the driver must perform on behalf of the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver an Ethernet frame to the guest NIC.
    EmitFrame(Vec<u8>),

    /// Resolve a hostname with the host resolver.
    DnsResolve { request_id: u32, name: String },

    /// A flow passed classification; start a mediator for it. `data` is the
    /// client prefix buffered during classification, in order.
    FlowAccepted {
        flow_id: u32,
        proto: FlowProto,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        data: Vec<u8>,
    },
    /// In-order client bytes for an accepted flow.
    FlowData { flow_id: u32, data: Vec<u8> },
    /// The guest half-closed an accepted flow.
    FlowEof { flow_id: u32 },
    /// The flow is gone (reset, retry exhaustion, or fully closed); cancel
    /// its mediator.
    FlowClosed { flow_id: u32 },
}

/// Host resolver result fed back via the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResolved {
    pub request_id: u32,
    pub name: String,
    pub addr: Option<Ipv4Addr>,
    pub ttl_secs: u32,
}

/// Drop/abort counters, exported for the driver's logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackCounters {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Frames dropped at the link layer (parse failures, foreign MACs,
    /// unknown EtherTypes).
    pub link_drops: u64,
    /// IPv4 datagrams dropped (bad checksum, fragments, unknown protocol).
    pub l3_drops: u64,
    /// UDP datagrams outside the DNS gate.
    pub udp_drops: u64,
    /// Flows torn down with a RST by this side.
    pub tcp_resets: u64,
    pub flows_rejected_classifier: u64,
    pub flows_rejected_capacity: u64,
    pub dns_queries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    guest_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
}

enum FlowPhase {
    /// Buffering the client prefix until the classifier decides.
    Classifying { buf: Vec<u8>, deadline: Millis },
    Accepted,
}

struct Flow {
    id: u32,
    conn: TcpConn,
    phase: FlowPhase,
}

struct PendingDns {
    txid: u16,
    src_port: u16,
    server_ip: Ipv4Addr,
    qname: Vec<u8>,
    qtype: u16,
    qclass: u16,
    rd: bool,
}

pub struct NetworkStack {
    cfg: StackConfig,
    guest_mac: Option<MacAddr>,
    ip_assigned: bool,
    ipv4_ident: u16,
    next_flow_id: u32,
    next_dns_id: u32,
    flows: HashMap<FlowKey, Flow>,
    by_id: HashMap<u32, FlowKey>,
    pending_dns: HashMap<u32, PendingDns>,
    counters: StackCounters,
    /// While the frame socket is write-blocked the guest is quenched with a
    /// zero receive window.
    link_blocked: bool,
}

impl NetworkStack {
    pub fn new(cfg: StackConfig) -> Self {
        Self {
            cfg,
            guest_mac: None,
            ip_assigned: false,
            ipv4_ident: 1,
            next_flow_id: 1,
            next_dns_id: 1,
            flows: HashMap::new(),
            by_id: HashMap::new(),
            pending_dns: HashMap::new(),
            counters: StackCounters::default(),
            link_blocked: false,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn counters(&self) -> StackCounters {
        self.counters
    }

    pub fn is_ip_assigned(&self) -> bool {
        self.ip_assigned
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Quench/unquench the guest while the frame socket is write-blocked.
    pub fn set_link_blocked(&mut self, blocked: bool) {
        self.link_blocked = blocked;
    }

    /// Main ingress entry point: one Ethernet frame from the guest.
    pub fn handle_guest_frame(&mut self, frame: &[u8], now: Millis) -> Vec<Action> {
        self.counters.frames_in += 1;

        let eth = match EthernetFrame::parse(frame) {
            Ok(eth) => eth,
            Err(err) => {
                self.counters.link_drops += 1;
                tracing::debug!(%err, "dropping unparsable frame");
                return Vec::new();
            }
        };

        // Only unicast to us and broadcast are accepted.
        let dest = eth.dest_mac();
        if dest != self.cfg.our_mac && !dest.is_broadcast() {
            self.counters.link_drops += 1;
            return Vec::new();
        }

        self.guest_mac.get_or_insert(eth.src_mac());

        match eth.ethertype() {
            ETHERTYPE_ARP => self.handle_arp(eth.payload()),
            ETHERTYPE_IPV4 => self.handle_ipv4(eth.payload(), now),
            _ => {
                self.counters.link_drops += 1;
                Vec::new()
            }
        }
    }

    fn handle_arp(&mut self, payload: &[u8]) -> Vec<Action> {
        let arp = match ArpPacket::parse(payload) {
            Ok(arp) => arp,
            Err(_) => {
                self.counters.link_drops += 1;
                return Vec::new();
            }
        };

        if self.ip_assigned && arp.sender_ip == self.cfg.guest_ip {
            self.guest_mac = Some(arp.sender_mac);
        }

        if arp.op != ARP_OP_REQUEST {
            return Vec::new();
        }
        if arp.target_ip != self.cfg.gateway_ip && arp.target_ip != self.cfg.dns_ip {
            return Vec::new();
        }

        let reply = ArpPacket {
            op: ARP_OP_REPLY,
            sender_mac: self.cfg.our_mac,
            sender_ip: arp.target_ip,
            target_mac: arp.sender_mac,
            target_ip: arp.sender_ip,
        };
        let Ok(payload) = reply.build_vec() else {
            return Vec::new();
        };
        let frame = EthernetFrameBuilder {
            dest_mac: arp.sender_mac,
            src_mac: self.cfg.our_mac,
            ethertype: ETHERTYPE_ARP,
            payload: &payload,
        }
        .build_vec();
        match frame {
            Ok(frame) => {
                let mut out = Vec::new();
                self.emit_frame(&mut out, frame);
                out
            }
            Err(_) => Vec::new(),
        }
    }

    fn handle_ipv4(&mut self, payload: &[u8], now: Millis) -> Vec<Action> {
        let ip = match Ipv4Packet::parse(payload) {
            Ok(ip) => ip,
            Err(err) => {
                self.counters.l3_drops += 1;
                tracing::debug!(%err, "dropping invalid IPv4 datagram");
                return Vec::new();
            }
        };

        // No reassembly: fragments are answered with "fragmentation needed"
        // so the guest backs down to the path MTU.
        if ip.is_fragment() {
            self.counters.l3_drops += 1;
            return self.emit_fragmentation_needed(payload);
        }

        match ip.protocol {
            IPPROTO_ICMP => self.handle_icmp(&ip),
            IPPROTO_UDP => self.handle_udp(&ip, now),
            IPPROTO_TCP => self.handle_tcp(&ip, now),
            _ => {
                self.counters.l3_drops += 1;
                Vec::new()
            }
        }
    }

    /// Echo requests to ANY destination are answered locally: the guest sees
    /// universal ping connectivity without anything being forwarded.
    fn handle_icmp(&mut self, ip: &Ipv4Packet<'_>) -> Vec<Action> {
        let echo = match IcmpEcho::parse(ip.payload) {
            Ok(echo) => echo,
            Err(_) => {
                self.counters.l3_drops += 1;
                return Vec::new();
            }
        };
        if echo.icmp_type != ICMP_TYPE_ECHO_REQUEST || echo.code != 0 {
            return Vec::new();
        }
        let Ok(reply) = echo.reply().build_vec() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.emit_ipv4(&mut out, ip.dst, self.cfg.guest_ip, IPPROTO_ICMP, &reply);
        out
    }

    fn emit_fragmentation_needed(&mut self, original: &[u8]) -> Vec<Action> {
        let Ok(icmp) = (IcmpUnreachableBuilder {
            code: ICMP_CODE_FRAGMENTATION_NEEDED,
            next_hop_mtu: self.cfg.mtu,
            original,
        })
        .build_vec() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.emit_ipv4(
            &mut out,
            self.cfg.gateway_ip,
            self.cfg.guest_ip,
            IPPROTO_ICMP,
            &icmp,
        );
        out
    }

    fn handle_udp(&mut self, ip: &Ipv4Packet<'_>, now: Millis) -> Vec<Action> {
        let udp = match UdpPacket::parse(ip.payload, ip.src, ip.dst) {
            Ok(udp) => udp,
            Err(_) => {
                self.counters.l3_drops += 1;
                return Vec::new();
            }
        };

        if udp.src_port == 68 && udp.dst_port == 67 {
            return self.handle_dhcp(udp.payload);
        }

        // The DNS gate is the only UDP path; everything else drops silently.
        if udp.dst_port == 53 {
            return self.handle_dns_query(ip, &udp, now);
        }

        self.counters.udp_drops += 1;
        Vec::new()
    }

    fn handle_dhcp(&mut self, payload: &[u8]) -> Vec<Action> {
        let request = match DhcpRequest::parse(payload) {
            Ok(request) => request,
            Err(_) => return Vec::new(),
        };

        let reply_type = match request.message_type {
            DhcpMessageType::Discover => DhcpMessageType::Offer,
            DhcpMessageType::Request => DhcpMessageType::Ack,
            _ => return Vec::new(),
        };

        let Ok(dhcp) = (DhcpReplyBuilder {
            message_type: reply_type,
            transaction_id: request.transaction_id,
            client_mac: request.client_mac,
            your_ip: self.cfg.guest_ip,
            server_ip: self.cfg.gateway_ip,
            subnet_mask: self.cfg.netmask,
            router: self.cfg.gateway_ip,
            dns_server: self.cfg.dns_ip,
            lease_time_secs: self.cfg.dhcp_lease_time_secs,
            mtu: self.cfg.mtu,
        })
        .build_vec() else {
            return Vec::new();
        };

        if reply_type == DhcpMessageType::Ack {
            self.ip_assigned = true;
            self.guest_mac = Some(request.client_mac);
        }

        let mut out = Vec::new();

        // Broadcast copy for clients still at 0.0.0.0...
        let udp = UdpPacketBuilder {
            src: self.cfg.gateway_ip,
            dst: Ipv4Addr::BROADCAST,
            src_port: 67,
            dst_port: 68,
            payload: &dhcp,
        };
        if let Ok(udp) = udp.build_vec() {
            self.emit_ipv4_to_mac(
                &mut out,
                MacAddr::BROADCAST,
                self.cfg.gateway_ip,
                Ipv4Addr::BROADCAST,
                IPPROTO_UDP,
                &udp,
            );
        }

        // ...plus a unicast copy for stacks that only accept directed
        // replies once the lease is known.
        if request.client_mac != MacAddr::BROADCAST {
            let udp = UdpPacketBuilder {
                src: self.cfg.gateway_ip,
                dst: self.cfg.guest_ip,
                src_port: 67,
                dst_port: 68,
                payload: &dhcp,
            };
            if let Ok(udp) = udp.build_vec() {
                self.emit_ipv4_to_mac(
                    &mut out,
                    request.client_mac,
                    self.cfg.gateway_ip,
                    self.cfg.guest_ip,
                    IPPROTO_UDP,
                    &udp,
                );
            }
        }

        out
    }

    fn handle_dns_query(
        &mut self,
        ip: &Ipv4Packet<'_>,
        udp: &UdpPacket<'_>,
        _now: Millis,
    ) -> Vec<Action> {
        let query = match parse_single_query(udp.payload) {
            Ok(query) => query,
            Err(_) => {
                self.counters.udp_drops += 1;
                return Vec::new();
            }
        };
        self.counters.dns_queries += 1;

        let name = match query.name() {
            Ok(name) => name,
            Err(_) => {
                return self.emit_dns_response(
                    ip.dst,
                    udp.src_port,
                    query.id,
                    query.recursion_desired(),
                    query.qname.to_vec(),
                    query.qtype,
                    query.qclass,
                    DnsResponseCode::FormatError,
                    None,
                    0,
                );
            }
        };

        // Only A/IN is resolved; NOTIMP lets clients fall back to A instead
        // of treating the name as missing.
        if query.qtype != DNS_TYPE_A || query.qclass != DNS_CLASS_IN {
            return self.emit_dns_response(
                ip.dst,
                udp.src_port,
                query.id,
                query.recursion_desired(),
                query.qname.to_vec(),
                query.qtype,
                query.qclass,
                DnsResponseCode::NotImplemented,
                None,
                0,
            );
        }

        let max_pending = self.cfg.max_pending_dns as usize;
        if max_pending == 0 || self.pending_dns.len() >= max_pending {
            return self.emit_dns_response(
                ip.dst,
                udp.src_port,
                query.id,
                query.recursion_desired(),
                query.qname.to_vec(),
                query.qtype,
                query.qclass,
                DnsResponseCode::ServerFailure,
                None,
                0,
            );
        }

        let request_id = self.next_dns_id;
        self.next_dns_id = self.next_dns_id.wrapping_add(1);
        self.pending_dns.insert(
            request_id,
            PendingDns {
                txid: query.id,
                src_port: udp.src_port,
                server_ip: ip.dst,
                qname: query.qname.to_vec(),
                qtype: query.qtype,
                qclass: query.qclass,
                rd: query.recursion_desired(),
            },
        );
        vec![Action::DnsResolve { request_id, name }]
    }

    /// Host resolver verdict for a pending query. Answers are always
    /// synthesized: the guest never sees upstream DNS bytes, and the TTL is
    /// clamped so rebinding windows stay short.
    pub fn handle_dns_resolved(&mut self, resolved: DnsResolved, _now: Millis) -> Vec<Action> {
        let Some(pending) = self.pending_dns.remove(&resolved.request_id) else {
            return Vec::new();
        };

        let addr = resolved.addr.filter(|ip| {
            !self.cfg.block_internal_ranges || !policy::is_internal_ip(*ip)
        });

        let (rcode, ttl) = match addr {
            Some(_) => (
                DnsResponseCode::NoError,
                resolved.ttl_secs.min(self.cfg.dns_max_ttl_secs),
            ),
            None => (DnsResponseCode::NameError, 0),
        };

        self.emit_dns_response(
            pending.server_ip,
            pending.src_port,
            pending.txid,
            pending.rd,
            pending.qname,
            pending.qtype,
            pending.qclass,
            rcode,
            addr,
            ttl,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_dns_response(
        &mut self,
        server_ip: Ipv4Addr,
        guest_port: u16,
        txid: u16,
        rd: bool,
        qname: Vec<u8>,
        qtype: u16,
        qclass: u16,
        rcode: DnsResponseCode,
        answer: Option<Ipv4Addr>,
        ttl_secs: u32,
    ) -> Vec<Action> {
        let Ok(dns) = (DnsResponseBuilder {
            id: txid,
            recursion_desired: rd,
            rcode,
            qname: &qname,
            qtype,
            qclass,
            answer,
            ttl_secs,
        })
        .build_vec() else {
            return Vec::new();
        };
        let udp = UdpPacketBuilder {
            src: server_ip,
            dst: self.cfg.guest_ip,
            src_port: 53,
            dst_port: guest_port,
            payload: &dns,
        };
        let Ok(udp) = udp.build_vec() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.emit_ipv4(&mut out, server_ip, self.cfg.guest_ip, IPPROTO_UDP, &udp);
        out
    }

    fn handle_tcp(&mut self, ip: &Ipv4Packet<'_>, now: Millis) -> Vec<Action> {
        if !self.ip_assigned || ip.src != self.cfg.guest_ip {
            self.counters.l3_drops += 1;
            return Vec::new();
        }

        let seg = match TcpSegment::parse(ip.payload, ip.src, ip.dst) {
            Ok(seg) => seg,
            Err(PacketError::Malformed("TCP checksum mismatch")) => {
                // Fatal for the flow it belongs to; the unverified ports are
                // still good enough to find it.
                return self.reset_flow_for_bad_checksum(ip, now);
            }
            Err(_) => {
                self.counters.l3_drops += 1;
                return Vec::new();
            }
        };

        let key = FlowKey {
            guest_port: seg.src_port,
            remote_ip: ip.dst,
            remote_port: seg.dst_port,
        };

        if !self.flows.contains_key(&key) {
            return self.handle_tcp_new(key, &seg, now);
        }

        // Take the flow out so frame emission can borrow `self` mutably.
        let mut flow = self.flows.remove(&key).expect("flow present");
        let (segments, events) = flow.conn.on_segment(
            seg.seq,
            seg.ack,
            seg.flags,
            seg.window,
            seg.payload,
            now,
        );

        let mut out = Vec::new();
        for segment in segments {
            self.emit_tcp_segment(&mut out, key, segment);
        }
        self.process_stream_events(&mut out, key, &mut flow, events, now);
        self.reinsert_or_forget(key, flow);
        out
    }

    fn handle_tcp_new(&mut self, key: FlowKey, seg: &TcpSegment<'_>, now: Millis) -> Vec<Action> {
        let mut out = Vec::new();

        if seg.flags & TcpFlags::RST != 0 {
            return out;
        }
        if seg.flags & TcpFlags::SYN == 0 || seg.flags & TcpFlags::ACK != 0 {
            // Straggler for a dead flow: answer with a RST so the guest
            // gives up immediately.
            let rst = TcpSegmentBuilder {
                src: key.remote_ip,
                dst: self.cfg.guest_ip,
                src_port: key.remote_port,
                dst_port: key.guest_port,
                seq: seg.ack,
                ack: seg.seq.wrapping_add(seg.payload.len() as u32),
                flags: TcpFlags::RST | TcpFlags::ACK,
                window: 0,
                mss: None,
                payload: &[],
            };
            if let Ok(rst) = rst.build_vec() {
                self.emit_ipv4(&mut out, key.remote_ip, self.cfg.guest_ip, IPPROTO_TCP, &rst);
            }
            return out;
        }

        // Flow cap: reject additional SYNs outright.
        if self.flows.len() >= self.cfg.max_flows as usize {
            self.counters.flows_rejected_capacity += 1;
            self.counters.tcp_resets += 1;
            let rst = TcpSegmentBuilder {
                src: key.remote_ip,
                dst: self.cfg.guest_ip,
                src_port: key.remote_port,
                dst_port: key.guest_port,
                seq: 0,
                ack: seg.seq.wrapping_add(1),
                flags: TcpFlags::RST | TcpFlags::ACK,
                window: 0,
                mss: None,
                payload: &[],
            };
            if let Ok(rst) = rst.build_vec() {
                self.emit_ipv4(&mut out, key.remote_ip, self.cfg.guest_ip, IPPROTO_TCP, &rst);
            }
            return out;
        }

        let flow_id = self.next_flow_id;
        self.next_flow_id = self.next_flow_id.wrapping_add(1);
        let our_isn: u32 = rand::random();

        let (conn, syn_ack) = TcpConn::accept(seg.seq, our_isn, now);
        let flow = Flow {
            id: flow_id,
            conn,
            phase: FlowPhase::Classifying {
                buf: Vec::new(),
                deadline: now + classifier::CLASSIFY_TIMEOUT_MS,
            },
        };

        self.emit_tcp_segment(&mut out, key, syn_ack);
        self.by_id.insert(flow_id, key);
        self.flows.insert(key, flow);
        tracing::debug!(
            flow_id,
            remote = %key.remote_ip,
            port = key.remote_port,
            "accepted guest SYN"
        );
        out
    }

    fn reset_flow_for_bad_checksum(&mut self, ip: &Ipv4Packet<'_>, _now: Millis) -> Vec<Action> {
        self.counters.l3_drops += 1;
        if ip.payload.len() < TcpSegment::MIN_HEADER_LEN {
            return Vec::new();
        }
        let key = FlowKey {
            guest_port: u16::from_be_bytes([ip.payload[0], ip.payload[1]]),
            remote_ip: ip.dst,
            remote_port: u16::from_be_bytes([ip.payload[2], ip.payload[3]]),
        };
        let Some(mut flow) = self.flows.remove(&key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.abort_flow(&mut out, key, &mut flow);
        out
    }

    /// RST a flow and notify its mediator (if one was ever started).
    fn abort_flow(&mut self, out: &mut Vec<Action>, key: FlowKey, flow: &mut Flow) {
        self.counters.tcp_resets += 1;
        if let Some(rst) = flow.conn.reset() {
            self.emit_tcp_segment(out, key, rst);
        }
        if matches!(flow.phase, FlowPhase::Accepted) {
            out.push(Action::FlowClosed { flow_id: flow.id });
        }
        self.by_id.remove(&flow.id);
    }

    fn process_stream_events(
        &mut self,
        out: &mut Vec<Action>,
        key: FlowKey,
        flow: &mut Flow,
        events: Vec<StreamEvent>,
        now: Millis,
    ) {
        for event in events {
            match event {
                StreamEvent::Data(data) => self.on_flow_data(out, key, flow, data, now),
                StreamEvent::Eof => {
                    match flow.phase {
                        FlowPhase::Accepted => out.push(Action::FlowEof { flow_id: flow.id }),
                        FlowPhase::Classifying { .. } => {
                            // Half-closed before the protocol was clear:
                            // nothing can be mediated, drop the flow.
                            self.counters.flows_rejected_classifier += 1;
                            self.abort_flow(out, key, flow);
                            return;
                        }
                    }
                }
                StreamEvent::Closed => {
                    if matches!(flow.phase, FlowPhase::Accepted) {
                        out.push(Action::FlowClosed { flow_id: flow.id });
                    }
                    self.by_id.remove(&flow.id);
                    return;
                }
            }
        }
    }

    fn on_flow_data(
        &mut self,
        out: &mut Vec<Action>,
        key: FlowKey,
        flow: &mut Flow,
        data: Vec<u8>,
        _now: Millis,
    ) {
        let FlowPhase::Classifying { buf, .. } = &mut flow.phase else {
            out.push(Action::FlowData {
                flow_id: flow.id,
                data,
            });
            return;
        };

        buf.extend_from_slice(&data);

        match classifier::classify(buf) {
            Verdict::NeedMore => {
                if buf.len() >= classifier::MAX_CLASSIFY_BYTES {
                    self.counters.flows_rejected_classifier += 1;
                    self.abort_flow(out, key, flow);
                }
            }
            Verdict::Reject => {
                self.counters.flows_rejected_classifier += 1;
                self.abort_flow(out, key, flow);
            }
            Verdict::Http => {
                let data = std::mem::take(buf);
                flow.phase = FlowPhase::Accepted;
                out.push(Action::FlowAccepted {
                    flow_id: flow.id,
                    proto: FlowProto::Http,
                    remote_ip: key.remote_ip,
                    remote_port: key.remote_port,
                    data,
                });
            }
            Verdict::Tls => match tls_hello::parse_client_hello_sni(buf) {
                Ok(Some(sni)) => {
                    let data = std::mem::take(buf);
                    flow.phase = FlowPhase::Accepted;
                    out.push(Action::FlowAccepted {
                        flow_id: flow.id,
                        proto: FlowProto::Tls { sni },
                        remote_ip: key.remote_ip,
                        remote_port: key.remote_port,
                        data,
                    });
                }
                // No SNI: there is nothing to mint a leaf for.
                Ok(None) => {
                    self.counters.flows_rejected_classifier += 1;
                    self.abort_flow(out, key, flow);
                }
                Err(PacketError::Truncated { .. }) => {
                    if buf.len() > tls_hello::MAX_CLIENT_HELLO_LEN {
                        self.counters.flows_rejected_classifier += 1;
                        self.abort_flow(out, key, flow);
                    }
                }
                Err(_) => {
                    self.counters.flows_rejected_classifier += 1;
                    self.abort_flow(out, key, flow);
                }
            },
        }
    }

    fn reinsert_or_forget(&mut self, key: FlowKey, flow: Flow) {
        if flow.conn.is_closed() {
            self.by_id.remove(&flow.id);
            return;
        }
        self.flows.insert(key, flow);
    }

    /// Queue mediator bytes toward the guest.
    pub fn flow_send(&mut self, flow_id: u32, data: &[u8], now: Millis) -> Vec<Action> {
        let Some(key) = self.by_id.get(&flow_id).copied() else {
            return Vec::new();
        };
        let Some(mut flow) = self.flows.remove(&key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for segment in flow.conn.send(data, now) {
            self.emit_tcp_segment(&mut out, key, segment);
        }
        self.reinsert_or_forget(key, flow);
        out
    }

    /// Mediator finished writing: half-close toward the guest.
    pub fn flow_shutdown(&mut self, flow_id: u32, now: Millis) -> Vec<Action> {
        let Some(key) = self.by_id.get(&flow_id).copied() else {
            return Vec::new();
        };
        let Some(mut flow) = self.flows.remove(&key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for segment in flow.conn.shutdown(now) {
            self.emit_tcp_segment(&mut out, key, segment);
        }
        self.reinsert_or_forget(key, flow);
        out
    }

    /// Mediator failure mid-stream: abort the guest side.
    pub fn flow_reset(&mut self, flow_id: u32) -> Vec<Action> {
        let Some(key) = self.by_id.remove(&flow_id) else {
            return Vec::new();
        };
        let Some(mut flow) = self.flows.remove(&key) else {
            return Vec::new();
        };
        self.counters.tcp_resets += 1;
        let mut out = Vec::new();
        if let Some(rst) = flow.conn.reset() {
            self.emit_tcp_segment(&mut out, key, rst);
        }
        out
    }

    /// Fire expired per-flow timers (RTO, delayed ACK, TIME_WAIT,
    /// classification timeout).
    pub fn handle_timers(&mut self, now: Millis) -> Vec<Action> {
        let mut out = Vec::new();
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();

        for key in keys {
            let Some(mut flow) = self.flows.remove(&key) else {
                continue;
            };

            if let FlowPhase::Classifying { deadline, .. } = flow.phase {
                if now >= deadline {
                    self.counters.flows_rejected_classifier += 1;
                    self.abort_flow(&mut out, key, &mut flow);
                    continue;
                }
            }

            let (segments, events) = flow.conn.on_timer(now);
            for segment in segments {
                self.emit_tcp_segment(&mut out, key, segment);
            }
            self.process_stream_events(&mut out, key, &mut flow, events, now);
            self.reinsert_or_forget(key, flow);
        }

        out
    }

    /// Earliest deadline across all flows, for the driver's sleep.
    pub fn next_timer(&self) -> Option<Millis> {
        self.flows
            .values()
            .flat_map(|flow| {
                let classify = match flow.phase {
                    FlowPhase::Classifying { deadline, .. } => Some(deadline),
                    FlowPhase::Accepted => None,
                };
                [flow.conn.next_deadline(), classify]
            })
            .flatten()
            .min()
    }

    fn emit_tcp_segment(&mut self, out: &mut Vec<Action>, key: FlowKey, segment: SegmentOut) {
        // Link backpressure: quench the guest with a zero window.
        let window = if self.link_blocked { 0 } else { segment.window };
        let tcp = TcpSegmentBuilder {
            src: key.remote_ip,
            dst: self.cfg.guest_ip,
            src_port: key.remote_port,
            dst_port: key.guest_port,
            seq: segment.seq,
            ack: segment.ack,
            flags: segment.flags,
            window,
            mss: segment.mss,
            payload: &segment.payload,
        };
        let Ok(tcp) = tcp.build_vec() else {
            return;
        };
        self.emit_ipv4(out, key.remote_ip, self.cfg.guest_ip, IPPROTO_TCP, &tcp);
    }

    fn emit_ipv4(
        &mut self,
        out: &mut Vec<Action>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
    ) {
        let Some(guest_mac) = self.guest_mac else {
            return;
        };
        self.emit_ipv4_to_mac(out, guest_mac, src, dst, protocol, payload);
    }

    fn emit_ipv4_to_mac(
        &mut self,
        out: &mut Vec<Action>,
        dest_mac: MacAddr,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
    ) {
        let ident = self.next_ipv4_ident();
        let Ok(ip) = (Ipv4PacketBuilder {
            src,
            dst,
            protocol,
            ident,
            ttl: EGRESS_TTL,
            payload,
        })
        .build_vec() else {
            return;
        };
        let Ok(frame) = (EthernetFrameBuilder {
            dest_mac,
            src_mac: self.cfg.our_mac,
            ethertype: ETHERTYPE_IPV4,
            payload: &ip,
        })
        .build_vec() else {
            return;
        };
        self.emit_frame(out, frame);
    }

    fn emit_frame(&mut self, out: &mut Vec<Action>, frame: Vec<u8>) {
        self.counters.frames_out += 1;
        out.push(Action::EmitFrame(frame));
    }

    fn next_ipv4_ident(&mut self) -> u16 {
        let ident = self.ipv4_ident;
        self.ipv4_ident = self.ipv4_ident.wrapping_add(1);
        ident
    }
}
