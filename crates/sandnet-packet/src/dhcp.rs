//! DHCP (BOOTP) subset: parse client DISCOVER/REQUEST, build OFFER/ACK.
//!
//! DHCP technically lives above UDP, but the stack serves a single fixed
//! lease and only needs this handful of messages.

use core::net::Ipv4Addr;

use crate::{ensure_len, ensure_out_buf_len, MacAddr, PacketError};

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

pub const DHCP_OPT_SUBNET_MASK: u8 = 1;
pub const DHCP_OPT_ROUTER: u8 = 3;
pub const DHCP_OPT_DNS: u8 = 6;
pub const DHCP_OPT_INTERFACE_MTU: u8 = 26;
pub const DHCP_OPT_REQUESTED_IP: u8 = 50;
pub const DHCP_OPT_IP_LEASE_TIME: u8 = 51;
pub const DHCP_OPT_MESSAGE_TYPE: u8 = 53;
pub const DHCP_OPT_SERVER_IDENTIFIER: u8 = 54;
pub const DHCP_OPT_END: u8 = 255;
const DHCP_OPT_PAD: u8 = 0;

const BOOTP_FIXED_LEN: usize = 236;
const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Ack,
    Other(u8),
}

impl DhcpMessageType {
    pub fn from_wire(v: u8) -> Self {
        match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            5 => Self::Ack,
            other => Self::Other(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Ack => 5,
            Self::Other(v) => v,
        }
    }
}

/// A parsed client DHCP message (BOOTREQUEST only).
#[derive(Clone, Copy, Debug)]
pub struct DhcpRequest {
    pub message_type: DhcpMessageType,
    pub transaction_id: u32,
    pub flags: u16,
    pub client_mac: MacAddr,
    pub requested_ip: Option<Ipv4Addr>,
}

impl DhcpRequest {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, BOOTP_FIXED_LEN + 4)?;
        if data[0] != OP_BOOTREQUEST {
            return Err(PacketError::Unsupported("not a BOOTREQUEST"));
        }
        if data[1] != 1 || data[2] != 6 {
            return Err(PacketError::Unsupported("non-Ethernet DHCP"));
        }
        if data[BOOTP_FIXED_LEN..BOOTP_FIXED_LEN + 4] != DHCP_MAGIC_COOKIE {
            return Err(PacketError::Malformed("DHCP magic cookie missing"));
        }

        let mut client_mac = [0u8; 6];
        client_mac.copy_from_slice(&data[28..34]);

        let mut message_type = None;
        let mut requested_ip = None;
        let mut off = BOOTP_FIXED_LEN + 4;
        while off < data.len() {
            match data[off] {
                DHCP_OPT_PAD => off += 1,
                DHCP_OPT_END => break,
                opt => {
                    if off + 1 >= data.len() {
                        return Err(PacketError::Malformed("DHCP option truncated"));
                    }
                    let len = usize::from(data[off + 1]);
                    let value_start = off + 2;
                    ensure_len(data, value_start + len)?;
                    let value = &data[value_start..value_start + len];
                    match opt {
                        DHCP_OPT_MESSAGE_TYPE if len == 1 => {
                            message_type = Some(DhcpMessageType::from_wire(value[0]));
                        }
                        DHCP_OPT_REQUESTED_IP if len == 4 => {
                            requested_ip =
                                Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
                        }
                        _ => {}
                    }
                    off = value_start + len;
                }
            }
        }

        let message_type =
            message_type.ok_or(PacketError::Malformed("DHCP message type missing"))?;

        Ok(Self {
            message_type,
            transaction_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            client_mac: MacAddr(client_mac),
            requested_ip,
        })
    }
}

/// Build an OFFER or ACK for the single-lease server.
pub struct DhcpReplyBuilder {
    pub message_type: DhcpMessageType,
    pub transaction_id: u32,
    pub client_mac: MacAddr,
    pub your_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    pub lease_time_secs: u32,
    pub mtu: u16,
}

impl DhcpReplyBuilder {
    pub fn len(&self) -> usize {
        // cookie + msg type + server id + mask + router + dns + lease + mtu + end
        BOOTP_FIXED_LEN + 4 + 3 + 6 + 6 + 6 + 6 + 6 + 4 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let total_len = self.len();
        ensure_out_buf_len(out, total_len)?;

        out[..BOOTP_FIXED_LEN].fill(0);
        out[0] = OP_BOOTREPLY;
        out[1] = 1; // htype ethernet
        out[2] = 6; // hlen
        out[4..8].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[10..12].copy_from_slice(&0x8000u16.to_be_bytes()); // broadcast flag
        out[16..20].copy_from_slice(&self.your_ip.octets()); // yiaddr
        out[20..24].copy_from_slice(&self.server_ip.octets()); // siaddr
        out[28..34].copy_from_slice(&self.client_mac.0);

        let mut off = BOOTP_FIXED_LEN;
        out[off..off + 4].copy_from_slice(&DHCP_MAGIC_COOKIE);
        off += 4;

        out[off] = DHCP_OPT_MESSAGE_TYPE;
        out[off + 1] = 1;
        out[off + 2] = self.message_type.to_wire();
        off += 3;

        for (opt, ip) in [
            (DHCP_OPT_SERVER_IDENTIFIER, self.server_ip),
            (DHCP_OPT_SUBNET_MASK, self.subnet_mask),
            (DHCP_OPT_ROUTER, self.router),
            (DHCP_OPT_DNS, self.dns_server),
        ] {
            out[off] = opt;
            out[off + 1] = 4;
            out[off + 2..off + 6].copy_from_slice(&ip.octets());
            off += 6;
        }

        out[off] = DHCP_OPT_IP_LEASE_TIME;
        out[off + 1] = 4;
        out[off + 2..off + 6].copy_from_slice(&self.lease_time_secs.to_be_bytes());
        off += 6;

        out[off] = DHCP_OPT_INTERFACE_MTU;
        out[off + 1] = 2;
        out[off + 2..off + 4].copy_from_slice(&self.mtu.to_be_bytes());
        off += 4;

        out[off] = DHCP_OPT_END;
        off += 1;

        debug_assert_eq!(off, total_len);
        Ok(total_len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()];
        let len = self.write(&mut buf)?;
        debug_assert_eq!(len, buf.len());
        Ok(buf)
    }
}
