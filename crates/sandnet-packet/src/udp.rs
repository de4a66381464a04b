use core::net::Ipv4Addr;

use crate::checksum;
use crate::ipv4::IPPROTO_UDP;
use crate::{ensure_len, ensure_out_buf_len, PacketError};

/// A UDP datagram. The checksum is verified against the pseudo header when
/// present (an all-zero checksum means "not computed" in IPv4 UDP).
#[derive(Clone, Copy, Debug)]
pub struct UdpPacket<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpPacket<'a> {
    pub const HEADER_LEN: usize = 8;

    pub fn parse(data: &'a [u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if length < Self::HEADER_LEN || length > data.len() {
            return Err(PacketError::Malformed("UDP length out of range"));
        }
        let wire_csum = u16::from_be_bytes([data[6], data[7]]);
        if wire_csum != 0 {
            let acc = checksum::pseudo_header_sum(src, dst, IPPROTO_UDP, length as u16);
            if checksum::finalize(checksum::sum_words(acc, &data[..length])) != 0 {
                return Err(PacketError::Malformed("UDP checksum mismatch"));
            }
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            payload: &data[Self::HEADER_LEN..length],
        })
    }
}

pub struct UdpPacketBuilder<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpPacketBuilder<'a> {
    pub fn len(&self) -> usize {
        UdpPacket::HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let total_len = self.len();
        if total_len > u16::MAX as usize {
            return Err(PacketError::Malformed("UDP payload too large"));
        }
        ensure_out_buf_len(out, total_len)?;
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(total_len as u16).to_be_bytes());
        out[6..8].fill(0);
        out[UdpPacket::HEADER_LEN..total_len].copy_from_slice(self.payload);

        let mut csum =
            checksum::transport_checksum(self.src, self.dst, IPPROTO_UDP, &out[..total_len]);
        // 0x0000 is reserved for "no checksum"; RFC 768 maps it to 0xffff.
        if csum == 0 {
            csum = 0xffff;
        }
        out[6..8].copy_from_slice(&csum.to_be_bytes());
        Ok(total_len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()];
        let len = self.write(&mut buf)?;
        debug_assert_eq!(len, buf.len());
        Ok(buf)
    }
}
