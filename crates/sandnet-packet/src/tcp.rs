use core::net::Ipv4Addr;

use crate::checksum;
use crate::ipv4::IPPROTO_TCP;
use crate::{ensure_len, ensure_out_buf_len, PacketError};

/// TCP header flag bits (low byte of the flags field).
pub struct TcpFlags;

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;

/// A TCP segment. The checksum is verified against the pseudo header during
/// `parse`; options other than MSS are skipped.
#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// MSS advertised in a SYN, when present.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &'a [u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = usize::from(data[12] >> 4) * 4;
        if data_offset < Self::MIN_HEADER_LEN {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        ensure_len(data, data_offset)?;

        if checksum::transport_checksum(src, dst, IPPROTO_TCP, data) != 0 {
            return Err(PacketError::Malformed("TCP checksum mismatch"));
        }

        let mut mss = None;
        let mut off = Self::MIN_HEADER_LEN;
        while off < data_offset {
            match data[off] {
                OPT_END => break,
                OPT_NOP => off += 1,
                kind => {
                    if off + 1 >= data_offset {
                        return Err(PacketError::Malformed("TCP option truncated"));
                    }
                    let opt_len = usize::from(data[off + 1]);
                    if opt_len < 2 || off + opt_len > data_offset {
                        return Err(PacketError::Malformed("TCP option length invalid"));
                    }
                    if kind == OPT_MSS && opt_len == 4 {
                        mss = Some(u16::from_be_bytes([data[off + 2], data[off + 3]]));
                    }
                    off += opt_len;
                }
            }
        }

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            mss,
            payload: &data[data_offset..],
        })
    }
}

/// Serialize a TCP segment, computing the checksum over the pseudo header.
pub struct TcpSegmentBuilder<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Emit an MSS option (SYN/SYN-ACK only).
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    fn header_len(&self) -> usize {
        // The 4-byte MSS option keeps the header word-aligned by itself.
        TcpSegment::MIN_HEADER_LEN + if self.mss.is_some() { 4 } else { 0 }
    }

    pub fn len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let header_len = self.header_len();
        let total_len = self.len();
        if total_len > u16::MAX as usize {
            return Err(PacketError::Malformed("TCP payload too large"));
        }
        ensure_out_buf_len(out, total_len)?;

        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = self.flags;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..20].fill(0); // checksum + urgent pointer

        if let Some(mss) = self.mss {
            out[20] = OPT_MSS;
            out[21] = 4;
            out[22..24].copy_from_slice(&mss.to_be_bytes());
        }

        out[header_len..total_len].copy_from_slice(self.payload);

        let csum =
            checksum::transport_checksum(self.src, self.dst, IPPROTO_TCP, &out[..total_len]);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(total_len)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()];
        let len = self.write(&mut buf)?;
        debug_assert_eq!(len, buf.len());
        Ok(buf)
    }
}
