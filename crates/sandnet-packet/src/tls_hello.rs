//! SNI extraction from an unconsumed TLS ClientHello.
//!
//! The flow classifier buffers the first client bytes of a TCP stream; this
//! parser observes those bytes without consuming them, so the exact same
//! octets can later be replayed into the real TLS acceptor. Handshake
//! fragmentation across multiple records is handled; anything else about the
//! hello is ignored.

use crate::{ensure_len, PacketError};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOST_NAME: u8 = 0x00;

/// Maximum bytes of handshake data we will assemble while looking for the
/// ClientHello. Real hellos are well under this.
pub const MAX_CLIENT_HELLO_LEN: usize = 16 * 1024;

/// True when the buffer starts like a TLS handshake record: content type
/// 0x16 and a protocol version of at least TLS 1.0 (3,1).
///
/// Needs 3 bytes; returns `None` until they are available.
pub fn looks_like_tls(buf: &[u8]) -> Option<bool> {
    if buf.len() < 3 {
        return None;
    }
    Some(buf[0] == CONTENT_TYPE_HANDSHAKE && buf[1] == 0x03 && (0x01..=0x04).contains(&buf[2]))
}

/// Extract the SNI host name from the ClientHello at the start of `buf`.
///
/// Returns `Ok(Some(name))` when an SNI host_name entry is present,
/// `Ok(None)` when the hello is complete but carries no SNI, and
/// `Err(Truncated)` when more bytes are required. Any structural problem is
/// `Err(Malformed)`.
pub fn parse_client_hello_sni(buf: &[u8]) -> Result<Option<String>, PacketError> {
    let hello = assemble_handshake(buf)?;
    parse_hello_body(&hello)
}

/// Concatenate handshake-record fragments until one whole ClientHello
/// message is available.
fn assemble_handshake(buf: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut handshake: Vec<u8> = Vec::new();
    let mut off = 0usize;

    loop {
        // Do we already hold a full ClientHello header + body?
        if handshake.len() >= 4 {
            if handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
                return Err(PacketError::Malformed("first handshake message is not a ClientHello"));
            }
            let body_len =
                usize::from(handshake[1]) << 16 | usize::from(handshake[2]) << 8 | usize::from(handshake[3]);
            if body_len > MAX_CLIENT_HELLO_LEN {
                return Err(PacketError::Malformed("ClientHello too large"));
            }
            if handshake.len() >= 4 + body_len {
                handshake.truncate(4 + body_len);
                return Ok(handshake);
            }
        }

        ensure_len(buf, off + 5)?;
        if buf[off] != CONTENT_TYPE_HANDSHAKE {
            return Err(PacketError::Malformed("non-handshake record before ClientHello"));
        }
        let record_len = usize::from(u16::from_be_bytes([buf[off + 3], buf[off + 4]]));
        if record_len == 0 || record_len > 1 << 14 {
            return Err(PacketError::Malformed("TLS record length invalid"));
        }
        ensure_len(buf, off + 5 + record_len)?;
        handshake.extend_from_slice(&buf[off + 5..off + 5 + record_len]);
        off += 5 + record_len;

        if handshake.len() > MAX_CLIENT_HELLO_LEN {
            return Err(PacketError::Malformed("ClientHello too large"));
        }
    }
}

fn parse_hello_body(hello: &[u8]) -> Result<Option<String>, PacketError> {
    // Skip: msg header 4, version 2, random 32.
    let mut off = 4 + 2 + 32;
    ensure_len(hello, off + 1)?;

    // session_id
    let session_len = usize::from(hello[off]);
    off += 1 + session_len;
    ensure_len(hello, off + 2)?;

    // cipher_suites
    let ciphers_len = usize::from(u16::from_be_bytes([hello[off], hello[off + 1]]));
    off += 2 + ciphers_len;
    ensure_len(hello, off + 1)?;

    // compression_methods
    let compression_len = usize::from(hello[off]);
    off += 1 + compression_len;

    // A hello without extensions has no SNI.
    if off == hello.len() {
        return Ok(None);
    }
    ensure_len(hello, off + 2)?;
    let extensions_len = usize::from(u16::from_be_bytes([hello[off], hello[off + 1]]));
    off += 2;
    ensure_len(hello, off + extensions_len)?;
    let extensions_end = off + extensions_len;

    while off + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([hello[off], hello[off + 1]]);
        let ext_len = usize::from(u16::from_be_bytes([hello[off + 2], hello[off + 3]]));
        off += 4;
        if off + ext_len > extensions_end {
            return Err(PacketError::Malformed("TLS extension overruns extensions block"));
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_list(&hello[off..off + ext_len]);
        }
        off += ext_len;
    }

    Ok(None)
}

fn parse_server_name_list(ext: &[u8]) -> Result<Option<String>, PacketError> {
    ensure_len(ext, 2)?;
    let list_len = usize::from(u16::from_be_bytes([ext[0], ext[1]]));
    ensure_len(ext, 2 + list_len)?;

    let mut off = 2;
    while off + 3 <= 2 + list_len {
        let name_type = ext[off];
        let name_len = usize::from(u16::from_be_bytes([ext[off + 1], ext[off + 2]]));
        off += 3;
        ensure_len(ext, off + name_len)?;
        if name_type == SNI_TYPE_HOST_NAME {
            let name = core::str::from_utf8(&ext[off..off + name_len])
                .map_err(|_| PacketError::Malformed("SNI host name is not UTF-8"))?;
            if name.is_empty() {
                return Err(PacketError::Malformed("SNI host name empty"));
            }
            return Ok(Some(name.to_ascii_lowercase()));
        }
        off += name_len;
    }
    Ok(None)
}
