//! First-bytes protocol classification for accepted TCP flows.
//!
//! Every flow starts `Unknown`; once enough client bytes arrive the verdict
//! is final. Only HTTP/1.x plaintext and TLS are admitted — anything else,
//! including CONNECT, is rejected and the flow reset.

use sandnet_packet::tls_hello;

/// Bytes the classifier will examine before giving up.
pub const MAX_CLASSIFY_BYTES: usize = 2048;
/// Idle time before an unclassified flow is rejected.
pub const CLASSIFY_TIMEOUT_MS: u64 = 5000;

/// HTTP/1.x method tokens admitted on plaintext flows. CONNECT is absent on
/// purpose: tunnel requests are rejected outright.
const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep buffering; the prefix is still consistent with an admissible
    /// protocol.
    NeedMore,
    Http,
    Tls,
    Reject,
}

/// Classify the buffered client prefix of a flow.
pub fn classify(buf: &[u8]) -> Verdict {
    if buf.is_empty() {
        return Verdict::NeedMore;
    }

    match tls_hello::looks_like_tls(buf) {
        Some(true) => return Verdict::Tls,
        None => {
            // Fewer than 3 bytes. 0x16 keeps the TLS door open; anything
            // else falls through to the HTTP matcher.
            if buf[0] == 0x16 {
                return Verdict::NeedMore;
            }
        }
        Some(false) => {}
    }

    classify_http(buf)
}

/// Match `METHOD SP (*|/|absolute-URI) SP HTTP/1.` incrementally.
fn classify_http(buf: &[u8]) -> Verdict {
    if buf.starts_with(b"CONNECT ") || b"CONNECT ".starts_with(buf) {
        // A complete or still-possible CONNECT prefix. Only a confirmed
        // CONNECT is rejected; a shorter prefix may still become CONNECT.
        return if buf.len() >= b"CONNECT ".len() {
            Verdict::Reject
        } else {
            Verdict::NeedMore
        };
    }

    let method = match HTTP_METHODS.iter().find(|m| {
        let m = m.as_bytes();
        buf.starts_with(m) || m.starts_with(buf)
    }) {
        Some(m) => m.as_bytes(),
        None => return Verdict::Reject,
    };
    if buf.len() <= method.len() {
        return Verdict::NeedMore;
    }
    if buf[method.len()] != b' ' {
        return Verdict::Reject;
    }

    let rest = &buf[method.len() + 1..];
    let Some(&first) = rest.first() else {
        return Verdict::NeedMore;
    };
    // Origin form, asterisk form, or absolute URI (scheme starts with an
    // ASCII letter).
    if first != b'*' && first != b'/' && !first.is_ascii_alphabetic() {
        return Verdict::Reject;
    }

    // The request target must be followed by " HTTP/1." on the same line.
    match rest.iter().position(|&b| b == b' ') {
        Some(sp) => {
            let version = &rest[sp + 1..];
            let want = b"HTTP/1.";
            let check_len = version.len().min(want.len());
            if version[..check_len] != want[..check_len] {
                return Verdict::Reject;
            }
            if version.len() >= want.len() {
                Verdict::Http
            } else {
                Verdict::NeedMore
            }
        }
        None => {
            if rest.iter().any(|&b| b == b'\r' || b == b'\n') {
                return Verdict::Reject;
            }
            Verdict::NeedMore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_lines_classify_as_http() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), Verdict::Http);
        assert_eq!(classify(b"POST /submit HTTP/1.0\r\n"), Verdict::Http);
        assert_eq!(
            classify(b"GET http://example.com/ HTTP/1.1\r\n"),
            Verdict::Http
        );
        assert_eq!(classify(b"OPTIONS * HTTP/1.1\r\n"), Verdict::Http);
    }

    #[test]
    fn connect_is_rejected() {
        assert_eq!(classify(b"CONNECT proxy.example.com:443 HTTP/1.1\r\n"), Verdict::Reject);
        assert_eq!(classify(b"CONNECT "), Verdict::Reject);
        // A shorter prefix could still become CONNECT.
        assert_eq!(classify(b"CONN"), Verdict::NeedMore);
    }

    #[test]
    fn tls_client_hello_classifies_as_tls() {
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x00, 0x50]), Verdict::Tls);
        assert_eq!(classify(&[0x16]), Verdict::NeedMore);
        assert_eq!(classify(&[0x16, 0x03]), Verdict::NeedMore);
        // SSLv2-style or garbage record versions are not admitted.
        assert_eq!(classify(&[0x16, 0x02, 0x00]), Verdict::Reject);
    }

    #[test]
    fn partial_http_prefixes_need_more() {
        assert_eq!(classify(b"G"), Verdict::NeedMore);
        assert_eq!(classify(b"GET"), Verdict::NeedMore);
        assert_eq!(classify(b"GET "), Verdict::NeedMore);
        assert_eq!(classify(b"GET /index.html"), Verdict::NeedMore);
        assert_eq!(classify(b"GET /index.html HTTP/"), Verdict::NeedMore);
    }

    #[test]
    fn non_http_bytes_are_rejected() {
        assert_eq!(classify(b"SSH-2.0-OpenSSH_9.5\r\n"), Verdict::Reject);
        assert_eq!(classify(&[0x00, 0x01, 0x02]), Verdict::Reject);
        assert_eq!(classify(b"GET\t/ HTTP/1.1"), Verdict::Reject);
        assert_eq!(classify(b"GET /index\r\nHTTP/1.1"), Verdict::Reject);
        // Looks like a method but the version is wrong.
        assert_eq!(classify(b"GET / HTTP/2\r\n"), Verdict::Reject);
    }
}
