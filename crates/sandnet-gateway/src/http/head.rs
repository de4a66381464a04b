//! HTTP/1.x heads: an ordered case-insensitive header multimap plus request
//! and response head types.

use std::fmt::Write as _;

/// Header collection preserving wire order and the first-seen spelling of
/// each name; lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every occurrence of `name` with a single entry, keeping the
    /// position of the first occurrence; appends if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut kept = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if kept {
                    return false;
                }
                kept = true;
                *v = value.clone();
            }
            true
        });
        if !kept {
            self.append(name.to_string(), value);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn iter_mut_values(&mut self) -> impl Iterator<Item = &mut String> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub minor_version: u8,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn body_mode(&self) -> Result<BodyMode, &'static str> {
        body_mode_from_headers(&self.headers)
    }

    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.headers.get("connection").unwrap_or("");
        if self.minor_version == 0 {
            connection.eq_ignore_ascii_case("keep-alive")
        } else {
            !connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("close"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Serialize as an HTTP/1.1 status line plus headers.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn body_mode_from_headers(headers: &HeaderMap) -> Result<BodyMode, &'static str> {
    let chunked = headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    if let Some(len) = headers.get("content-length") {
        let len: u64 = len
            .trim()
            .parse()
            .map_err(|_| "invalid Content-Length")?;
        return Ok(BodyMode::Length(len));
    }
    // A request without body framing has no body.
    Ok(BodyMode::None)
}

/// Parse a complete request head (through the blank line) from `buf`.
pub fn parse_request_head(buf: &[u8]) -> Result<RequestHead, &'static str> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err("incomplete request head"),
        Err(_) => return Err("malformed request head"),
    }

    let mut map = HeaderMap::new();
    for header in req.headers.iter() {
        let value =
            std::str::from_utf8(header.value).map_err(|_| "non-UTF-8 header value")?;
        map.append(header.name.to_string(), value.trim().to_string());
    }

    Ok(RequestHead {
        method: req.method.ok_or("missing method")?.to_string(),
        target: req.path.ok_or("missing target")?.to_string(),
        minor_version: req.version.ok_or("missing version")? as u8,
        headers: map,
    })
}

/// Byte length of the head (through CRLFCRLF) if fully buffered.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
