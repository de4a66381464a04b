//! Buffered reading of HTTP/1.x message bodies from a guest stream.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::head::{head_len, BodyMode};

/// Reader with a carry-over buffer for bytes past the current parse point
/// (pipelined requests, body bytes read together with the head).
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
}

/// Cap on a request head; beyond this the request is malformed.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Pre-seed with bytes that arrived before the reader existed (the
    /// classifier's buffered prefix travels out-of-band).
    pub fn unread(&mut self, data: &[u8]) {
        let mut merged = data.to_vec();
        merged.extend_from_slice(&self.buf);
        self.buf = merged;
    }

    /// Read up to the head/body split. `Ok(None)` on clean EOF before any
    /// bytes of a new message.
    pub async fn read_head(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(len) = head_len(&self.buf) {
                let rest = self.buf.split_off(len);
                let head = std::mem::replace(&mut self.buf, rest);
                return Ok(Some(head));
            }
            if self.buf.len() > MAX_HEAD_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF inside request head",
                ));
            }
        }
    }

    /// Read a whole body per `mode`, capped at `limit` bytes.
    pub async fn read_body(
        &mut self,
        mode: BodyMode,
        limit: usize,
    ) -> std::io::Result<Option<Vec<u8>>> {
        match mode {
            BodyMode::None => Ok(Some(Vec::new())),
            BodyMode::Length(len) => {
                if len as usize > limit {
                    return Ok(None);
                }
                self.read_exactly(len as usize).await.map(Some)
            }
            BodyMode::Chunked => self.read_chunked(limit).await,
        }
    }

    async fn read_exactly(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF inside message body",
                ));
            }
        }
        let rest = self.buf.split_off(len);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    /// Decode a chunked body to its plain bytes. Trailers are consumed and
    /// dropped. `Ok(None)` when the decoded size exceeds `limit`.
    async fn read_chunked(&mut self, limit: usize) -> std::io::Result<Option<Vec<u8>>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            let size_str = line
                .split(';')
                .next()
                .unwrap_or("")
                .trim();
            let size = usize::from_str_radix(size_str, 16).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size")
            })?;

            if size == 0 {
                // Trailer section: zero or more header lines, then CRLF.
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        return Ok(Some(body));
                    }
                }
            }

            if body.len() + size > limit {
                return Ok(None);
            }
            let chunk = self.read_exactly(size).await?;
            body.extend_from_slice(&chunk);

            let crlf = self.read_exactly(2).await?;
            if crlf != b"\r\n" {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "chunk not CRLF-terminated",
                ));
            }
        }
    }

    async fn read_line(&mut self) -> std::io::Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let rest = self.buf.split_off(pos + 2);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.truncate(pos);
                return String::from_utf8(line).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 chunk line")
                });
            }
            if self.buf.len() > MAX_HEAD_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "chunk line too long",
                ));
            }
            if self.fill().await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF inside chunked body",
                ));
            }
        }
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.inner.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// Serialize one chunk in chunked transfer encoding.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// The terminating zero chunk.
pub fn final_chunk() -> &'static [u8] {
    b"0\r\n\r\n"
}
