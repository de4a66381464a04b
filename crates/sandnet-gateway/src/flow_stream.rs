//! Byte-stream adapter between the session loop and a mediator task.
//!
//! The session owns the TCP engine; mediators just see an ordered duplex
//! byte stream. [`GuestStream`] implements `AsyncRead`/`AsyncWrite` over a
//! channel pair so the plain-HTTP mediator and the TLS acceptor can treat a
//! mediated flow like any socket.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_channel::mpsc;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Most bytes a single write passes to the session at once.
const WRITE_CHUNK: usize = 16 * 1024;

/// Guest-to-mediator events.
#[derive(Debug)]
pub enum GuestEvent {
    Data(Vec<u8>),
    Eof,
}

/// Mediator-to-session commands.
#[derive(Debug)]
pub enum FlowCmd {
    /// Response bytes for the guest.
    Data { flow_id: u32, data: Vec<u8> },
    /// Half-close toward the guest (FIN after queued data).
    Shutdown { flow_id: u32 },
    /// Abort the guest side (RST).
    Reset { flow_id: u32 },
    /// The mediator finished; the session can drop the flow handle.
    Done { flow_id: u32 },
}

pub struct GuestStream {
    flow_id: u32,
    rx: mpsc::UnboundedReceiver<GuestEvent>,
    tx: mpsc::Sender<FlowCmd>,
    readbuf: Vec<u8>,
    readpos: usize,
    eof: bool,
    shutdown_sent: bool,
}

impl GuestStream {
    pub fn new(
        flow_id: u32,
        rx: mpsc::UnboundedReceiver<GuestEvent>,
        tx: mpsc::Sender<FlowCmd>,
    ) -> Self {
        Self {
            flow_id,
            rx,
            tx,
            readbuf: Vec::new(),
            readpos: 0,
            eof: false,
            shutdown_sent: false,
        }
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    fn serve_from_buf(&mut self, out: &mut ReadBuf<'_>) -> bool {
        if self.readpos >= self.readbuf.len() {
            return false;
        }
        let n = (self.readbuf.len() - self.readpos).min(out.remaining());
        out.put_slice(&self.readbuf[self.readpos..self.readpos + n]);
        self.readpos += n;
        if self.readpos >= self.readbuf.len() {
            self.readbuf.clear();
            self.readpos = 0;
        }
        true
    }
}

impl AsyncRead for GuestStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.serve_from_buf(buf) {
            return Poll::Ready(Ok(()));
        }
        if this.eof {
            return Poll::Ready(Ok(()));
        }

        match ready!(Pin::new(&mut this.rx).poll_next(cx)) {
            Some(GuestEvent::Data(data)) => {
                this.readbuf = data;
                this.readpos = 0;
                this.serve_from_buf(buf);
                Poll::Ready(Ok(()))
            }
            Some(GuestEvent::Eof) | None => {
                this.eof = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

fn closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "flow closed")
}

impl AsyncWrite for GuestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.shutdown_sent {
            return Poll::Ready(Err(closed()));
        }
        ready!(Pin::new(&mut this.tx).poll_ready(cx)).map_err(|_| closed())?;
        let n = buf.len().min(WRITE_CHUNK);
        Pin::new(&mut this.tx)
            .start_send(FlowCmd::Data {
                flow_id: this.flow_id,
                data: buf[..n].to_vec(),
            })
            .map_err(|_| closed())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.tx)
            .poll_flush(cx)
            .map_err(|_| closed())
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.shutdown_sent {
            ready!(Pin::new(&mut this.tx).poll_ready(cx)).map_err(|_| closed())?;
            Pin::new(&mut this.tx)
                .start_send(FlowCmd::Shutdown {
                    flow_id: this.flow_id,
                })
                .map_err(|_| closed())?;
            this.shutdown_sent = true;
        }
        Pin::new(&mut this.tx)
            .poll_flush(cx)
            .map_err(|_| closed())
    }
}
