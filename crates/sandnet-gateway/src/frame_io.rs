//! Length-delimited Ethernet frame transport.
//!
//! QEMU's stream netdev carries one frame per message: a 32-bit big-endian
//! length followed by the raw Ethernet bytes. Both halves enforce the link
//! MTU so a corrupt length cannot make us allocate unbounded buffers.

use sandnet_packet::ethernet::MAX_FRAME_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::LinkError;

const MIN_FRAME_LEN: usize = 14;

pub struct FrameReader<R> {
    inner: R,
}

pub struct FrameWriter<W> {
    inner: W,
}

/// Split a connected frame socket into its two directions.
pub fn frame_pair<S>(socket: S) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(socket);
    (FrameReader { inner: r }, FrameWriter { inner: w })
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read one whole frame. `LinkError::Closed` on clean EOF at a message
    /// boundary.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(LinkError::Closed);
            }
            Err(err) => return Err(LinkError::Io(err)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len < MIN_FRAME_LEN || len > MAX_FRAME_LEN {
            return Err(LinkError::Oversized(len));
        }
        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() < MIN_FRAME_LEN || frame.len() > MAX_FRAME_LEN {
            return Err(LinkError::Oversized(frame.len()));
        }
        self.inner
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
