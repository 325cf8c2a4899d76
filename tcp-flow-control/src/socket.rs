//! Framed TCP stream halves.
//!
//! [`FrameReader`] and [`FrameWriter`] wrap the two owned halves of a
//! `tokio::net::TcpStream` and speak [`Frame`]s instead of raw bytes.  Each
//! half owns its own [`Codec`] so the read and write sides can live in
//! different tasks.  All flow-control logic lives elsewhere; this module owns
//! only byte I/O.

use std::collections::VecDeque;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::codec::{Codec, CodecError, Frame, FramingMode};
use crate::control::ControlMessage;

/// Errors that can arise from stream operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Connection refused, reset, broken pipe, ...
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The inbound stream can no longer be decoded.
    #[error("stream decode error: {0}")]
    Codec(#[from] CodecError),
}

/// Split a connected stream into framed halves.
pub fn split(stream: TcpStream, mode: FramingMode, read_size: usize) -> (FrameReader, FrameWriter) {
    // Small control frames should not wait behind Nagle.
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed: {e}");
    }
    let (rd, wr) = stream.into_split();
    (
        FrameReader {
            inner: rd,
            codec: Codec::new(mode),
            pending: VecDeque::new(),
            scratch: vec![0u8; read_size.max(1)],
            eof: false,
        },
        FrameWriter {
            inner: wr,
            codec: Codec::new(mode),
            out: Vec::new(),
        },
    )
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Read half: decodes frames in stream order.
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
    codec: Codec,
    pending: VecDeque<Frame>,
    scratch: Vec<u8>,
    eof: bool,
}

impl FrameReader {
    /// Return the next frame, or `None` once the peer has closed and every
    /// buffered frame has been handed out.
    ///
    /// Cancel-safe: the only await point is a single socket read, and decoded
    /// frames are buffered inside the reader.  This lets callers wrap it in
    /// `tokio::time::timeout` without losing data.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SocketError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                self.eof = true;
                self.codec.finish(&mut self.pending);
            } else {
                self.codec.decode(&self.scratch[..n], &mut self.pending)?;
            }
        }
    }

    /// Control frames discarded as unparseable on this stream.
    pub fn malformed(&self) -> u64 {
        self.codec.malformed()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.peer_addr()?)
    }
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

/// Write half: encodes and sends whole frames.
#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    codec: Codec,
    out: Vec<u8>,
}

impl FrameWriter {
    pub async fn send_data(&mut self, payload: &[u8]) -> Result<(), SocketError> {
        self.out.clear();
        self.codec.encode_data(payload, &mut self.out);
        self.inner.write_all(&self.out).await?;
        Ok(())
    }

    pub async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), SocketError> {
        self.out.clear();
        self.codec.encode_control(msg, &mut self.out)?;
        self.inner.write_all(&self.out).await?;
        Ok(())
    }

    /// Half-close the stream; the peer's next read returns end of stream.
    pub async fn shutdown(&mut self) -> Result<(), SocketError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
