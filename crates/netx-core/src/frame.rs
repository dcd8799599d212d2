//! Length-delimited framing for netx sessions.
//!
//! Wire format: `[4-byte big-endian length][1-byte signal kind][payload]`
//!
//! The length covers the payload only. One frame per call, no read-ahead.
//! Reader and writer enforce the same payload bound, so a frame this side
//! agrees to write is one a peer with the same limit agrees to read.

use crate::error::{NetxError, NetxResult};
use crate::signal::SignalKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame header (length + kind).
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a single payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A single frame as read off the wire.
///
/// The kind is kept as the raw tag so the dispatch loop can log and skip
/// unknown kinds without tearing the session down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: SignalKind, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// The parsed signal kind.
    pub fn signal(&self) -> NetxResult<SignalKind> {
        SignalKind::from_wire(self.kind)
    }
}

/// Encode a frame into a contiguous buffer.
pub fn encode_frame(kind: SignalKind, payload: &[u8]) -> NetxResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        NetxError::Protocol(format!("payload too large: {} bytes", payload.len()))
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(kind.into());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads frames from the inbound half of a transport.
pub struct FrameReader<R> {
    inner: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    /// Read exactly one frame. Fails on short read or a closed stream.
    pub async fn read(&mut self) -> NetxResult<Frame> {
        let mut header = [0u8; HEADER_LEN];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(|e| read_error("header", e))?;

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_frame_len {
            return Err(NetxError::Protocol(format!(
                "frame too large: {len} bytes (max {})",
                self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| read_error("payload", e))?;

        Ok(Frame {
            kind: header[4],
            payload,
        })
    }
}

/// Writes frames to the outbound half of a transport.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: W, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    /// Write one frame and flush it. An oversize payload is rejected
    /// before anything reaches the stream.
    pub async fn write(&mut self, kind: SignalKind, payload: &[u8]) -> NetxResult<()> {
        if payload.len() > self.max_frame_len {
            return Err(NetxError::Protocol(format!(
                "frame too large: {} bytes (max {})",
                payload.len(),
                self.max_frame_len
            )));
        }
        let frame = encode_frame(kind, payload)?;
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| NetxError::Transport(format!("write failed: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| NetxError::Transport(format!("flush failed: {e}")))
    }

    /// Shut down the outbound half.
    pub async fn shutdown(&mut self) -> NetxResult<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| NetxError::Transport(format!("shutdown failed: {e}")))
    }
}

fn read_error(part: &str, e: std::io::Error) -> NetxError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetxError::Transport(format!("stream closed while reading frame {part}"))
    } else {
        NetxError::Transport(format!("read failed: {e}"))
    }
}
