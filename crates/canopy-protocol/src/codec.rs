//! Length-prefixed JSON framing shared by both stream transports.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────────┐
//! │ Length   │ Envelope     │
//! │ 4 bytes  │ N bytes      │
//! │ (u32 LE) │ (JSON)       │
//! └──────────┴──────────────┘
//! ```

use crate::envelope::Envelope;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LEN_PREFIX_SIZE: usize = 4;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("envelope encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encode an envelope into a complete frame, prefix included.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one framed envelope to an async stream.
pub async fn write_envelope<W>(stream: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed envelope from an async stream.
///
/// A clean EOF before the length prefix surfaces as `UnexpectedEof`.
pub async fn read_envelope<R>(stream: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    stream.read_exact(&mut prefix).await?;

    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Incremental decoder for readiness-based transports that read into a
/// buffer rather than awaiting exact lengths.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete envelope, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>> {
        if self.buf.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX_SIZE + len {
            return Ok(None);
        }

        let payload: Vec<u8> = self.buf.drain(..LEN_PREFIX_SIZE + len).skip(LEN_PREFIX_SIZE).collect();
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}
