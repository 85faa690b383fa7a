//! Length-prefixed message framing
//!
//! Each frame is a 12-byte, right-aligned decimal length header followed by
//! exactly that many payload bytes. Raft messages travel as JSON payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the decimal length header
pub const HEADER_LEN: usize = 12;

/// Default ceiling on a single payload (16 MiB)
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Stream ended inside a frame
    #[error("connection closed mid-frame")]
    Incomplete,
    #[error("invalid length header {0:?}")]
    BadHeader(String),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A framed, bidirectional byte-message channel over a stream
pub struct Channel<S> {
    stream: S,
    max_frame: usize,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_frame(stream, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(stream: S, max_frame: usize) -> Self {
        Self { stream, max_frame }
    }

    /// Write one frame
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.max_frame {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame,
            });
        }
        let header = format!("{:>width$}", payload.len(), width = HEADER_LEN);
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one frame. Returns None on a clean end of stream between frames.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.stream.read(&mut header[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(FrameError::Incomplete)
                };
            }
            filled += n;
        }

        let text = String::from_utf8_lossy(&header);
        let len: usize = text
            .trim()
            .parse()
            .map_err(|_| FrameError::BadHeader(text.to_string()))?;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame,
            });
        }

        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::Incomplete,
                _ => FrameError::Io(e),
            })?;
        Ok(Some(payload))
    }

    /// Serialize `value` as JSON and send it as one frame
    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(value)?;
        self.send(&payload).await
    }

    /// Receive one frame and decode it from JSON
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match self.recv().await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}
