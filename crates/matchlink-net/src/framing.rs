//! Length-prefixed framing for the TCP transport.
//!
//! Every frame on the wire is a length-prefixed block:
//!
//! ```text
//! +-------------------+------------------------------------------+
//! | length (4 bytes)  |   [version: u8] [postcard RoutedFrame]   |
//! | u32 little-endian |   (length bytes)                         |
//! +-------------------+------------------------------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. The block carries a
//! [`RoutedFrame`]: the routing hints the gateway uses to pick a backend shard
//! plus the opaque envelope bytes produced by the message layer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::messages::{PROTOCOL_VERSION, RoutingConfig};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// A transport frame: routing hints plus the envelope bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutedFrame {
    /// Shard the body is addressed to; `None` lets the gateway decide.
    pub routing: Option<RoutingConfig>,
    /// Envelope bytes.
    pub body: Vec<u8>,
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual frame size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame version byte is not [`PROTOCOL_VERSION`].
    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    /// The frame was empty or its body could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(#[from] postcard::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RoutedFrame {
    /// Serialize into a versioned frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body = postcard::to_allocvec(self)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a versioned frame payload.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let Some((&version, body)) = data.split_first() else {
            return Err(FrameError::Malformed(postcard::Error::DeserializeUnexpectedEnd));
        };
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        Ok(postcard::from_bytes(body)?)
    }
}

/// Read a single length-prefixed frame from the stream.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: frame_len,
            max: config.max_payload_size,
        });
    }

    let mut frame = vec![0u8; frame_len as usize];
    if frame_len > 0 {
        reader.read_exact(&mut frame).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(frame)
}

/// Write a single length-prefixed frame to the stream and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !frame.is_empty() {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;

    Ok(())
}
