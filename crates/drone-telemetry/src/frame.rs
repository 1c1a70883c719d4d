// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefixed framing for payloads on a byte stream.
//!
//! ```text
//! +--------------------+------------------+
//! | length (4, BE u32) | payload (length) |
//! +--------------------+------------------+
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty frame")]
    Empty,

    #[error("Frame too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Stream closed inside a frame header ({read} of 4 bytes)")]
    TruncatedHeader { read: usize },
}

/// Write one frame and flush.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > max_frame_size {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: max_frame_size,
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame into `buf`.
///
/// Returns `Ok(false)` when the peer closed the stream cleanly before a new
/// frame started. A close anywhere inside a frame is an error.
pub async fn read_frame<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_frame_size: usize,
) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut read = 0;
    while read < len_buf.len() {
        match reader.read(&mut len_buf[read..]).await? {
            0 if read == 0 => return Ok(false),
            0 => return Err(FrameError::TruncatedHeader { read }),
            n => read += n,
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_frame_size {
        return Err(FrameError::TooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(true)
}
