//! Length-prefixed framing for the raw TCP transport: a 4-byte big-endian
//! length followed by one UTF-8 JSON message (or batch array).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DaemonError;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one frame. Returns `None` on a clean end of stream between frames;
/// a stream that ends inside a frame, prefix included, is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, DaemonError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    if reader.read(&mut len_bytes[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_bytes[1..]).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DaemonError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(DaemonError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
