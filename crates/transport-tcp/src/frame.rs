//! Wire framing: u32 big-endian length prefix followed by a bincode [`Frame`].

use p2pconnect_core::SessionError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Payload bytes carried by one [`Frame::ResourceChunk`].
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in each direction. The connecting side names the service
    /// it is looking for; the accepting side echoes its own.
    Hello { device: String, service_id: String },
    Text(String),
    ResourceBegin { name: String, size: u64 },
    ResourceChunk(Vec<u8>),
    /// Hex SHA-256 of everything sent since the matching `ResourceBegin`.
    ResourceEnd { sha256: String },
    ResourceAbort { reason: String },
}

async fn write_lp<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8],
) -> std::io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream before any length byte.
async fn read_lp<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut lenb = [0u8; 4];
    match transport.read_exact(&mut lenb).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    frame: &Frame,
) -> Result<(), SessionError> {
    let bytes = bincode::serialize(frame).map_err(|e| SessionError::Frame(e.to_string()))?;
    write_lp(transport, &bytes).await?;
    Ok(())
}

/// Read the next frame, `Ok(None)` once the peer has closed the stream.
pub async fn read_frame<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
) -> Result<Option<Frame>, SessionError> {
    match read_lp(transport).await? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| SessionError::Frame(e.to_string())),
        None => Ok(None),
    }
}
