//! Length-prefixed bincode framing over async byte streams
//!
//! Frame format: [LEN: u32 big-endian][BODY: bincode]

use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize `msg` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "peer announced {} byte frame, limit is {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// Open a TCP connection, mapping failures to retryable errors.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(Error::Timeout(format!("connect to {}", addr))),
    }
}
