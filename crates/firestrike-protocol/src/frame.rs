//! Length-delimited framing
//!
//! Frame structure:
//! - Length (4 bytes): body length in bytes (big-endian)
//! - Body (variable): one JSON-encoded request or response
//! - Payload (optional): raw object bytes, as many as the body's `length`
//!
//! One request and one response are exchanged per connection. Frames hold
//! headers only and stay small; object payloads are streamed in chunks
//! and never buffered whole.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ProtocolError, Result};
use crate::message::{Request, Response};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a frame body (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default upper bound on an object payload (16 GiB)
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Buffer size used when streaming a payload
pub const PAYLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Read one frame body
///
/// The declared length is checked against `max_len` before any buffer is
/// allocated.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_len,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one frame body and flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode a request frame
pub async fn read_request<R>(reader: &mut R, max_len: usize) -> Result<Request>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader, max_len).await?;
    Request::decode(&body)
}

/// Encode and write a request frame
pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(writer, &request.encode()?).await
}

/// Read and decode a response frame
pub async fn read_response<R>(reader: &mut R, max_len: usize) -> Result<Response>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader, max_len).await?;
    Response::decode(&body)
}

/// Encode and write a response frame
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(writer, &response.encode()?).await
}

/// Copy exactly `length` payload bytes from `reader` to `writer`
///
/// Every chunk is passed to `inspect` after it is read, which lets the
/// caller hash the payload in flight. Each individual read or write must
/// make progress within `idle`; the transfer as a whole is unbounded in
/// time so large objects are not cut off on slow links.
pub async fn copy_payload<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    length: u64,
    idle: Duration,
    mut inspect: F,
) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(&[u8]),
{
    let chunk = usize::try_from(length).map_or(PAYLOAD_CHUNK_SIZE, |l| l.min(PAYLOAD_CHUNK_SIZE));
    let mut buf = vec![0u8; chunk.max(1)];
    let mut remaining = length;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = timeout(idle, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| ProtocolError::Stalled(idle))??;
        if n == 0 {
            return Err(ProtocolError::Truncated {
                expected: length,
                received: length - remaining,
            });
        }

        inspect(&buf[..n]);
        timeout(idle, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| ProtocolError::Stalled(idle))??;
        remaining -= n as u64;
    }

    timeout(idle, writer.flush())
        .await
        .map_err(|_| ProtocolError::Stalled(idle))??;
    Ok(())
}
