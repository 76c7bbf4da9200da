//! Frame header encoding and framed reads.
//!
//! A frame starts with a fixed 5-byte header: the `0xCE` tag byte
//! (a MessagePack uint32 marker) followed by the body length as a
//! big-endian u32. The body is read in full into a pooled buffer.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::protocol::buffer_pool::{BufferPool, PooledBuf};

/// Frame header size in bytes (fixed, exactly 5).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Tag byte every frame header starts with.
pub const FRAME_TAG: u8 = 0xce;

/// Encode a frame header for a body of `len` bytes.
#[inline]
pub fn encode_header(len: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    buf[0] = FRAME_TAG;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

/// Decode and validate a frame header, returning the body length.
///
/// A wrong tag byte or a zero length is a protocol error; the caller
/// treats it as a transport failure and tears the connection down.
#[inline]
pub fn decode_header(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<u32> {
    if buf[0] != FRAME_TAG {
        return Err(Error::Protocol(format!(
            "bad frame tag {:#04x}, expected {FRAME_TAG:#04x}",
            buf[0]
        )));
    }

    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len == 0 {
        return Err(Error::Protocol("zero-length frame body".into()));
    }

    Ok(len)
}

/// Read one complete frame body into a pooled buffer.
pub async fn read_frame<R>(r: &mut R, pool: &BufferPool) -> Result<PooledBuf>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut header).await?;

    let len = decode_header(&header)?;
    let mut body = pool.acquire(len as usize);
    r.read_exact(&mut body).await?;

    Ok(body)
}
