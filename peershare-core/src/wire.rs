//! Framing: length-prefix (4 bytes LE) + payload, with a hard upper bound on frame length.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LEN_SIZE: usize = 4;

/// Default bound on a single frame. Large enough for a whole shared file plus envelope.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

/// Encode a payload into a single frame: 4 bytes LE length + payload.
pub fn encode_frame(payload: &[u8], max_len: u32) -> Result<Vec<u8>, FrameError> {
    let len = checked_len(payload.len(), max_len)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8], max_len: u32) -> Result<(&[u8], usize), FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > max_len {
        return Err(FrameError::TooLarge { len: len as usize, max: max_len });
    }
    let end = LEN_SIZE + len as usize;
    if bytes.len() < end {
        return Err(FrameError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..end], end))
}

/// Write one frame to the stream and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: u32) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = checked_len(payload.len(), max_len)?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from the stream.
///
/// The declared length is checked against `max_len` before anything is allocated, and the buffer
/// grows only as bytes actually arrive, so a peer cannot make us reserve memory it never sends.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_truncated)?;
    let len = u32::from_le_bytes(len_buf);
    if len > max_len {
        return Err(FrameError::TooLarge { len: len as usize, max: max_len });
    }
    let mut payload = Vec::with_capacity((len as usize).min(64 * 1024));
    let read = (&mut *reader).take(len as u64).read_to_end(&mut payload).await?;
    if read < len as usize {
        return Err(FrameError::Truncated {
            expected: len as usize,
            got: read,
        });
    }
    Ok(payload)
}

/// Read one frame, failing with `Idle` when the stream makes no progress for `idle`.
///
/// The deadline restarts with every chunk received, so a slow but steady sender is never cut off.
pub async fn read_frame_idle<R>(reader: &mut R, max_len: u32, idle: Duration) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    tokio::time::timeout(idle, reader.read_exact(&mut len_buf))
        .await
        .map_err(|_| FrameError::Idle(idle))?
        .map_err(eof_as_truncated)?;
    let len = u32::from_le_bytes(len_buf);
    if len > max_len {
        return Err(FrameError::TooLarge { len: len as usize, max: max_len });
    }
    let len = len as usize;
    let mut payload = Vec::with_capacity(len.min(64 * 1024));
    let mut chunk = vec![0u8; len.clamp(1, 64 * 1024)];
    while payload.len() < len {
        let want = (len - payload.len()).min(chunk.len());
        let n = tokio::time::timeout(idle, reader.read(&mut chunk[..want]))
            .await
            .map_err(|_| FrameError::Idle(idle))??;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: len,
                got: payload.len(),
            });
        }
        payload.extend_from_slice(&chunk[..n]);
    }
    Ok(payload)
}

fn checked_len(len: usize, max_len: u32) -> Result<u32, FrameError> {
    match u32::try_from(len) {
        Ok(l) if l <= max_len => Ok(l),
        _ => Err(FrameError::TooLarge { len, max: max_len }),
    }
}

fn eof_as_truncated(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated {
            expected: LEN_SIZE,
            got: 0,
        }
    } else {
        FrameError::Io(e)
    }
}

/// Error reading or writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: u32 },
    #[error("stream closed after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },
    #[error("no data for {0:?}")]
    Idle(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
