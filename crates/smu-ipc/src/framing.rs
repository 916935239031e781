use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::IpcError;

/// Maximum payload size accepted by framing helpers, excluding the line break.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Writes one newline-terminated frame to the async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), IpcError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if payload.contains(&b'\n') {
        return Err(IpcError::Encode(
            "frame payload must not contain a line break".to_string(),
        ));
    }

    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one newline-terminated frame, skipping blank lines.
///
/// The returned payload has the trailing `\n` (and `\r`, if present) removed.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, IpcError> {
    let limit = (MAX_FRAME_SIZE + 2) as u64;

    loop {
        let mut frame = Vec::new();
        let read = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut frame)
            .await?;

        if read == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        if frame.last() != Some(&b'\n') {
            if frame.len() as u64 == limit {
                return Err(IpcError::FrameTooLarge {
                    size: frame.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }

        if frame.len() > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(frame);
    }
}
