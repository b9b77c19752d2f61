//! Length-prefixed wire framing
//!
//! `u32` big-endian body length, then the body (`nonce || ciphertext`).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

pub const LENGTH_PREFIX: usize = 4;

/// Read one frame body. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > max_frame_bytes {
        return Err(SessionError::FrameTooLarge { len, max: max_frame_bytes });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_frame_bytes: usize) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_frame_bytes || body.len() > u32::MAX as usize {
        return Err(SessionError::FrameTooLarge { len: body.len(), max: max_frame_bytes });
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_sequence_then_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first", 1024).await.unwrap();
        write_frame(&mut wire, b"", 1024).await.unwrap();
        write_frame(&mut wire, b"third", 1024).await.unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Some(b"third".to_vec()));
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_reading_body() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&2048u32.to_be_bytes())
            .build();

        assert!(matches!(
            read_frame(&mut reader, 1024).await,
            Err(SessionError::FrameTooLarge { len: 2048, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");

        let mut reader = wire.as_slice();
        assert!(matches!(read_frame(&mut reader, 1024).await, Err(SessionError::Io(_))));
    }

    #[tokio::test]
    async fn test_write_refuses_oversized_body() {
        let mut wire = Vec::new();
        assert!(write_frame(&mut wire, &[0u8; 65], 64).await.is_err());
        assert!(wire.is_empty());
    }
}
