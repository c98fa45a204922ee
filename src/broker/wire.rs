//! Broker wire protocol.
//!
//! Every frame is a big-endian `u32` byte length followed by that many bytes
//! of bincode. Frames larger than the configured maximum are rejected on both
//! ends before any allocation.

use crate::error::{PipelineError, PipelineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Requests sent by a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Fire-and-forget; the broker does not answer.
    Publish { topic: String, payload: Vec<u8> },
    /// Turns the connection into a subscription: `Ack`, then `Message` frames.
    Subscribe { pattern: String },
    Put { key: String, value: Vec<u8> },
    Get { key: String, timeout_ms: u64 },
    Take { key: String, timeout_ms: u64 },
    Remove { key: String },
    Ping,
}

/// Broker answers and subscription deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Ack,
    Message { topic: String, payload: Vec<u8> },
    Value(Vec<u8>),
    NotFound,
    Error(String),
    Pong,
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> PipelineResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame_bytes {
        return Err(PipelineError::Codec(format!(
            "Frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T, max_frame_bytes: usize) -> PipelineResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = bincode::serialize(frame)?;
    if buf.len() > max_frame_bytes {
        return Err(PipelineError::Codec(format!(
            "Frame of {} bytes exceeds limit of {}",
            buf.len(),
            max_frame_bytes
        )));
    }
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[tokio::test]
    async fn test_frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &ClientFrame::Get { key: "R1:2".into(), timeout_ms: 500 }, MAX)
            .await
            .unwrap();
        write_frame(&mut a, &ClientFrame::Ping, MAX).await.unwrap();
        drop(a);

        let first: Option<ClientFrame> = read_frame(&mut b, MAX).await.unwrap();
        assert_eq!(first, Some(ClientFrame::Get { key: "R1:2".into(), timeout_ms: 500 }));
        let second: Option<ClientFrame> = read_frame(&mut b, MAX).await.unwrap();
        assert_eq!(second, Some(ClientFrame::Ping));
        let end: Option<ClientFrame> = read_frame(&mut b, MAX).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(64);
        let frame = ServerFrame::Value(vec![0u8; 2 * MAX]);
        let err = write_frame(&mut a, &frame, MAX).await.unwrap_err();
        assert!(matches!(err, PipelineError::Codec(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX + 1) as u32).await.unwrap();
        let err = read_frame::<_, ServerFrame>(&mut b, MAX).await.unwrap_err();
        assert!(matches!(err, PipelineError::Codec(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        let err = read_frame::<_, ServerFrame>(&mut b, MAX).await.unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
