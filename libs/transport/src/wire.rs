//! Wire framing: bincode frames with a u32 big-endian length prefix.

use crate::{TransportError, TransportResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, matching the bus's message size limit
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frames sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    /// First frame on every connection, identifies the client for server logs
    Connect { name: String },

    /// Register a subscription. Subscribers sharing a queue group form a
    /// competing-consumer group on the server.
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },

    /// Publish a payload to a subject
    Pub {
        subject: String,
        reply_to: Option<String>,
        payload: Vec<u8>,
    },
}

/// Frames sent by a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerFrame {
    /// A message matching one of the client's subscriptions
    Msg {
        subject: String,
        reply_to: Option<String>,
        payload: Vec<u8>,
    },
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(frame)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(data.len()));
    }

    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R, T>(reader: &mut R) -> TransportResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(bincode::deserialize(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let frame = ClientFrame::Pub {
            subject: "choria.federation.prod.federation".to_string(),
            reply_to: Some("reply.1".to_string()),
            payload: b"{\"headers\":{}}".to_vec(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        // length prefix accounts for the whole remainder
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: ClientFrame = read_frame(&mut cursor).await.unwrap();
        match decoded {
            ClientFrame::Pub {
                subject, payload, ..
            } => {
                assert_eq!(subject, "choria.federation.prod.federation");
                assert_eq!(payload, b"{\"headers\":{}}");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let mut cursor = std::io::Cursor::new(buf);
        let result: TransportResult<ServerFrame> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let frame = ClientFrame::Connect {
            name: "fed1".to_string(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = std::io::Cursor::new(buf);
        let result: TransportResult<ClientFrame> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
