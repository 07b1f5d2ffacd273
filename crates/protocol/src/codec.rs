//! Length-prefixed JSON framing for control messages and stream headers.
//!
//! Wire format: `[4 bytes: payload length BE][JSON payload]`. The length
//! prefix delimits records on a byte stream; JSON inside keeps the payload
//! self-describing.

use common::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size: 1 MiB.
pub const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Write one framed value, flushing the writer.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    // Coalesce prefix + payload into a single write.
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);

    writer
        .write_all(&buf)
        .await
        .map_err(|e| Error::Transport(format!("failed to write frame: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("failed to flush frame: {e}")))?;
    Ok(())
}

/// Read one framed value.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Transport(format!("failed to read frame length: {e}")))?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("failed to read frame payload: {e}")))?;

    serde_json::from_slice(&payload).map_err(|e| Error::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlMsg;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let msg = ControlMsg::Hello {
            version: "0.1.0".into(),
            auto_forward: true,
        };
        write_frame(&mut a, &msg).await.expect("write failed");

        let decoded: ControlMsg = read_frame(&mut b).await.expect("read failed");
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn frames_preserve_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        for port in [1u16, 2, 3] {
            write_frame(&mut a, &ControlMsg::CloseRequest { port })
                .await
                .expect("write failed");
        }

        for port in [1u16, 2, 3] {
            let decoded: ControlMsg = read_frame(&mut b).await.expect("read failed");
            assert_eq!(decoded, ControlMsg::CloseRequest { port });
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Hand-craft a length prefix larger than the cap.
        let bogus = (MAX_FRAME_SIZE + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();

        let result: Result<ControlMsg> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn truncated_frame_reports_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Announce 100 bytes but close after 3.
        tokio::io::AsyncWriteExt::write_all(&mut a, &100u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"abc")
            .await
            .unwrap();
        drop(a);

        let result: Result<ControlMsg> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
