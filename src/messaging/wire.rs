use anyhow::{bail, Context};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::messaging::envelope::Envelope;

pub const MAX_FRAME_SIZE: usize = 256 * 1024; //TODO make this configurable

/// Write a single envelope as a length-prefixed JSON frame: a u32 (network byte order)
///  payload length followed by the UTF-8 JSON document.
pub async fn write_envelope<W: AsyncWrite + Unpin>(stream: &mut W, envelope: &Envelope) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(envelope)
        .context("serializing envelope")?;
    if payload.len() > MAX_FRAME_SIZE {
        bail!("envelope exceeds max frame size of {} bytes", MAX_FRAME_SIZE);
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    stream.write_all(&buf).await?;
    stream.flush().await?;

    trace!("wrote {:?} ({} bytes)", envelope, payload.len());
    Ok(())
}

/// Read exactly one envelope from the stream. Blocks until a full frame is available;
///  end-of-stream or a truncated frame surfaces as a transport error.
pub async fn read_envelope<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Envelope> {
    let len = stream.read_u32().await
        .context("reading frame length")? as usize;
    if len > MAX_FRAME_SIZE {
        bail!("incoming frame of {} bytes exceeds max frame size of {} bytes", len, MAX_FRAME_SIZE);
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await
        .context("reading frame payload")?;

    let envelope = serde_json::from_slice(&payload)
        .context("decoding envelope")?;
    trace!("read {:?} ({} bytes)", envelope, len);
    Ok(envelope)
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let mut envelope = Envelope::new("Chat", vec![json!("hello"), json!(7)]).unwrap();
        envelope.sign("c1");
        write_envelope(&mut a, &envelope).await.unwrap();

        let actual = read_envelope(&mut b).await.unwrap();
        assert_eq!(actual, envelope);
    }

    #[tokio::test]
    async fn test_consecutive_frames_stay_separate() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let first = Envelope::new("first", vec![]).unwrap();
        let second = Envelope::new("second", vec![json!(1)]).unwrap();
        write_envelope(&mut a, &first).await.unwrap();
        write_envelope(&mut a, &second).await.unwrap();

        assert_eq!(read_envelope(&mut b).await.unwrap(), first);
        assert_eq!(read_envelope(&mut b).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // hand-crafted header announcing a frame above the limit
        a.write_all(&((MAX_FRAME_SIZE as u32 + 1).to_be_bytes())).await.unwrap();

        assert!(read_envelope(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"not a hundred bytes").await.unwrap();
        drop(a);

        assert!(read_envelope(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_end_of_stream_is_an_error() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);

        assert!(read_envelope(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_payload_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{{{").await.unwrap();

        assert!(read_envelope(&mut b).await.is_err());
    }
}
