use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Upper bound on a single frame; a policy bundle for a large tenant
/// fits comfortably, anything bigger is a bug or an attack.
pub const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    Oversized(usize),

    #[error("stream write failed: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("stream read failed: {0}")]
    Read(#[from] quinn::ReadExactError),

    #[error("stream closed: {0}")]
    Closed(#[from] quinn::ClosedStream),

    #[error("bad frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes one `u32`-length-prefixed JSON frame.
pub async fn write_frame<T: Serialize>(
    stream: &mut quinn::SendStream,
    msg: &T,
) -> Result<(), CodecError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME {
        return Err(CodecError::Oversized(body.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Reads one `u32`-length-prefixed JSON frame.
pub async fn read_frame<T: DeserializeOwned>(
    stream: &mut quinn::RecvStream,
) -> Result<T, CodecError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(CodecError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
