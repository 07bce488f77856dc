//! Length-prefixed envelope framing.
//!
//! Frames are `[u32 big-endian length][serialized envelope]`. The payload
//! serialization is pluggable through [`WireFormat`]; the default is the
//! bounded bincode encoding from [`crate::messages`]. Both directions
//! enforce a configurable frame-size ceiling so a hostile or broken peer
//! cannot make the node allocate unbounded memory.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::{deserialize_envelope, serialize_envelope, Envelope};

/// Default maximum frame length: 64 MiB.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const LEN_SIZE: usize = 4;

/// Error producing or consuming a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: u32, limit: u32 },
    #[error("envelope encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("envelope decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Pluggable envelope serialization.
///
/// The codec is symmetric: any envelope written by one node is decodable by
/// another node configured with the same format.
pub trait WireFormat: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, FrameError>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, FrameError>;
}

/// The default compact binary format (bounded bincode).
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeFormat;

impl WireFormat for BincodeFormat {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
        serialize_envelope(envelope).map_err(FrameError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, FrameError> {
        deserialize_envelope(bytes).map_err(FrameError::Decode)
    }
}

/// Shared handle to a wire format, stored in node configuration.
pub type Format = Arc<dyn WireFormat>;

pub fn default_format() -> Format {
    Arc::new(BincodeFormat)
}

/// Encode an envelope into a complete frame.
pub fn encode_frame(
    format: &dyn WireFormat,
    envelope: &Envelope,
    max_frame_len: u32,
) -> Result<Vec<u8>, FrameError> {
    let payload = format.encode(envelope)?;
    let len = payload.len() as u32;
    if len > max_frame_len {
        return Err(FrameError::TooLarge {
            len,
            limit: max_frame_len,
        });
    }
    let mut frame = Vec::with_capacity(LEN_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one envelope as a frame.
pub async fn write_frame<W>(
    writer: &mut W,
    format: &dyn WireFormat,
    envelope: &Envelope,
    max_frame_len: u32,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(format, envelope, max_frame_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it. Returns `Ok(None)` on a clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(
    reader: &mut R,
    format: &dyn WireFormat,
    max_frame_len: u32,
) -> Result<Option<Envelope>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_len {
        return Err(FrameError::TooLarge {
            len,
            limit: max_frame_len,
        });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(format.decode(&payload)?))
}
