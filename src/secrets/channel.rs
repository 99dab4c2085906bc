//! Framed secret channel.
//!
//! One envelope per connection: a 4-byte big-endian length followed by that
//! many bytes of UTF-8 JSON encoding a [`Credential`]. The sender writes and
//! shuts down its write half; the receiver reads exactly one envelope.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::ChannelError;
use crate::secrets::Credential;

/// Overall receive timeout used by the bootstrap.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a declared payload length.
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode a credential into its envelope bytes.
pub fn encode_envelope(credential: &Credential) -> Result<Vec<u8>, ChannelError> {
    let payload = serde_json::to_vec(credential).map_err(|e| ChannelError::from_json(&e))?;
    if payload.len() > MAX_ENVELOPE_LEN {
        return Err(ChannelError::Oversized {
            len: payload.len(),
            max: MAX_ENVELOPE_LEN,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| ChannelError::Oversized {
        len: payload.len(),
        max: MAX_ENVELOPE_LEN,
    })?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one envelope, flush, and close the write side.
pub async fn send_envelope<W>(writer: &mut W, credential: &Credential) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_envelope(credential)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read exactly one envelope and validate the credential inside it.
///
/// No timeout is applied here; see [`receive_from`].
pub async fn read_envelope<R>(reader: &mut R) -> Result<Credential, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    read_full(reader, &mut prefix).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_ENVELOPE_LEN {
        return Err(ChannelError::Oversized {
            len,
            max: MAX_ENVELOPE_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;

    let credential: Credential =
        serde_json::from_slice(&payload).map_err(|e| ChannelError::from_json(&e))?;
    credential.validate()?;
    Ok(credential)
}

/// Connect to a secret endpoint and receive one credential, bounded by `timeout`.
pub async fn receive_from(path: &Path, timeout: Duration) -> Result<Credential, ChannelError> {
    let exchange = async {
        let mut stream = UnixStream::connect(path).await?;
        let credential = read_envelope(&mut stream).await?;
        let _ = stream.shutdown().await;
        Ok(credential)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout(timeout)),
    }
}

/// Fill `buf` completely, accumulating partial reads.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ChannelError::Truncated {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}
