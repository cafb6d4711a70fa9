//! Node Wire Protocol
//!
//! Defines the messages exchanged between a `RemoteNode` and a `NodeServer`.
//!
//! Every frame is a big-endian `u32` payload length followed by the bincode
//! encoding of a [`Request`] or [`Response`]. One connection carries one request
//! at a time; the server answers every request with exactly one response.
//!
//! Plain request variants act on the receiving node's engine only; that is how
//! replicas talk to each other. [`Request::Client`] wraps a [`ClientRequest`],
//! which the receiving node routes through its cluster client to the key's
//! replica set.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// An operation against the engine behind a node server.
///
/// TTLs travel as whole milliseconds; `0` means "no TTL".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Set {
        key: String,
        value: Bytes,
        ttl_ms: u64,
    },
    Get {
        key: String,
    },
    GetWithToken {
        key: String,
    },
    Delete {
        key: String,
    },
    Cas {
        key: String,
        value: Bytes,
        expected: u64,
        ttl_ms: u64,
    },
    Clear,
    Ping,
    /// Replicated operation, coordinated by the receiving node.
    Client(ClientRequest),
}

/// Operations an application sends to any node of the cluster.
///
/// Answers reuse the [`Response`] variants of the matching local operation. A
/// write that misses quorum because its leader replica failed comes back as
/// [`Response::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Set {
        key: String,
        value: Bytes,
        ttl_ms: u64,
    },
    Get {
        key: String,
    },
    GetWithToken {
        key: String,
    },
    Delete {
        key: String,
    },
    Cas {
        key: String,
        value: Bytes,
        expected: u64,
        ttl_ms: u64,
    },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Stored(bool),
    Value(Option<Bytes>),
    ValueWithToken(Option<(Bytes, u64)>),
    Deleted(bool),
    Swapped(bool),
    Cleared,
    Pong,
    /// The server could not process the request.
    Error(String),
}

/// Sub-millisecond TTLs round up so they never turn into "no TTL".
pub fn ttl_to_millis(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        return 0;
    }
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

pub fn ttl_from_millis(ttl_ms: u64) -> Duration {
    Duration::from_millis(ttl_ms)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message).context("Failed to encode frame")?;
    if payload.len() > MAX_FRAME_LEN {
        bail!(
            "Frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        );
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one raw payload. `None` means the peer closed the connection cleanly
/// between frames.
pub async fn read_payload<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("Peer announced a {} byte frame, limit is {}", len, MAX_FRAME_LEN);
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("Connection closed mid-frame")?;
    Ok(Some(payload))
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_payload(reader).await? {
        Some(payload) => {
            let message = bincode::deserialize(&payload).context("Failed to decode frame")?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}
