//! Reading one request from a connection and writing one chunked response.
//!
//! The first receive takes at most [`CHUNK_SIZE`] bytes. Only a send-message
//! request may need more: its content is received in further reads. Every
//! read is bounded by the read timeout and the whole response write by the
//! write timeout, so a silent or stalled peer never holds its connection slot
//! for long.

use crate::error::ServerError;
use bytes::{Bytes, BytesMut};
use msgrelay_protocol::request::{SendMessagePrefix, SEND_MESSAGE_PREFIX_SIZE};
use msgrelay_protocol::{RequestCode, RequestHeader, CHUNK_SIZE, REQUEST_HEADER_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Limits applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Bound on each read, including the first one.
    pub read_timeout: Duration,
    /// Bound on writing the complete response.
    pub write_timeout: Duration,
    /// Largest accepted message content.
    pub max_content_bytes: u32,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_content_bytes: msgrelay_protocol::DEFAULT_MAX_CONTENT_SIZE,
        }
    }
}

/// A request whose header is decoded but whose payload is still raw.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub header: RequestHeader,
    /// Payload bytes after the header. For a send-message request this holds
    /// the full declared content and nothing beyond it.
    pub payload: Bytes,
}

/// Reads one request.
///
/// Returns `Ok(None)` when the peer closed without sending anything, and
/// [`ServerError::IdleTimeout`] when it sent nothing within the read timeout.
pub async fn read_request<S>(
    stream: &mut S,
    limits: ConnectionLimits,
) -> Result<Option<IncomingRequest>, ServerError>
where
    S: AsyncRead + Unpin,
{
    let mut first = [0u8; CHUNK_SIZE];
    let n = tokio::time::timeout(limits.read_timeout, stream.read(&mut first))
        .await
        .map_err(|_| ServerError::IdleTimeout(limits.read_timeout))??;
    if n == 0 {
        return Ok(None);
    }
    let received = &first[..n];

    let header = RequestHeader::decode(received)?;
    let payload = &received[REQUEST_HEADER_SIZE..];

    if !matches!(header.request_code(), Ok(RequestCode::SendMessage)) {
        return Ok(Some(IncomingRequest {
            header,
            payload: Bytes::copy_from_slice(payload),
        }));
    }

    let (prefix, content) = SendMessagePrefix::decode(payload)?;
    if prefix.content_size > limits.max_content_bytes {
        return Err(ServerError::ContentTooLarge {
            size: prefix.content_size,
            max: limits.max_content_bytes,
        });
    }

    let expected = prefix.content_size as usize;
    let mut body = BytesMut::with_capacity(SEND_MESSAGE_PREFIX_SIZE + content.len());
    body.extend_from_slice(&payload[..SEND_MESSAGE_PREFIX_SIZE]);
    body.extend_from_slice(content);

    let mut buf = [0u8; CHUNK_SIZE];
    let mut have = content.len();
    while have < expected {
        let n = tokio::time::timeout(limits.read_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| ServerError::ReadTimeout(limits.read_timeout))??;
        if n == 0 {
            return Err(ServerError::ClosedMidRequest {
                received: have,
                expected,
            });
        }

        let take = n.min(expected - have);
        body.extend_from_slice(&buf[..take]);
        have += take;
    }

    tracing::debug!(
        "Received {} content bytes for {}",
        expected,
        header.client_id
    );

    Ok(Some(IncomingRequest {
        header,
        payload: body.freeze(),
    }))
}

/// Writes an encoded response frame, zero-padded to whole chunks.
///
/// Returns the number of bytes put on the wire. A peer that does not take the
/// whole response within `timeout` gets [`ServerError::WriteTimeout`].
pub async fn write_response<S>(
    stream: &mut S,
    frame: BytesMut,
    timeout: Duration,
) -> Result<usize, ServerError>
where
    S: AsyncWrite + Unpin,
{
    let padded = msgrelay_protocol::Encoder::pad_to_chunks(frame);
    tokio::time::timeout(timeout, write_chunks(stream, &padded))
        .await
        .map_err(|_| ServerError::WriteTimeout(timeout))??;
    Ok(padded.len())
}

async fn write_chunks<S>(stream: &mut S, padded: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    for chunk in padded.chunks(CHUNK_SIZE) {
        stream.write_all(chunk).await?;
    }
    stream.flush().await
}
