//! Request payload layouts.
//!
//! | Code | Payload                                                          |
//! |------|------------------------------------------------------------------|
//! | 600  | `name(255, NUL-padded) \| public_key(160)`                      |
//! | 601  | empty                                                            |
//! | 602  | `target(16)`                                                     |
//! | 603  | `target(16) \| type(1) \| content_size(4) \| content`            |
//! | 604  | empty                                                            |

use crate::codec::{get_padded_str, put_padded};
use crate::error::ProtocolError;
use crate::header::{RequestHeader, REQUEST_HEADER_SIZE};
use crate::types::{ClientId, MessageType, PublicKey, RequestCode};
use crate::{CLIENT_ID_SIZE, NAME_SIZE, PUBLIC_KEY_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed part of a send-message payload (16+1+4 = 21).
pub const SEND_MESSAGE_PREFIX_SIZE: usize = CLIENT_ID_SIZE + 5;

/// Size of a registration payload (255+160 = 415).
pub const REGISTER_PAYLOAD_SIZE: usize = NAME_SIZE + PUBLIC_KEY_SIZE;

/// Registration payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub name: String,
    pub public_key: PublicKey,
}

impl RegisterRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < REGISTER_PAYLOAD_SIZE {
            return Err(ProtocolError::truncated(
                "registration payload",
                REGISTER_PAYLOAD_SIZE,
                payload.len(),
            ));
        }

        let name = get_padded_str(&payload[..NAME_SIZE], "name")?;
        let public_key = PublicKey::from_slice(&payload[NAME_SIZE..REGISTER_PAYLOAD_SIZE])?;
        Ok(Self { name, public_key })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        // One byte is kept for the terminating NUL.
        if self.name.len() >= NAME_SIZE {
            return Err(ProtocolError::FieldTooLong {
                field: "name",
                len: self.name.len(),
                max: NAME_SIZE - 1,
            });
        }
        put_padded(buf, self.name.as_bytes(), NAME_SIZE);
        buf.put_slice(self.public_key.as_bytes());
        Ok(())
    }
}

/// Public key lookup payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyRequest {
    pub target: ClientId,
}

impl PublicKeyRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < CLIENT_ID_SIZE {
            return Err(ProtocolError::truncated(
                "public key payload",
                CLIENT_ID_SIZE,
                payload.len(),
            ));
        }
        Ok(Self {
            target: ClientId::from_slice(&payload[..CLIENT_ID_SIZE])?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.target.as_bytes());
    }
}

/// Fixed-size prefix of a send-message payload.
///
/// The content that follows may not have arrived yet; the connection reader
/// uses `content_size` to decide how much more to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendMessagePrefix {
    pub target: ClientId,
    pub message_type: MessageType,
    pub content_size: u32,
}

impl SendMessagePrefix {
    /// Decodes the prefix and returns it with whatever content bytes are
    /// already present, capped at `content_size`.
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if payload.len() < SEND_MESSAGE_PREFIX_SIZE {
            return Err(ProtocolError::truncated(
                "send message prefix",
                SEND_MESSAGE_PREFIX_SIZE,
                payload.len(),
            ));
        }

        let target = ClientId::from_slice(&payload[..CLIENT_ID_SIZE])?;
        let mut rest = &payload[CLIENT_ID_SIZE..SEND_MESSAGE_PREFIX_SIZE];
        let message_type = MessageType(rest.get_u8());
        let content_size = rest.get_u32_le();

        let available = &payload[SEND_MESSAGE_PREFIX_SIZE..];
        let take = available.len().min(content_size as usize);

        Ok((
            Self {
                target,
                message_type,
                content_size,
            },
            &available[..take],
        ))
    }
}

/// Send-message payload with its complete content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub target: ClientId,
    pub message_type: MessageType,
    pub content: Bytes,
}

impl SendMessageRequest {
    /// Decodes a payload whose content is fully present in `payload`.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (prefix, content) = SendMessagePrefix::decode(payload)?;
        if content.len() < prefix.content_size as usize {
            return Err(ProtocolError::truncated(
                "message content",
                prefix.content_size as usize,
                content.len(),
            ));
        }
        Ok(Self::from_parts(prefix, Bytes::copy_from_slice(content)))
    }

    pub fn from_parts(prefix: SendMessagePrefix, content: Bytes) -> Self {
        Self {
            target: prefix.target,
            message_type: prefix.message_type,
            content,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let size = u32::try_from(self.content.len()).map_err(|_| {
            ProtocolError::PayloadTooLarge {
                size: self.content.len(),
                max: u32::MAX,
            }
        })?;
        buf.put_slice(self.target.as_bytes());
        buf.put_u8(self.message_type.0);
        buf.put_u32_le(size);
        buf.put_slice(&self.content);
        Ok(())
    }
}

/// Decoded request body, one variant per request code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Register(RegisterRequest),
    UsersList,
    PublicKey(PublicKeyRequest),
    SendMessage(SendMessageRequest),
    PullPending,
}

impl RequestBody {
    pub fn code(&self) -> RequestCode {
        match self {
            RequestBody::Register(_) => RequestCode::Register,
            RequestBody::UsersList => RequestCode::UsersList,
            RequestBody::PublicKey(_) => RequestCode::PublicKey,
            RequestBody::SendMessage(_) => RequestCode::SendMessage,
            RequestBody::PullPending => RequestCode::PullPending,
        }
    }

    /// Decodes the payload for a known code from a complete buffer.
    pub fn decode(code: RequestCode, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match code {
            RequestCode::Register => RequestBody::Register(RegisterRequest::decode(payload)?),
            RequestCode::UsersList => RequestBody::UsersList,
            RequestCode::PublicKey => RequestBody::PublicKey(PublicKeyRequest::decode(payload)?),
            RequestCode::SendMessage => {
                RequestBody::SendMessage(SendMessageRequest::decode(payload)?)
            }
            RequestCode::PullPending => RequestBody::PullPending,
        })
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            RequestBody::Register(req) => req.encode(buf),
            RequestBody::PublicKey(req) => {
                req.encode(buf);
                Ok(())
            }
            RequestBody::SendMessage(req) => req.encode(buf),
            RequestBody::UsersList | RequestBody::PullPending => Ok(()),
        }
    }
}

/// A complete request: header plus decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub body: RequestBody,
}

impl Request {
    /// Builds a request; the header's payload size is filled in by `encode`.
    pub fn new(client_id: ClientId, body: RequestBody) -> Self {
        Self {
            header: RequestHeader::new(client_id, body.code(), 0),
            body,
        }
    }

    /// Encodes the request, stamping the real payload size into the header.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        self.body.encode(&mut payload)?;

        let payload_size =
            u32::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: u32::MAX,
            })?;

        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + payload.len());
        RequestHeader {
            payload_size,
            ..self.header
        }
        .encode(&mut buf);
        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decodes a request that is entirely contained in `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = RequestHeader::decode(buf)?;
        let body = RequestBody::decode(header.request_code()?, &buf[REQUEST_HEADER_SIZE..])?;
        Ok(Self { header, body })
    }
}
