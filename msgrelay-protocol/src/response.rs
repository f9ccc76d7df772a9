//! Response payload layouts.
//!
//! | Code | Payload                                                              |
//! |------|----------------------------------------------------------------------|
//! | 2100 | `client_id(16)`                                                      |
//! | 2101 | repeated `client_id(16) \| name(255, NUL-padded)`                    |
//! | 2102 | `client_id(16) \| public_key(160)`                                   |
//! | 2103 | `target(16) \| message_id(4)`                                        |
//! | 2104 | repeated `source(16) \| message_id(4) \| type(1) \| size(4) \| content` |
//! | 9000 | empty                                                                |

use crate::codec::{get_padded_str, put_padded};
use crate::error::ProtocolError;
use crate::header::{ResponseHeader, RESPONSE_HEADER_SIZE};
use crate::types::{ClientId, MessageType, PublicKey, ResponseCode};
use crate::{CLIENT_ID_SIZE, MESSAGE_ID_SIZE, NAME_SIZE, PUBLIC_KEY_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of one users-list entry (16+255 = 271).
pub const USER_ENTRY_SIZE: usize = CLIENT_ID_SIZE + NAME_SIZE;

/// Size of the fixed part of one pending-message record (16+4+1+4 = 25).
pub const PENDING_RECORD_PREFIX_SIZE: usize = CLIENT_ID_SIZE + MESSAGE_ID_SIZE + 5;

/// One entry of the users list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub client_id: ClientId,
    pub name: String,
}

/// One queued message as delivered to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub source: ClientId,
    pub message_id: u32,
    pub message_type: MessageType,
    pub content: Bytes,
}

impl PendingMessage {
    fn encoded_len(&self) -> usize {
        PENDING_RECORD_PREFIX_SIZE + self.content.len()
    }
}

/// A server response. Every variant goes through the same encoding path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registered {
        client_id: ClientId,
    },
    UsersList {
        users: Vec<UserEntry>,
    },
    PublicKey {
        client_id: ClientId,
        public_key: PublicKey,
    },
    MessageSent {
        target: ClientId,
        message_id: u32,
    },
    PendingMessages {
        messages: Vec<PendingMessage>,
    },
    GeneralError,
}

impl Response {
    pub fn code(&self) -> ResponseCode {
        match self {
            Response::Registered { .. } => ResponseCode::Registered,
            Response::UsersList { .. } => ResponseCode::UsersList,
            Response::PublicKey { .. } => ResponseCode::PublicKey,
            Response::MessageSent { .. } => ResponseCode::MessageSent,
            Response::PendingMessages { .. } => ResponseCode::PendingMessages,
            Response::GeneralError => ResponseCode::GeneralError,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::GeneralError)
    }

    /// Size of the payload this response encodes to.
    pub fn payload_size(&self) -> usize {
        match self {
            Response::Registered { .. } => CLIENT_ID_SIZE,
            Response::UsersList { users } => users.len() * USER_ENTRY_SIZE,
            Response::PublicKey { .. } => CLIENT_ID_SIZE + PUBLIC_KEY_SIZE,
            Response::MessageSent { .. } => CLIENT_ID_SIZE + MESSAGE_ID_SIZE,
            Response::PendingMessages { messages } => {
                messages.iter().map(PendingMessage::encoded_len).sum()
            }
            Response::GeneralError => 0,
        }
    }

    /// Encodes header and payload. Output length is always
    /// `RESPONSE_HEADER_SIZE + payload_size()`.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let size = self.payload_size();
        let payload_size = u32::try_from(size).map_err(|_| ProtocolError::PayloadTooLarge {
            size,
            max: u32::MAX,
        })?;

        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + size);
        ResponseHeader::new(self.code(), payload_size).encode(&mut buf);

        match self {
            Response::Registered { client_id } => buf.put_slice(client_id.as_bytes()),
            Response::UsersList { users } => {
                for user in users {
                    buf.put_slice(user.client_id.as_bytes());
                    // Names are capped below NAME_SIZE by the store.
                    let name = user.name.as_bytes();
                    put_padded(&mut buf, &name[..name.len().min(NAME_SIZE)], NAME_SIZE);
                }
            }
            Response::PublicKey {
                client_id,
                public_key,
            } => {
                buf.put_slice(client_id.as_bytes());
                buf.put_slice(public_key.as_bytes());
            }
            Response::MessageSent { target, message_id } => {
                buf.put_slice(target.as_bytes());
                buf.put_u32_le(*message_id);
            }
            Response::PendingMessages { messages } => {
                for msg in messages {
                    buf.put_slice(msg.source.as_bytes());
                    buf.put_u32_le(msg.message_id);
                    buf.put_u8(msg.message_type.0);
                    buf.put_u32_le(msg.content.len() as u32);
                    buf.put_slice(&msg.content);
                }
            }
            Response::GeneralError => {}
        }

        debug_assert_eq!(buf.len(), RESPONSE_HEADER_SIZE + size);
        Ok(buf)
    }

    /// Decodes a response from `buf`.
    ///
    /// Returns `Ok(None)` if the declared payload has not fully arrived yet.
    /// Bytes beyond the declared payload (chunk padding) are ignored.
    pub fn decode(buf: &[u8]) -> Result<Option<(ResponseHeader, Self)>, ProtocolError> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Ok(None);
        }
        let header = ResponseHeader::decode(buf)?;
        let total = RESPONSE_HEADER_SIZE + header.payload_size as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = &buf[RESPONSE_HEADER_SIZE..total];
        let response = Self::decode_payload(header.response_code()?, payload)?;
        Ok(Some((header, response)))
    }

    fn decode_payload(code: ResponseCode, payload: &[u8]) -> Result<Self, ProtocolError> {
        let need = |what, needed: usize| {
            if payload.len() < needed {
                Err(ProtocolError::truncated(what, needed, payload.len()))
            } else {
                Ok(())
            }
        };

        Ok(match code {
            ResponseCode::Registered => {
                need("registration response", CLIENT_ID_SIZE)?;
                Response::Registered {
                    client_id: ClientId::from_slice(&payload[..CLIENT_ID_SIZE])?,
                }
            }
            ResponseCode::UsersList => {
                if payload.len() % USER_ENTRY_SIZE != 0 {
                    return Err(ProtocolError::truncated(
                        "users list entry",
                        USER_ENTRY_SIZE,
                        payload.len() % USER_ENTRY_SIZE,
                    ));
                }
                let users = payload
                    .chunks_exact(USER_ENTRY_SIZE)
                    .map(|entry| {
                        Ok(UserEntry {
                            client_id: ClientId::from_slice(&entry[..CLIENT_ID_SIZE])?,
                            name: get_padded_str(&entry[CLIENT_ID_SIZE..], "name")?,
                        })
                    })
                    .collect::<Result<Vec<_>, ProtocolError>>()?;
                Response::UsersList { users }
            }
            ResponseCode::PublicKey => {
                need("public key response", CLIENT_ID_SIZE + PUBLIC_KEY_SIZE)?;
                Response::PublicKey {
                    client_id: ClientId::from_slice(&payload[..CLIENT_ID_SIZE])?,
                    public_key: PublicKey::from_slice(
                        &payload[CLIENT_ID_SIZE..CLIENT_ID_SIZE + PUBLIC_KEY_SIZE],
                    )?,
                }
            }
            ResponseCode::MessageSent => {
                need("message sent response", CLIENT_ID_SIZE + MESSAGE_ID_SIZE)?;
                let mut rest = &payload[CLIENT_ID_SIZE..];
                Response::MessageSent {
                    target: ClientId::from_slice(&payload[..CLIENT_ID_SIZE])?,
                    message_id: rest.get_u32_le(),
                }
            }
            ResponseCode::PendingMessages => Response::PendingMessages {
                messages: decode_pending(payload)?,
            },
            ResponseCode::GeneralError => Response::GeneralError,
        })
    }
}

fn decode_pending(mut payload: &[u8]) -> Result<Vec<PendingMessage>, ProtocolError> {
    let mut messages = Vec::new();
    while !payload.is_empty() {
        if payload.len() < PENDING_RECORD_PREFIX_SIZE {
            return Err(ProtocolError::truncated(
                "pending message record",
                PENDING_RECORD_PREFIX_SIZE,
                payload.len(),
            ));
        }
        let source = ClientId::from_slice(&payload[..CLIENT_ID_SIZE])?;
        payload.advance(CLIENT_ID_SIZE);
        let message_id = payload.get_u32_le();
        let message_type = MessageType(payload.get_u8());
        let size = payload.get_u32_le() as usize;

        if payload.len() < size {
            return Err(ProtocolError::truncated(
                "pending message content",
                size,
                payload.len(),
            ));
        }
        let content = Bytes::copy_from_slice(&payload[..size]);
        payload.advance(size);

        messages.push(PendingMessage {
            source,
            message_id,
            message_type,
            content,
        });
    }
    Ok(messages)
}
