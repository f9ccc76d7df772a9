//! # msgrelay-protocol
//!
//! Wire protocol implementation for msgrelay.
//!
//! This crate provides:
//! - Fixed-layout little-endian request and response headers
//! - Payload codecs for every request and response code
//! - Chunked, zero-padded response framing
//! - Error types for malformed input

pub mod codec;
pub mod error;
pub mod header;
pub mod request;
pub mod response;
pub mod types;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use header::{RequestHeader, ResponseHeader, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE};
pub use request::{PublicKeyRequest, RegisterRequest, Request, RequestBody, SendMessageRequest};
pub use response::{PendingMessage, Response, UserEntry};
pub use types::{ClientId, MessageType, PublicKey, RequestCode, ResponseCode};

/// Protocol version stamped on every response.
pub const PROTOCOL_VERSION: u8 = 2;

/// Default port for the relay server.
pub const DEFAULT_PORT: u16 = 1357;

/// Size of a single network chunk. Responses are padded to a multiple of it.
pub const CHUNK_SIZE: usize = 1024;

/// Size of a client identifier in bytes.
pub const CLIENT_ID_SIZE: usize = 16;

/// Size of the zero-padded name field in bytes.
pub const NAME_SIZE: usize = 255;

/// Size of a public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 160;

/// Size of a message identifier in bytes.
pub const MESSAGE_ID_SIZE: usize = 4;

/// Default cap on a single message's content (16 MiB).
pub const DEFAULT_MAX_CONTENT_SIZE: u32 = 16 * 1024 * 1024;
