//! Fixed-size request and response headers.
//!
//! Request header (23 bytes):
//!
//! ```text
//! +------------+---------+--------+--------------+
//! | client_id  | version | code   | payload_size |
//! | 16 bytes   | 1 byte  | 2 bytes|   4 bytes    |
//! +------------+---------+--------+--------------+
//! ```
//!
//! Response header (7 bytes):
//!
//! ```text
//! +---------+--------+--------------+
//! | version | code   | payload_size |
//! | 1 byte  | 2 bytes|   4 bytes    |
//! +---------+--------+--------------+
//! ```
//!
//! All integers are little-endian.

use crate::error::ProtocolError;
use crate::types::{ClientId, RequestCode, ResponseCode};
use crate::{CLIENT_ID_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the request header in bytes (16+1+2+4 = 23).
pub const REQUEST_HEADER_SIZE: usize = CLIENT_ID_SIZE + 7;

/// Size of the response header in bytes (1+2+4 = 7).
pub const RESPONSE_HEADER_SIZE: usize = 7;

/// Header prefixed to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Identifier of the requesting client (ignored for registration).
    pub client_id: ClientId,
    /// Client protocol version. Accepted as-is.
    pub version: u8,
    /// Raw request code; unknown codes are resolved by the dispatcher.
    pub code: u16,
    /// Declared payload size. Informational only.
    pub payload_size: u32,
}

impl RequestHeader {
    pub fn new(client_id: ClientId, code: RequestCode, payload_size: u32) -> Self {
        Self {
            client_id,
            version: PROTOCOL_VERSION,
            code: code.as_u16(),
            payload_size,
        }
    }

    /// Decodes a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(ProtocolError::truncated(
                "request header",
                REQUEST_HEADER_SIZE,
                buf.len(),
            ));
        }

        let client_id = ClientId::from_slice(&buf[..CLIENT_ID_SIZE])?;
        let mut rest = &buf[CLIENT_ID_SIZE..REQUEST_HEADER_SIZE];
        let version = rest.get_u8();
        let code = rest.get_u16_le();
        let payload_size = rest.get_u32_le();

        Ok(Self {
            client_id,
            version,
            code,
            payload_size,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u8(self.version);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.payload_size);
    }

    /// Resolves the raw code into a known request code.
    pub fn request_code(&self) -> Result<RequestCode, ProtocolError> {
        RequestCode::try_from(self.code)
    }
}

/// Header prefixed to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub fn new(code: ResponseCode, payload_size: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            code: code.as_u16(),
            payload_size,
        }
    }

    /// Header of the general error response: code 9000, empty payload.
    pub fn general_error() -> Self {
        Self::new(ResponseCode::GeneralError, 0)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(ProtocolError::truncated(
                "response header",
                RESPONSE_HEADER_SIZE,
                buf.len(),
            ));
        }

        let mut rest = &buf[..RESPONSE_HEADER_SIZE];
        Ok(Self {
            version: rest.get_u8(),
            code: rest.get_u16_le(),
            payload_size: rest.get_u32_le(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.payload_size);
    }

    pub fn response_code(&self) -> Result<ResponseCode, ProtocolError> {
        ResponseCode::try_from(self.code)
    }
}
