//! Encoder and decoder for requests and responses, plus chunk framing.
//!
//! Responses travel in fixed [`CHUNK_SIZE`] blocks; the last block is
//! zero-padded. Receivers use the header's payload size, never the chunk
//! boundaries, to find the end of the payload.

use crate::error::ProtocolError;
use crate::header::ResponseHeader;
use crate::request::Request;
use crate::response::Response;
use crate::CHUNK_SIZE;
use bytes::{BufMut, BytesMut};

/// Writes `data` followed by NUL bytes up to `width`.
pub(crate) fn put_padded(buf: &mut BytesMut, data: &[u8], width: usize) {
    debug_assert!(data.len() <= width);
    buf.put_slice(data);
    buf.put_bytes(0, width - data.len());
}

/// Reads a NUL-padded field, keeping everything before the first NUL.
pub(crate) fn get_padded_str(field: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8(what))
}

/// Encodes requests and responses.
pub struct Encoder;

impl Encoder {
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        request.encode()
    }

    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        response.encode()
    }

    /// Zero-pads `frame` up to the next multiple of [`CHUNK_SIZE`].
    pub fn pad_to_chunks(frame: BytesMut) -> BytesMut {
        Self::pad_to(frame, CHUNK_SIZE)
    }

    pub fn pad_to(mut frame: BytesMut, chunk_size: usize) -> BytesMut {
        let remainder = frame.len() % chunk_size;
        if remainder != 0 || frame.is_empty() {
            let padding = chunk_size - remainder;
            frame.put_bytes(0, padding);
        }
        frame
    }
}

/// Accumulates response bytes until a full response has arrived.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode a response from the buffered bytes.
    pub fn decode_response(&mut self) -> Result<Option<(ResponseHeader, Response)>, ProtocolError> {
        Response::decode(&self.buffer)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
