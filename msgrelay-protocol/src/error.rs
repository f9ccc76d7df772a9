//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
///
/// None of these are ever reflected to a peer in detail: the server maps every
/// decode failure to a general error response.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated {what}: need {needed} bytes, got {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unknown request code: {0}")]
    UnknownRequestCode(u16),

    #[error("unknown response code: {0}")]
    UnknownResponseCode(u16),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: u32 },

    #[error("invalid client id length: {0} bytes")]
    InvalidClientId(usize),

    #[error("invalid public key length: {0} bytes")]
    InvalidPublicKey(usize),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl ProtocolError {
    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        ProtocolError::Truncated {
            what,
            needed,
            available,
        }
    }
}
