//! Client error types.

use msgrelay_protocol::ResponseCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] msgrelay_protocol::ProtocolError),

    #[error("connection closed before a full response arrived")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    /// The server answered with a general error. It never says why.
    #[error("server returned a general error")]
    GeneralError,

    #[error("unexpected response: expected {expected:?}, got {got:?}")]
    UnexpectedResponse {
        expected: ResponseCode,
        got: ResponseCode,
    },

    #[error("no client id set; register first")]
    NotRegistered,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }
}
