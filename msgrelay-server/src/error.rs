//! Server error types.

use msgrelay_protocol::{ClientId, ProtocolError};
use msgrelay_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Connection-level and startup errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed after {received} of {expected} content bytes")]
    ClosedMidRequest { received: usize, expected: usize },

    #[error("no request received within {0:?}")]
    IdleTimeout(Duration),

    #[error("timed out after {0:?} waiting for message content")]
    ReadTimeout(Duration),

    #[error("peer did not take the response within {0:?}")]
    WriteTimeout(Duration),

    #[error("message content of {size} bytes exceeds limit of {max}")]
    ContentTooLarge { size: u32, max: u32 },
}

impl ServerError {
    /// Returns whether the peer can no longer be written to.
    ///
    /// Transport failures end the connection without a response; every other
    /// error is answered with a general error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_) | ServerError::IdleTimeout(_) | ServerError::WriteTimeout(_)
        )
    }

    /// Short label used for the error metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "transport",
            ServerError::Protocol(_) => "malformed",
            ServerError::ClosedMidRequest { .. } => "closed_mid_request",
            ServerError::IdleTimeout(_) => "idle_timeout",
            ServerError::ReadTimeout(_) => "read_timeout",
            ServerError::WriteTimeout(_) => "write_timeout",
            ServerError::ContentTooLarge { .. } => "content_too_large",
        }
    }
}

/// A request handler failure. Always answered with a general error; the
/// detail is only logged.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl HandlerError {
    pub fn reason(&self) -> &'static str {
        match self {
            HandlerError::Malformed(_) => "malformed",
            HandlerError::Invalid(_) => "invalid",
            HandlerError::UnknownClient(_) => "unknown_client",
            HandlerError::Storage(_) => "store",
            HandlerError::Task(_) => "internal",
        }
    }
}
