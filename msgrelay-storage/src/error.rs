//! Storage error types.

use msgrelay_protocol::ClientId;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client name already registered: {0}")]
    NameTaken(String),

    #[error("client id already registered: {0}")]
    DuplicateClient(ClientId),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("message id space exhausted")]
    MessageIdsExhausted,

    #[error("data corruption: {0}")]
    Corruption(String),
}
