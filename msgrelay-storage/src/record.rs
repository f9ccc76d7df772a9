//! Stored records.

use crate::error::StorageError;
use bytes::Bytes;
use msgrelay_protocol::{ClientId, MessageType, PublicKey, NAME_SIZE};
use serde::{Deserialize, Serialize};

/// A registered client. Created once, never mutated or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub public_key: PublicKey,
}

impl ClientRecord {
    pub fn new(id: ClientId, name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id,
            name: name.into(),
            public_key,
        }
    }

    /// Checks the invariants the store relies on. The id and key lengths are
    /// guaranteed by their types.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.name.is_empty() {
            return Err(StorageError::InvalidRecord("empty client name".to_string()));
        }
        if self.name.len() >= NAME_SIZE {
            return Err(StorageError::InvalidRecord(format!(
                "client name is {} bytes (max {})",
                self.name.len(),
                NAME_SIZE - 1
            )));
        }
        Ok(())
    }
}

/// A message submitted for queuing, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub source: ClientId,
    pub target: ClientId,
    pub message_type: MessageType,
    pub content: Bytes,
}

impl NewMessage {
    pub fn validate(&self) -> Result<(), StorageError> {
        if !self.message_type.is_valid() {
            return Err(StorageError::InvalidRecord(
                "message type must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A message waiting in its target's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: u32,
    pub source: ClientId,
    pub target: ClientId,
    pub message_type: MessageType,
    #[serde(with = "hex_bytes")]
    pub content: Bytes,
}

impl QueuedMessage {
    pub(crate) fn from_new(id: u32, message: NewMessage) -> Self {
        Self {
            id,
            source: message.source,
            target: message.target,
            message_type: message.message_type,
            content: message.content,
        }
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
