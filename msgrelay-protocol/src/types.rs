//! Identifier, key and code types shared by requests and responses.

use crate::error::ProtocolError;
use crate::{CLIENT_ID_SIZE, PUBLIC_KEY_SIZE};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 16-byte server-assigned client identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClientId([u8; CLIENT_ID_SIZE]);

impl ClientId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; CLIENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds an identifier from a slice that must be exactly 16 bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; CLIENT_ID_SIZE] = slice
            .try_into()
            .map_err(|_| ProtocolError::InvalidClientId(slice.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

impl FromStr for ClientId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An opaque 160-byte public key. Stored and forwarded, never interpreted.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(Box<[u8; PUBLIC_KEY_SIZE]>);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    /// Builds a key from a slice that must be exactly 160 bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = slice
            .try_into()
            .map_err(|_| ProtocolError::InvalidPublicKey(slice.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0.as_slice()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// One-byte message type tag. Zero is reserved and never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const SYMMETRIC_KEY_REQUEST: Self = Self(1);
    pub const SYMMETRIC_KEY_SEND: Self = Self(2);
    pub const TEXT: Self = Self(3);
    pub const FILE: Self = Self(4);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Human-readable label for the well-known types.
    pub fn label(&self) -> &'static str {
        match self.0 {
            1 => "symmetric key request",
            2 => "symmetric key",
            3 => "text",
            4 => "file",
            0 => "invalid",
            _ => "custom",
        }
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Request codes understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestCode {
    Register = 600,
    UsersList = 601,
    PublicKey = 602,
    SendMessage = 603,
    PullPending = 604,
}

impl RequestCode {
    pub const ALL: [RequestCode; 5] = [
        RequestCode::Register,
        RequestCode::UsersList,
        RequestCode::PublicKey,
        RequestCode::SendMessage,
        RequestCode::PullPending,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Stable name used in logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            RequestCode::Register => "REGISTER",
            RequestCode::UsersList => "USERS_LIST",
            RequestCode::PublicKey => "PUBLIC_KEY",
            RequestCode::SendMessage => "SEND_MESSAGE",
            RequestCode::PullPending => "PULL_PENDING",
        }
    }
}

impl TryFrom<u16> for RequestCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            600 => Ok(RequestCode::Register),
            601 => Ok(RequestCode::UsersList),
            602 => Ok(RequestCode::PublicKey),
            603 => Ok(RequestCode::SendMessage),
            604 => Ok(RequestCode::PullPending),
            other => Err(ProtocolError::UnknownRequestCode(other)),
        }
    }
}

/// Response codes sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseCode {
    Registered = 2100,
    UsersList = 2101,
    PublicKey = 2102,
    MessageSent = 2103,
    PendingMessages = 2104,
    GeneralError = 9000,
}

impl ResponseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            2100 => Ok(ResponseCode::Registered),
            2101 => Ok(ResponseCode::UsersList),
            2102 => Ok(ResponseCode::PublicKey),
            2103 => Ok(ResponseCode::MessageSent),
            2104 => Ok(ResponseCode::PendingMessages),
            9000 => Ok(ResponseCode::GeneralError),
            other => Err(ProtocolError::UnknownResponseCode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_hex_roundtrip() {
        let id = ClientId::generate();
        let parsed: ClientId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_hex().len(), 32);
    }

    #[test]
    fn test_client_id_wrong_length() {
        let result = ClientId::from_slice(&[0u8; 15]);
        assert!(matches!(result, Err(ProtocolError::InvalidClientId(15))));

        let result: Result<ClientId, _> = "abcd".parse();
        assert!(matches!(result, Err(ProtocolError::InvalidClientId(2))));
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn test_public_key_length() {
        assert!(PublicKey::from_slice(&[7u8; PUBLIC_KEY_SIZE]).is_ok());
        assert!(matches!(
            PublicKey::from_slice(&[7u8; 159]),
            Err(ProtocolError::InvalidPublicKey(159))
        ));
    }

    #[test]
    fn test_serde_as_hex() {
        let id = ClientId::from_bytes([0xab; CLIENT_ID_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));

        let key = PublicKey::from_bytes([1u8; PUBLIC_KEY_SIZE]);
        let json = serde_json::to_string(&key).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_request_codes() {
        for code in RequestCode::ALL {
            assert_eq!(RequestCode::try_from(code.as_u16()).unwrap(), code);
        }
        assert!(matches!(
            RequestCode::try_from(605),
            Err(ProtocolError::UnknownRequestCode(605))
        ));
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(ResponseCode::try_from(9000).unwrap(), ResponseCode::GeneralError);
        assert_eq!(ResponseCode::MessageSent.as_u16(), 2103);
        assert!(ResponseCode::try_from(2105).is_err());
    }

    #[test]
    fn test_message_type_validity() {
        assert!(!MessageType(0).is_valid());
        assert!(MessageType(1).is_valid());
        assert!(MessageType(255).is_valid());
        assert_eq!(MessageType::TEXT.label(), "text");
    }
}
