//! Base64 helpers for byte fields in JSON records.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::Result;

pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    BASE64.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(text)?)
}

/// Decode into a fixed 32-byte array.
pub fn decode_key(text: &str) -> Result<[u8; 32]> {
    let bytes = decode(text)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        crate::SecureChatError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
    })
}

/// `#[serde(with = "codec::b64")]` for `Vec<u8>` fields.
pub mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::decode(&text).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "codec::b64_key")]` for `[u8; 32]` fields.
pub mod b64_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        super::decode_key(&text).map_err(serde::de::Error::custom)
    }
}
