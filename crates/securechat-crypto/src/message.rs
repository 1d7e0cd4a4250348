//! Wire messages.

use serde::{Deserialize, Serialize};

use crate::codec;

/// First message of a session: handshake material plus the first ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiationMessage {
    pub initiator_ic_id: String,
    pub initiator_ltc_id: String,
    pub responder_ic_id: String,
    pub responder_ltc_id: String,
    pub responder_otc_id: String,
    /// Initiator's ephemeral X25519 public key.
    #[serde(with = "codec::b64")]
    pub eph: Vec<u8>,
    /// Signature over the ephemeral key by the initiator identity card.
    #[serde(with = "codec::b64")]
    pub eph_sign: Vec<u8>,
    #[serde(with = "codec::b64")]
    pub salt: Vec<u8>,
    pub counter: u64,
    #[serde(with = "codec::b64")]
    pub cipher_text: Vec<u8>,
}

/// Post-handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularMessage {
    pub session_id: String,
    pub counter: u64,
    #[serde(with = "codec::b64")]
    pub cipher_text: Vec<u8>,
}
