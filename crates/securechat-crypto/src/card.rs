//! Signed card records published to the directory.
//!
//! A card binds an identity to a public key. Its id is the SHA-256 digest of
//! the canonical snapshot bytes, and signatures are made over exactly those
//! bytes, so a [`Card`] keeps the bytes it was decoded from instead of
//! re-serializing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{Result, SecureChatError};

/// Snapshot format version written into every new card.
pub const CARD_VERSION: &str = "1.0";

/// Role a card plays in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    /// Self-signed Ed25519 key that signs the identity's other cards.
    Identity,
    /// Medium-lived X25519 key, rotated periodically.
    LongTerm,
    /// Single-use X25519 pre-key.
    OneTime,
}

/// Canonical signed content of a card.
///
/// Field order is the serialization order and must not change: the card id
/// and every signature cover the serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub identity: String,
    pub identity_type: String,
    #[serde(with = "codec::b64")]
    pub public_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    pub version: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_card_id: Option<String>,
}

impl CardSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Card id: lowercase hex SHA-256 of the snapshot bytes.
pub fn card_id_of(snapshot_bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(snapshot_bytes))
}

/// Card as exchanged with the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: String,
    #[serde(with = "codec::b64")]
    pub content_snapshot: Vec<u8>,
    pub meta: CardMeta,
}

/// Directory-side metadata of a card record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMeta {
    /// Signer id to base64 signature.
    pub signatures: BTreeMap<String, String>,
    pub created_at: i64,
    pub version: String,
}

/// Immutable, decoded card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    id: String,
    snapshot: CardSnapshot,
    snapshot_bytes: Vec<u8>,
    signatures: BTreeMap<String, Vec<u8>>,
}

impl Card {
    /// Decode a directory record, checking that its id is the snapshot digest.
    ///
    /// Signatures are decoded but not verified; see
    /// [`CardValidator`](crate::validator::CardValidator).
    pub fn from_record(record: &CardRecord) -> Result<Self> {
        let actual = card_id_of(&record.content_snapshot);
        if actual != record.id {
            return Err(SecureChatError::CardIdMismatch {
                claimed: record.id.clone(),
                actual,
            });
        }
        let snapshot = CardSnapshot::from_bytes(&record.content_snapshot)?;
        let signatures = record
            .meta
            .signatures
            .iter()
            .map(|(signer, sig)| Ok((signer.clone(), codec::decode(sig)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            id: actual,
            snapshot,
            snapshot_bytes: record.content_snapshot.clone(),
            signatures,
        })
    }

    pub fn to_record(&self) -> CardRecord {
        CardRecord {
            id: self.id.clone(),
            content_snapshot: self.snapshot_bytes.clone(),
            meta: CardMeta {
                signatures: self
                    .signatures
                    .iter()
                    .map(|(signer, sig)| (signer.clone(), codec::encode(sig)))
                    .collect(),
                created_at: self.snapshot.created_at,
                version: self.snapshot.version.clone(),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &str {
        &self.snapshot.identity
    }

    pub fn identity_type(&self) -> &str {
        &self.snapshot.identity_type
    }

    pub fn public_key_data(&self) -> &[u8] {
        &self.snapshot.public_key
    }

    pub fn created_at(&self) -> i64 {
        self.snapshot.created_at
    }

    pub fn previous_card_id(&self) -> Option<&str> {
        self.snapshot.previous_card_id.as_deref()
    }

    pub const fn snapshot(&self) -> &CardSnapshot {
        &self.snapshot
    }

    /// The exact bytes the id and signatures cover.
    pub fn snapshot_bytes(&self) -> &[u8] {
        &self.snapshot_bytes
    }

    pub const fn signatures(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.signatures
    }

    pub fn signature(&self, signer_id: &str) -> Option<&[u8]> {
        self.signatures.get(signer_id).map(Vec::as_slice)
    }
}

/// Credential-set response as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecords {
    pub identity_card: CardRecord,
    pub long_time_card: CardRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_card: Option<CardRecord>,
}

/// Decoded credentials needed to open a session with one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub identity_card: Card,
    pub long_term_card: Card,
    /// `None` when the recipient's one-time pool is exhausted.
    pub one_time_card: Option<Card>,
}

impl CredentialSet {
    pub fn from_records(records: &CredentialRecords) -> Result<Self> {
        Ok(Self {
            identity_card: Card::from_record(&records.identity_card)?,
            long_term_card: Card::from_record(&records.long_time_card)?,
            one_time_card: records
                .one_time_card
                .as_ref()
                .map(Card::from_record)
                .transpose()?,
        })
    }
}
