//! Card publish requests.
//!
//! An [`EphemeralCardRequest`] is built unsigned, signed by the owner (and any
//! other required signer), exported in the directory's publish shape and sent.
//! The snapshot bytes are fixed at construction: signing, exporting and
//! importing never re-serialize them, because the directory validates
//! signatures over the exact bytes it receives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::card::{CARD_VERSION, CardSnapshot, card_id_of};
use crate::clock::unix_now;
use crate::codec;
use crate::error::{Result, SecureChatError};
use crate::keys::IdentityKeyPair;

/// Wire shape of a publish request: `{content_snapshot, signatures}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(with = "codec::b64")]
    pub content_snapshot: Vec<u8>,
    /// Signer id to base64 signature.
    pub signatures: BTreeMap<String, String>,
}

/// Unsigned-then-signed request to publish a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralCardRequest {
    snapshot: CardSnapshot,
    snapshot_bytes: Vec<u8>,
    signatures: BTreeMap<String, Vec<u8>>,
}

impl EphemeralCardRequest {
    /// Build a fresh request stamped with the current time.
    pub fn build(
        identity: &str,
        identity_type: &str,
        public_key_data: &[u8],
        info: Option<BTreeMap<String, String>>,
        custom_fields: Option<BTreeMap<String, String>>,
    ) -> Result<Self> {
        Self::build_with(
            identity,
            identity_type,
            public_key_data,
            info,
            custom_fields,
            None,
            unix_now(),
        )
    }

    /// Build with every snapshot field given explicitly.
    pub fn build_with(
        identity: &str,
        identity_type: &str,
        public_key_data: &[u8],
        info: Option<BTreeMap<String, String>>,
        custom_fields: Option<BTreeMap<String, String>>,
        previous_card_id: Option<String>,
        created_at: i64,
    ) -> Result<Self> {
        if identity.is_empty() {
            return Err(SecureChatError::InvalidRequest(
                "identity must not be empty".into(),
            ));
        }
        if identity_type.is_empty() {
            return Err(SecureChatError::InvalidRequest(
                "identity type must not be empty".into(),
            ));
        }
        if public_key_data.is_empty() {
            return Err(SecureChatError::InvalidRequest(
                "public key data must not be empty".into(),
            ));
        }
        let snapshot = CardSnapshot {
            identity: identity.to_string(),
            identity_type: identity_type.to_string(),
            public_key: public_key_data.to_vec(),
            info: info.unwrap_or_default(),
            data: custom_fields.unwrap_or_default(),
            version: CARD_VERSION.to_string(),
            created_at,
            previous_card_id,
        };
        let snapshot_bytes = snapshot.to_bytes()?;
        Ok(Self {
            snapshot,
            snapshot_bytes,
            signatures: BTreeMap::new(),
        })
    }

    /// Reconstruct a request from previously exported snapshot bytes and signatures.
    pub fn from_parts(
        snapshot_bytes: Vec<u8>,
        signatures: BTreeMap<String, Vec<u8>>,
    ) -> Result<Self> {
        let snapshot = CardSnapshot::from_bytes(&snapshot_bytes)?;
        if snapshot.identity.is_empty() || snapshot.public_key.is_empty() {
            return Err(SecureChatError::InvalidRequest(
                "snapshot lacks identity or public key".into(),
            ));
        }
        Ok(Self {
            snapshot,
            snapshot_bytes,
            signatures,
        })
    }

    pub fn from_publish_request(request: &PublishRequest) -> Result<Self> {
        let signatures = request
            .signatures
            .iter()
            .map(|(signer, sig)| Ok((signer.clone(), codec::decode(sig)?)))
            .collect::<Result<_>>()?;
        Self::from_parts(request.content_snapshot.clone(), signatures)
    }

    pub fn to_publish_request(&self) -> PublishRequest {
        PublishRequest {
            content_snapshot: self.snapshot_bytes.clone(),
            signatures: self
                .signatures
                .iter()
                .map(|(signer, sig)| (signer.clone(), codec::encode(sig)))
                .collect(),
        }
    }

    /// Export as a single base64 string.
    pub fn export(&self) -> Result<String> {
        Ok(codec::encode(serde_json::to_vec(
            &self.to_publish_request(),
        )?))
    }

    /// Inverse of [`export`](Self::export).
    pub fn import(exported: &str) -> Result<Self> {
        let json = codec::decode(exported.trim())?;
        let request: PublishRequest = serde_json::from_slice(&json)?;
        Self::from_publish_request(&request)
    }

    /// Sign the snapshot bytes and record the signature under `signer_id`.
    pub fn sign_with(&mut self, signer_id: &str, key: &IdentityKeyPair) {
        let signature = key.sign(&self.snapshot_bytes);
        self.signatures.insert(signer_id.to_string(), signature);
    }

    /// Whether every signer in `required_signers` has signed.
    pub fn is_publishable(&self, required_signers: &[&str]) -> bool {
        !self.signatures.is_empty()
            && required_signers
                .iter()
                .all(|signer| self.signatures.contains_key(*signer))
    }

    /// Id the directory will assign to the published card.
    pub fn card_id(&self) -> String {
        card_id_of(&self.snapshot_bytes)
    }

    pub const fn snapshot(&self) -> &CardSnapshot {
        &self.snapshot
    }

    pub fn snapshot_bytes(&self) -> &[u8] {
        &self.snapshot_bytes
    }

    pub const fn signatures(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.signatures
    }
}
