//! Directory service collaborator.
//!
//! The directory publishes cards and hands out credential sets. Handing out a
//! one-time card is a reserve-and-consume step: once [`CardDirectory::reserve_credentials`]
//! returns a one-time card, ownership of it has moved to the caller and no
//! other caller can receive it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::card::{Card, CardKind, CardMeta, CardRecord, CardSnapshot, CredentialRecords, card_id_of};
use crate::codec;
use crate::error::{Result, SecureChatError};
use crate::issuer::PublishRequest;
use crate::keys::{IdentityKeyPair, verify_signature};

/// Card directory as seen by the secure chat core.
pub trait CardDirectory: Send + Sync {
    /// Publish a signed card and return the stored record.
    fn publish(&self, kind: CardKind, request: &PublishRequest) -> Result<CardRecord>;

    /// Fetch any card by id.
    fn get_card(&self, card_id: &str) -> Result<Option<CardRecord>>;

    /// Identity card, current long-term card and one freshly reserved one-time
    /// card (absent if the pool is empty) for `identity`.
    fn reserve_credentials(&self, identity: &str) -> Result<CredentialRecords>;

    /// One-time cards still available for `identity`.
    fn one_time_card_count(&self, identity: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
struct IdentityEntry {
    identity_card_id: String,
    long_term_card_id: Option<String>,
    one_time: VecDeque<String>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    cards: HashMap<String, CardRecord>,
    identities: HashMap<String, IdentityEntry>,
}

/// Process-local directory that validates and countersigns published cards.
#[derive(Debug)]
pub struct InMemoryDirectory {
    service_id: String,
    service_key: IdentityKeyPair,
    state: Mutex<DirectoryState>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new("directory")
    }
}

impl InMemoryDirectory {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_key: IdentityKeyPair::generate(),
            state: Mutex::new(DirectoryState::default()),
        }
    }

    /// Signer id and public key clients use to check the directory countersignature.
    pub fn service_verifier(&self) -> (String, [u8; 32]) {
        (self.service_id.clone(), self.service_key.public_bytes())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner_signature_check(
        state: &DirectoryState,
        kind: CardKind,
        card_id: &str,
        snapshot: &CardSnapshot,
        request: &PublishRequest,
    ) -> Result<()> {
        let (signer_id, public_key) = if kind == CardKind::Identity {
            (card_id.to_string(), snapshot.public_key.clone())
        } else {
            let entry = state.identities.get(&snapshot.identity).ok_or_else(|| {
                SecureChatError::Directory(format!(
                    "identity {} has no identity card",
                    snapshot.identity
                ))
            })?;
            let record = state.cards.get(&entry.identity_card_id).ok_or_else(|| {
                SecureChatError::Directory(format!(
                    "identity card {} vanished from directory",
                    entry.identity_card_id
                ))
            })?;
            let identity_card = Card::from_record(record)?;
            (
                identity_card.id().to_string(),
                identity_card.public_key_data().to_vec(),
            )
        };
        let signature = request.signatures.get(&signer_id).ok_or_else(|| {
            SecureChatError::SignatureVerificationFailed(format!(
                "publish request lacks owner signature {signer_id}"
            ))
        })?;
        verify_signature(
            &public_key,
            &request.content_snapshot,
            &codec::decode(signature)?,
        )
    }
}

impl CardDirectory for InMemoryDirectory {
    fn publish(&self, kind: CardKind, request: &PublishRequest) -> Result<CardRecord> {
        let snapshot = CardSnapshot::from_bytes(&request.content_snapshot)?;
        let card_id = card_id_of(&request.content_snapshot);

        let mut state = self.lock();
        if state.cards.contains_key(&card_id) {
            return Err(SecureChatError::Directory(format!(
                "card {card_id} already published"
            )));
        }
        Self::owner_signature_check(&state, kind, &card_id, &snapshot, request)?;

        if kind == CardKind::Identity && state.identities.contains_key(&snapshot.identity) {
            return Err(SecureChatError::Directory(format!(
                "identity {} is already registered",
                snapshot.identity
            )));
        }

        let mut signatures = request.signatures.clone();
        signatures.insert(
            self.service_id.clone(),
            codec::encode(self.service_key.sign(&request.content_snapshot)),
        );
        let record = CardRecord {
            id: card_id.clone(),
            content_snapshot: request.content_snapshot.clone(),
            meta: CardMeta {
                signatures,
                created_at: snapshot.created_at,
                version: snapshot.version.clone(),
            },
        };
        state.cards.insert(card_id.clone(), record.clone());

        let entry = state.identities.entry(snapshot.identity.clone()).or_default();
        match kind {
            CardKind::Identity => entry.identity_card_id.clone_from(&card_id),
            CardKind::LongTerm => entry.long_term_card_id = Some(card_id.clone()),
            CardKind::OneTime => entry.one_time.push_back(card_id.clone()),
        }
        info!(card_id = %card_id, identity = %snapshot.identity, ?kind, "Published card");
        Ok(record)
    }

    fn get_card(&self, card_id: &str) -> Result<Option<CardRecord>> {
        Ok(self.lock().cards.get(card_id).cloned())
    }

    fn reserve_credentials(&self, identity: &str) -> Result<CredentialRecords> {
        let mut state = self.lock();
        let state = &mut *state;
        let entry = state.identities.get_mut(identity).ok_or_else(|| {
            SecureChatError::Directory(format!("unknown identity {identity}"))
        })?;
        let long_term_id = entry.long_term_card_id.clone().ok_or_else(|| {
            SecureChatError::Directory(format!("{identity} has no long-term card"))
        })?;
        let one_time_id = entry.one_time.pop_front();
        debug!(identity, one_time = ?one_time_id, "Reserved credentials");

        let fetch = |id: &str| {
            state.cards.get(id).cloned().ok_or_else(|| {
                SecureChatError::Directory(format!("card {id} vanished from directory"))
            })
        };
        Ok(CredentialRecords {
            identity_card: fetch(&entry.identity_card_id)?,
            long_time_card: fetch(&long_term_id)?,
            one_time_card: one_time_id.as_deref().map(fetch).transpose()?,
        })
    }

    fn one_time_card_count(&self, identity: &str) -> Result<usize> {
        Ok(self
            .lock()
            .identities
            .get(identity)
            .map_or(0, |entry| entry.one_time.len()))
    }
}
