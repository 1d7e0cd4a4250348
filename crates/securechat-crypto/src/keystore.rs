//! Private key material of one local identity.
//!
//! Keys live in the [`UserDataStore`] under three buckets per identity:
//!
//! - `meta::<identity>`: identity key, identity card id, current long-term card
//! - `ltc::<identity>`: long-term agreement keys by card id
//! - `otc::<identity>`: one-time agreement keys by card id
//!
//! Taking a one-time key replaces the secret with a consumed marker, so a
//! second handshake against the same card is detected as reuse instead of
//! looking like an unknown card. Markers are dropped by
//! [`LocalKeyStore::prune_consumed_one_time_keys`]; after that a replay is
//! reported as an unknown card, which is still rejected.

use std::sync::Arc;

use securechat_core::UserDataStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::codec;
use crate::error::{Result, SecureChatError};
use crate::keys::{AgreementKeyPair, IdentityKeyPair};

const IDENTITY_KEY: &str = "identity_key";
const IDENTITY_CARD_ID: &str = "identity_card_id";
const CURRENT_LONG_TERM: &str = "current_long_term";

/// Long-term card currently published for this identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentLongTerm {
    pub card_id: String,
    pub created_at: i64,
}

#[derive(Serialize, Deserialize)]
struct LongTermEntry {
    secret: String,
    created_at: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum OneTimeEntry {
    Available { secret: String },
    Consumed { consumed_at: i64 },
}

#[derive(Clone)]
pub struct LocalKeyStore {
    store: Arc<UserDataStore>,
    identity: String,
}

impl std::fmt::Debug for LocalKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyStore")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LocalKeyStore {
    pub fn new(store: Arc<UserDataStore>, identity: impl Into<String>) -> Self {
        Self {
            store,
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn meta_bucket(&self) -> String {
        format!("meta::{}", self.identity)
    }

    fn long_term_bucket(&self) -> String {
        format!("ltc::{}", self.identity)
    }

    fn one_time_bucket(&self) -> String {
        format!("otc::{}", self.identity)
    }

    pub fn identity_key(&self) -> Result<Option<IdentityKeyPair>> {
        let Some(encoded) = self.store.get_data(&self.meta_bucket(), IDENTITY_KEY) else {
            return Ok(None);
        };
        let encoded = Zeroizing::new(encoded);
        let secret = Zeroizing::new(codec::decode(&encoded)?);
        IdentityKeyPair::from_secret_bytes(&secret).map(Some)
    }

    pub fn save_identity_key(&self, key: &IdentityKeyPair) {
        let encoded = Zeroizing::new(codec::encode(key.secret_bytes().as_slice()));
        self.store.add_data(&self.meta_bucket(), IDENTITY_KEY, &encoded);
    }

    pub fn identity_card_id(&self) -> Option<String> {
        self.store.get_data(&self.meta_bucket(), IDENTITY_CARD_ID)
    }

    pub fn set_identity_card_id(&self, card_id: &str) {
        self.store.add_data(&self.meta_bucket(), IDENTITY_CARD_ID, card_id);
    }

    /// Store a long-term key under its card id. It does not become current
    /// until [`set_current_long_term`](Self::set_current_long_term).
    pub fn save_long_term_key(&self, card_id: &str, key: &AgreementKeyPair, created_at: i64) -> Result<()> {
        let entry = LongTermEntry {
            secret: codec::encode(key.secret_bytes().as_slice()),
            created_at,
        };
        let entry = Zeroizing::new(serde_json::to_string(&entry)?);
        self.store.add_data(&self.long_term_bucket(), card_id, &entry);
        debug!(identity = %self.identity, card_id, "Stored long-term key");
        Ok(())
    }

    /// Point new sessions at the long-term card `card_id`.
    pub fn set_current_long_term(&self, card_id: &str, created_at: i64) -> Result<()> {
        let current = serde_json::to_string(&CurrentLongTerm {
            card_id: card_id.to_string(),
            created_at,
        })?;
        self.store.add_data(&self.meta_bucket(), CURRENT_LONG_TERM, &current);
        Ok(())
    }

    pub fn current_long_term(&self) -> Result<Option<CurrentLongTerm>> {
        self.store
            .get_data(&self.meta_bucket(), CURRENT_LONG_TERM)
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }

    /// Long-term key for `card_id`. Older keys stay available so sessions
    /// initiated against a previous card can still be answered.
    pub fn long_term_key(&self, card_id: &str) -> Result<AgreementKeyPair> {
        let json = self
            .store
            .get_data(&self.long_term_bucket(), card_id)
            .map(Zeroizing::new)
            .ok_or_else(|| {
                SecureChatError::MissingLocalKeys(format!(
                    "no long-term key for card {card_id}"
                ))
            })?;
        let entry: LongTermEntry = serde_json::from_str(&json)?;
        let secret = Zeroizing::new(codec::decode(&entry.secret)?);
        AgreementKeyPair::from_secret_bytes(&secret)
    }

    pub fn save_one_time_key(&self, card_id: &str, key: &AgreementKeyPair) -> Result<()> {
        let entry = OneTimeEntry::Available {
            secret: codec::encode(key.secret_bytes().as_slice()),
        };
        let json = Zeroizing::new(serde_json::to_string(&entry)?);
        self.store.add_data(&self.one_time_bucket(), card_id, &json);
        Ok(())
    }

    fn decode_available(card_id: &str, json: Option<&String>) -> Result<AgreementKeyPair> {
        let Some(json) = json else {
            return Err(SecureChatError::UnknownOneTimeCard {
                card_id: card_id.to_string(),
            });
        };
        match serde_json::from_str::<OneTimeEntry>(json)? {
            OneTimeEntry::Available { secret } => {
                let secret = Zeroizing::new(secret);
                let bytes = Zeroizing::new(codec::decode(&secret)?);
                AgreementKeyPair::from_secret_bytes(&bytes)
            }
            OneTimeEntry::Consumed { .. } => Err(SecureChatError::OneTimeCardReused {
                card_id: card_id.to_string(),
            }),
        }
    }

    /// Read a one-time key without consuming it.
    pub fn one_time_key(&self, card_id: &str) -> Result<AgreementKeyPair> {
        let json = self.store.get_data(&self.one_time_bucket(), card_id);
        Self::decode_available(card_id, json.as_ref())
    }

    /// Consume a one-time key.
    ///
    /// The check and the consumed marker happen under the bucket's write lock,
    /// so of two concurrent takes of the same id exactly one succeeds.
    pub fn take_one_time_key(&self, card_id: &str, now: i64) -> Result<AgreementKeyPair> {
        let result = self.store.update(&self.one_time_bucket(), |entries| {
            let key = Self::decode_available(card_id, entries.get(card_id))?;
            let marker = serde_json::to_string(&OneTimeEntry::Consumed { consumed_at: now })?;
            entries.insert(card_id.to_string(), marker);
            Ok(key)
        });
        match &result {
            Ok(_) => debug!(identity = %self.identity, card_id, "Consumed one-time key"),
            Err(e) => warn!(identity = %self.identity, card_id, error = %e, "One-time key unavailable"),
        }
        result
    }

    /// One-time keys not yet consumed.
    pub fn one_time_key_count(&self) -> usize {
        self.store
            .get_all_data(&self.one_time_bucket())
            .snapshot()
            .values()
            .filter(|json| {
                matches!(
                    serde_json::from_str::<OneTimeEntry>(json),
                    Ok(OneTimeEntry::Available { .. })
                )
            })
            .count()
    }

    /// Drop every key of this identity.
    /// Drop consumed markers older than `before`. Returns how many went.
    pub fn prune_consumed_one_time_keys(&self, before: i64) -> usize {
        let pruned = self.store.update(&self.one_time_bucket(), |entries| {
            let len = entries.len();
            entries.retain(|_, json| {
                !matches!(
                    serde_json::from_str::<OneTimeEntry>(json),
                    Ok(OneTimeEntry::Consumed { consumed_at }) if consumed_at < before
                )
            });
            len - entries.len()
        });
        if pruned > 0 {
            debug!(identity = %self.identity, pruned, "Pruned consumed one-time markers");
        }
        pruned
    }

    pub fn remove_all(&self) {
        for bucket in [
            self.meta_bucket(),
            self.long_term_bucket(),
            self.one_time_bucket(),
        ] {
            self.store.remove_storage(&bucket);
        }
    }
}
