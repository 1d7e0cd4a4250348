//! Per-conversation session state.
//!
//! A session is either the initiator's or the responder's view of one
//! handshake. Both variants share [`SessionCore`]: the derived keys, one chain
//! per direction and the message counters. The serialized field names are the
//! ones registered in [`schema`](crate::schema); the variant is recovered from
//! the field set, not from a tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec;
use crate::error::{Result, SecureChatError};
use crate::exchange::SessionSecrets;
use crate::ratchet::ChainKey;
use crate::schema::{self, RecordShape, SessionRecord};

/// Handshake progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Handshake sent or received, no regular message exchanged yet.
    Initiating,
    /// At least one regular message went through.
    Established,
}

/// State shared by both session variants.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionCore {
    pub session_id: String,
    pub local_identity: String,
    pub remote_identity: String,
    #[serde(with = "codec::b64_key")]
    root_key: [u8; 32],
    #[serde(with = "codec::b64_key")]
    sending_chain_key: [u8; 32],
    #[serde(with = "codec::b64_key")]
    receiving_chain_key: [u8; 32],
    pub sent_count: u64,
    pub received_count: u64,
    #[zeroize(skip)]
    pub phase: SessionPhase,
    pub created_at: i64,
    /// Absent in records written before session expiry existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("session_id", &self.session_id)
            .field("local_identity", &self.local_identity)
            .field("remote_identity", &self.remote_identity)
            .field("sent_count", &self.sent_count)
            .field("received_count", &self.received_count)
            .field("phase", &self.phase)
            .field("keys", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl SessionCore {
    pub fn new(
        session_id: String,
        local_identity: &str,
        remote_identity: &str,
        secrets: &SessionSecrets,
        is_initiator: bool,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Self {
        let (sending, receiving) = if is_initiator {
            (secrets.initiator_chain, secrets.responder_chain)
        } else {
            (secrets.responder_chain, secrets.initiator_chain)
        };
        Self {
            session_id,
            local_identity: local_identity.to_string(),
            remote_identity: remote_identity.to_string(),
            root_key: secrets.root_key,
            sending_chain_key: sending,
            receiving_chain_key: receiving,
            sent_count: 0,
            received_count: 0,
            phase: SessionPhase::Initiating,
            created_at,
            expires_at,
        }
    }

    pub const fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    /// Current sending chain, positioned at the next outgoing counter.
    pub const fn sending_chain(&self) -> ChainKey {
        ChainKey::new(self.sending_chain_key, self.sent_count)
    }

    /// Current receiving chain, positioned at the next expected counter.
    pub const fn receiving_chain(&self) -> ChainKey {
        ChainKey::new(self.receiving_chain_key, self.received_count)
    }

    fn associated_data(&self, counter: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.session_id.len() + 8);
        aad.extend_from_slice(self.session_id.as_bytes());
        aad.extend_from_slice(&counter.to_be_bytes());
        aad
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Initiator's view: it consumed the responder's one-time card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatorState {
    #[serde(flatten)]
    pub core: SessionCore,
    pub initiator_ltc_id: String,
    pub responder_ltc_id: String,
    pub responder_otc_id: String,
    #[serde(with = "codec::b64")]
    pub ephemeral_public: Vec<u8>,
}

/// Responder's view: it offered the one-time card the initiator consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderState {
    #[serde(flatten)]
    pub core: SessionCore,
    pub initiator_ltc_id: String,
    pub responder_ltc_id: String,
    pub consumed_otc_id: String,
    #[serde(with = "codec::b64")]
    pub initiator_ephemeral_public: Vec<u8>,
}

/// Either side of a session.
#[derive(Debug, Clone)]
pub enum SessionState {
    Initiator(InitiatorState),
    Responder(ResponderState),
}

impl SessionState {
    pub const fn core(&self) -> &SessionCore {
        match self {
            Self::Initiator(state) => &state.core,
            Self::Responder(state) => &state.core,
        }
    }

    const fn core_mut(&mut self) -> &mut SessionCore {
        match self {
            Self::Initiator(state) => &mut state.core,
            Self::Responder(state) => &mut state.core,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.core().session_id
    }

    pub const fn phase(&self) -> SessionPhase {
        self.core().phase
    }

    pub const fn is_initiator(&self) -> bool {
        matches!(self, Self::Initiator(_))
    }

    pub fn mark_established(&mut self) {
        self.core_mut().phase = SessionPhase::Established;
    }

    /// Encrypt with the next sending message key and advance the chain.
    ///
    /// Returns the counter the message was sealed under.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
        let core = self.core_mut();
        let mut chain = core.sending_chain();
        let message_key = chain.advance()?;
        let counter = message_key.index();
        let ciphertext = message_key.seal(plaintext, &core.associated_data(counter))?;

        core.sending_chain_key = *chain.key_bytes();
        core.sent_count = chain.index();
        debug!(session_id = %core.session_id, counter, "Advanced sending chain");
        Ok((counter, ciphertext))
    }

    /// Decrypt the message sealed under `counter`.
    ///
    /// Works on a copy of the receiving chain: the state only changes when the
    /// ciphertext authenticates, so a failed attempt can be retried.
    pub fn decrypt(&mut self, counter: u64, ciphertext: &[u8], max_skip: u64) -> Result<Vec<u8>> {
        let core = self.core_mut();
        let mut chain = core.receiving_chain();
        chain.skip_to(counter, max_skip)?;
        let message_key = chain.advance()?;
        let plaintext = message_key.open(ciphertext, &core.associated_data(counter))?;

        core.receiving_chain_key = *chain.key_bytes();
        core.received_count = chain.index();
        debug!(session_id = %core.session_id, counter, "Advanced receiving chain");
        Ok(plaintext)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            Self::Initiator(state) => serde_json::to_string(state)?,
            Self::Responder(state) => serde_json::to_string(state)?,
        })
    }

    /// Decode a stored blob, recovering the variant from its field set.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        match schema::decode_record(value)? {
            SessionRecord::InitiatorState(state) => Ok(Self::Initiator(state)),
            SessionRecord::ResponderState(state) => Ok(Self::Responder(state)),
            other => Err(SecureChatError::UnclassifiableRecord(format!(
                "expected session state, found {:?}",
                RecordShape::from(&other)
            ))),
        }
    }
}
