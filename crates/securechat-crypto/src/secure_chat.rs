//! Secure chat orchestrator.
//!
//! [`SecureChat`] binds one local identity to a card directory and a user data
//! store. It publishes the identity's cards, opens sessions against remote
//! credential sets, answers incoming handshakes and ratchets every message.
//!
//! Store layout for local identity `L`, in addition to the key buckets of
//! [`LocalKeyStore`]:
//!
//! - `sessions::L`: current session state per remote identity
//! - `retired::L`: ids of superseded sessions, so late traffic for them is
//!   reported as superseded rather than unknown
//!
//! Every read-ratchet-write cycle for one remote runs under that remote's
//! mutex. Operations on different remotes proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use securechat_core::{Config, UserDataStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::card::{Card, CardKind, CredentialSet};
use crate::clock::{Clock, SystemClock};
use crate::directory::CardDirectory;
use crate::error::{Result, SecureChatError};
use crate::exchange::{self, InitiatorHandshake, constant_time_str_eq, ephemeral_signing_data, session_id_of};
use crate::issuer::EphemeralCardRequest;
use crate::keys::{AgreementKeyPair, IdentityKeyPair, verify_signature};
use crate::keystore::LocalKeyStore;
use crate::message::{InitiationMessage, RegularMessage};
use crate::schema::{self, RecordShape, SessionRecord};
use crate::session::{InitiatorState, ResponderState, SessionCore, SessionPhase, SessionState};
use crate::validator::CardValidator;

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// What [`SecureChat::rotate_keys`] published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationSummary {
    /// Id of the newly published long-term card, if one was due.
    pub long_term_card_id: Option<String>,
    /// Number of one-time cards published to refill the pool.
    pub one_time_cards_published: usize,
}

/// Non-secret view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub remote_identity: String,
    pub is_initiator: bool,
    pub phase: SessionPhase,
    pub sent_count: u64,
    pub received_count: u64,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl From<&SessionState> for SessionSummary {
    fn from(state: &SessionState) -> Self {
        let core = state.core();
        Self {
            session_id: core.session_id.clone(),
            remote_identity: core.remote_identity.clone(),
            is_initiator: state.is_initiator(),
            phase: core.phase,
            sent_count: core.sent_count,
            received_count: core.received_count,
            created_at: core.created_at,
            expires_at: core.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RetiredSession {
    remote: String,
    retired_at: i64,
}

pub struct SecureChat {
    config: Config,
    identity: String,
    identity_key: IdentityKeyPair,
    directory: Arc<dyn CardDirectory>,
    store: Arc<UserDataStore>,
    keys: LocalKeyStore,
    validator: CardValidator,
    clock: Arc<dyn Clock>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SecureChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChat")
            .field("identity", &self.identity)
            .field("identity_key", &self.identity_key)
            .finish_non_exhaustive()
    }
}

impl SecureChat {
    /// Open the chat for `identity`, loading its identity key from `store` or
    /// generating and storing a new one.
    pub fn new(
        config: Config,
        identity: impl Into<String>,
        directory: Arc<dyn CardDirectory>,
        store: Arc<UserDataStore>,
    ) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(SecureChatError::InvalidRequest(
                "identity must not be empty".into(),
            ));
        }
        let keys = LocalKeyStore::new(Arc::clone(&store), identity.clone());
        let identity_key = if let Some(key) = keys.identity_key()? {
            key
        } else {
            let key = IdentityKeyPair::generate();
            keys.save_identity_key(&key);
            debug!(identity = %identity, "Generated identity key");
            key
        };
        let chat = Self {
            config,
            identity,
            identity_key,
            directory,
            store,
            keys,
            validator: CardValidator::new(),
            clock: Arc::new(SystemClock),
            session_locks: Mutex::new(HashMap::new()),
        };
        chat.persist()?;
        Ok(chat)
    }

    /// Validate remote cards with `validator` instead of owner signatures only.
    #[must_use]
    pub fn with_validator(mut self, validator: CardValidator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity_card_id(&self) -> Option<String> {
        self.keys.identity_card_id()
    }

    fn sessions_bucket(&self) -> String {
        format!("sessions::{}", self.identity)
    }

    fn retired_bucket(&self) -> String {
        format!("retired::{}", self.identity)
    }

    fn persist(&self) -> Result<()> {
        if self.config.storage.sync_on_write {
            self.store.synchronize()?;
        }
        Ok(())
    }

    fn session_lock(&self, remote: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(remote.to_string()).or_default())
    }

    fn require_identity_card_id(&self) -> Result<String> {
        self.keys.identity_card_id().ok_or_else(|| {
            SecureChatError::MissingLocalKeys(format!(
                "{} has no published identity card",
                self.identity
            ))
        })
    }

    fn build_request(
        &self,
        public_key: &[u8],
        previous_card_id: Option<String>,
        now: i64,
    ) -> Result<EphemeralCardRequest> {
        EphemeralCardRequest::build_with(
            &self.identity,
            &self.config.cards.identity_type,
            public_key,
            None,
            None,
            previous_card_id,
            now,
        )
    }

    // ----- card publishing -----

    /// Publish the identity card unless the directory already holds it.
    ///
    /// Returns the identity card id.
    pub fn bootstrap(&self) -> Result<String> {
        if let Some(card_id) = self.keys.identity_card_id()
            && self.directory.get_card(&card_id)?.is_some()
        {
            debug!(identity = %self.identity, card_id = %card_id, "Identity card already published");
            return Ok(card_id);
        }

        let mut request =
            self.build_request(&self.identity_key.public_bytes(), None, self.clock.now())?;
        let card_id = request.card_id();
        request.sign_with(&card_id, &self.identity_key);
        if !request.is_publishable(&[card_id.as_str()]) {
            return Err(SecureChatError::InvalidRequest(
                "identity card lacks its self-signature".into(),
            ));
        }
        let record = self
            .directory
            .publish(CardKind::Identity, &request.to_publish_request())?;
        self.keys.set_identity_card_id(&record.id);
        self.persist()?;
        info!(identity = %self.identity, card_id = %record.id, "Published identity card");
        Ok(record.id)
    }

    fn long_term_due(&self, now: i64) -> Result<bool> {
        let ttl = secs(self.config.cards.long_term_card_ttl_secs);
        Ok(self
            .keys
            .current_long_term()?
            .is_none_or(|current| now.saturating_sub(current.created_at) >= ttl))
    }

    /// Whether the long-term card is missing or stale, or the one-time pool
    /// has drained to the low watermark.
    pub fn needs_key_rotation(&self) -> Result<bool> {
        if self.long_term_due(self.clock.now())? {
            return Ok(true);
        }
        let available = self.directory.one_time_card_count(&self.identity)?;
        Ok(available <= self.config.cards.one_time_low_watermark)
    }

    /// Publish a fresh long-term card when due and refill the one-time pool.
    ///
    /// Private keys are stored before their card is published, so a card
    /// handed out by the directory always has a local key behind it. The
    /// long-term card only becomes current once the directory accepted it,
    /// so a failed publish is retried by the next call.
    pub fn rotate_keys(&self) -> Result<RotationSummary> {
        let identity_card_id = self.require_identity_card_id()?;
        let now = self.clock.now();
        let mut summary = RotationSummary::default();

        if self.long_term_due(now)? {
            let previous = self.keys.current_long_term()?.map(|current| current.card_id);
            let key = AgreementKeyPair::generate();
            let mut request = self.build_request(&key.public_bytes(), previous.clone(), now)?;
            request.sign_with(&identity_card_id, &self.identity_key);
            let card_id = request.card_id();
            self.keys.save_long_term_key(&card_id, &key, now)?;
            let record = self
                .directory
                .publish(CardKind::LongTerm, &request.to_publish_request())?;
            self.keys.set_current_long_term(&card_id, now)?;
            info!(
                identity = %self.identity,
                card_id = %record.id,
                previous = ?previous,
                "Published long-term card"
            );
            summary.long_term_card_id = Some(record.id);
        }

        let available = self.directory.one_time_card_count(&self.identity)?;
        let missing = self
            .config
            .cards
            .desired_one_time_cards
            .saturating_sub(available);
        for _ in 0..missing {
            let key = AgreementKeyPair::generate();
            let mut request = self.build_request(&key.public_bytes(), None, now)?;
            request.sign_with(&identity_card_id, &self.identity_key);
            self.keys.save_one_time_key(&request.card_id(), &key)?;
            self.directory
                .publish(CardKind::OneTime, &request.to_publish_request())?;
            summary.one_time_cards_published += 1;
        }
        if missing > 0 {
            info!(
                identity = %self.identity,
                published = missing,
                available,
                local_keys = self.keys.one_time_key_count(),
                "Refilled one-time card pool"
            );
        }
        self.persist()?;
        Ok(summary)
    }

    // ----- session storage -----

    fn load_session(&self, remote: &str) -> Result<Option<SessionState>> {
        self.store
            .get_data(&self.sessions_bucket(), remote)
            .map(Zeroizing::new)
            .map(|json| SessionState::from_json(&json))
            .transpose()
    }

    fn save_session(&self, remote: &str, state: &SessionState) -> Result<()> {
        let json = Zeroizing::new(state.to_json()?);
        self.store.add_data(&self.sessions_bucket(), remote, &json);
        Ok(())
    }

    fn retire(&self, state: &SessionState, now: i64) -> Result<()> {
        let entry = serde_json::to_string(&RetiredSession {
            remote: state.core().remote_identity.clone(),
            retired_at: now,
        })?;
        self.store
            .add_data(&self.retired_bucket(), state.session_id(), &entry);
        info!(
            identity = %self.identity,
            remote = %state.core().remote_identity,
            session_id = %state.session_id(),
            "Session superseded"
        );
        Ok(())
    }

    fn is_retired(&self, session_id: &str) -> bool {
        self.store
            .get_data(&self.retired_bucket(), session_id)
            .is_some()
    }

    /// Store `state` as the current session for `remote`, retiring any other.
    fn install_session(&self, remote: &str, state: &SessionState, now: i64) -> Result<()> {
        if let Some(previous) = self.load_session(remote)?
            && previous.session_id() != state.session_id()
        {
            self.retire(&previous, now)?;
        }
        self.save_session(remote, state)
    }

    // ----- outgoing -----

    /// Encrypt `plaintext` for `remote` and return the wire message.
    ///
    /// Opens a session first when there is none or the current one expired;
    /// the result is then an initiation message, otherwise a regular one.
    pub fn encrypt(&self, remote: &str, plaintext: &[u8]) -> Result<String> {
        let lock = self.session_lock(remote);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();

        match self.load_session(remote)? {
            Some(state) if state.core().is_expired(now) => {
                info!(remote, session_id = %state.session_id(), "Session expired, starting a new one");
                self.initiate(remote, plaintext, now)
            }
            Some(mut state) => {
                let (counter, cipher_text) = state.encrypt(plaintext)?;
                state.mark_established();
                let message = RegularMessage {
                    session_id: state.session_id().to_string(),
                    counter,
                    cipher_text,
                };
                self.save_session(remote, &state)?;
                self.persist()?;
                Ok(serde_json::to_string(&message)?)
            }
            None => self.initiate(remote, plaintext, now),
        }
    }

    /// Force a new handshake with `remote`, superseding the current session.
    ///
    /// `plaintext` becomes the first message of the new session.
    pub fn start_new_session(&self, remote: &str, plaintext: &[u8]) -> Result<String> {
        let lock = self.session_lock(remote);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.initiate(remote, plaintext, self.clock.now())
    }

    fn initiate(&self, remote: &str, plaintext: &[u8], now: i64) -> Result<String> {
        let identity_card_id = self.require_identity_card_id()?;
        let local_long_term = self.keys.current_long_term()?.ok_or_else(|| {
            SecureChatError::MissingLocalKeys(format!(
                "{} has no long-term card",
                self.identity
            ))
        })?;
        let local_key = self.keys.long_term_key(&local_long_term.card_id)?;

        let records = self.directory.reserve_credentials(remote)?;
        let credentials = CredentialSet::from_records(&records)?;
        if credentials.identity_card.identity() != remote {
            return Err(SecureChatError::Directory(format!(
                "credentials for {remote} belong to {}",
                credentials.identity_card.identity()
            )));
        }
        if let Err(e) = self.validator.validate_credentials(&credentials) {
            warn!(remote, error = %e, "Rejected remote credentials");
            return Err(e);
        }
        let CredentialSet {
            identity_card: remote_identity_card,
            long_term_card: remote_long_term,
            one_time_card,
        } = credentials;
        let Some(remote_one_time) = one_time_card else {
            warn!(remote, "Remote one-time card pool is exhausted");
            return Err(SecureChatError::OneTimeCardExhausted {
                identity: remote.to_string(),
            });
        };

        let handshake = InitiatorHandshake::new();
        let secrets = handshake.complete(
            &local_key,
            remote_long_term.public_key_data(),
            remote_one_time.public_key_data(),
        )?;
        let ephemeral_public = handshake.ephemeral_public();
        let session_id = session_id_of(
            &local_long_term.card_id,
            remote_long_term.id(),
            remote_one_time.id(),
        );
        let eph_sign = self.identity_key.sign(&ephemeral_signing_data(
            &ephemeral_public,
            handshake.salt(),
            &local_long_term.card_id,
            remote_long_term.id(),
            remote_one_time.id(),
        ));

        let ttl = secs(self.config.sessions.session_ttl_secs);
        let mut state = SessionState::Initiator(InitiatorState {
            core: SessionCore::new(
                session_id.clone(),
                &self.identity,
                remote,
                &secrets,
                true,
                now,
                Some(now.saturating_add(ttl)),
            ),
            initiator_ltc_id: local_long_term.card_id.clone(),
            responder_ltc_id: remote_long_term.id().to_string(),
            responder_otc_id: remote_one_time.id().to_string(),
            ephemeral_public: ephemeral_public.to_vec(),
        });
        let (counter, cipher_text) = state.encrypt(plaintext)?;

        let message = InitiationMessage {
            initiator_ic_id: identity_card_id,
            initiator_ltc_id: local_long_term.card_id,
            responder_ic_id: remote_identity_card.id().to_string(),
            responder_ltc_id: remote_long_term.id().to_string(),
            responder_otc_id: remote_one_time.id().to_string(),
            eph: ephemeral_public.to_vec(),
            eph_sign,
            salt: handshake.salt().to_vec(),
            counter,
            cipher_text,
        };
        self.install_session(remote, &state, now)?;
        self.persist()?;
        info!(
            identity = %self.identity,
            remote,
            session_id = %session_id,
            one_time_card = %remote_one_time.id(),
            "Initiated session"
        );
        Ok(serde_json::to_string(&message)?)
    }

    // ----- incoming -----

    /// Decrypt a wire message received from `remote`.
    pub fn decrypt(&self, remote: &str, wire: &str) -> Result<Vec<u8>> {
        let lock = self.session_lock(remote);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();

        match schema::decode_str(wire)? {
            SessionRecord::InitiationMessage(message) => self.accept(remote, &message, now),
            SessionRecord::RegularMessage(message) => self.receive(remote, &message, now),
            other => Err(SecureChatError::UnclassifiableRecord(format!(
                "expected a message, found {:?}",
                RecordShape::from(&other)
            ))),
        }
    }

    fn fetch_card(&self, card_id: &str) -> Result<Card> {
        let record = self
            .directory
            .get_card(card_id)?
            .ok_or_else(|| SecureChatError::Directory(format!("card {card_id} not found")))?;
        Card::from_record(&record)
    }

    /// Answer an initiation message.
    ///
    /// Nothing is stored and the one-time key is not consumed until the first
    /// ciphertext authenticates.
    fn accept(&self, remote: &str, message: &InitiationMessage, now: i64) -> Result<Vec<u8>> {
        let identity_card_id = self.require_identity_card_id()?;
        if !constant_time_str_eq(&message.responder_ic_id, &identity_card_id) {
            return Err(SecureChatError::InvalidMessage(format!(
                "initiation addressed to identity card {}",
                message.responder_ic_id
            )));
        }

        let initiator_identity_card = self.fetch_card(&message.initiator_ic_id)?;
        let initiator_long_term = self.fetch_card(&message.initiator_ltc_id)?;
        if initiator_identity_card.identity() != remote {
            warn!(remote, claimed = %initiator_identity_card.identity(), "Initiation from unexpected identity");
            return Err(SecureChatError::SignatureVerificationFailed(format!(
                "initiator card belongs to {}, not {remote}",
                initiator_identity_card.identity()
            )));
        }
        let verified = self
            .validator
            .validate_identity_card(&initiator_identity_card)
            .and_then(|()| {
                self.validator
                    .validate_owned_card(&initiator_long_term, &initiator_identity_card)
            })
            .and_then(|()| {
                verify_signature(
                    initiator_identity_card.public_key_data(),
                    &ephemeral_signing_data(
                        &message.eph,
                        &message.salt,
                        &message.initiator_ltc_id,
                        &message.responder_ltc_id,
                        &message.responder_otc_id,
                    ),
                    &message.eph_sign,
                )
            });
        if let Err(e) = verified {
            warn!(remote, error = %e, "Rejected initiation message");
            return Err(e);
        }

        let local_key = self.keys.long_term_key(&message.responder_ltc_id)?;
        let one_time_key = match self.keys.one_time_key(&message.responder_otc_id) {
            Ok(key) => key,
            Err(e) => {
                warn!(remote, card_id = %message.responder_otc_id, error = %e, "Rejected initiation message");
                return Err(e);
            }
        };
        let secrets = exchange::respond(
            &local_key,
            &one_time_key,
            initiator_long_term.public_key_data(),
            &message.eph,
            &message.salt,
        )?;
        drop(one_time_key);

        let session_id = session_id_of(
            &message.initiator_ltc_id,
            &message.responder_ltc_id,
            &message.responder_otc_id,
        );
        let ttl = secs(self.config.sessions.session_ttl_secs);
        let mut state = SessionState::Responder(ResponderState {
            core: SessionCore::new(
                session_id.clone(),
                &self.identity,
                remote,
                &secrets,
                false,
                now,
                Some(now.saturating_add(ttl)),
            ),
            initiator_ltc_id: message.initiator_ltc_id.clone(),
            responder_ltc_id: message.responder_ltc_id.clone(),
            consumed_otc_id: message.responder_otc_id.clone(),
            initiator_ephemeral_public: message.eph.clone(),
        });
        let plaintext = state.decrypt(
            message.counter,
            &message.cipher_text,
            self.config.sessions.max_skip,
        )?;

        self.keys
            .take_one_time_key(&message.responder_otc_id, now)?;
        self.install_session(remote, &state, now)?;
        self.persist()?;
        info!(
            identity = %self.identity,
            remote,
            session_id = %session_id,
            one_time_card = %message.responder_otc_id,
            "Accepted session"
        );
        Ok(plaintext)
    }

    fn receive(&self, remote: &str, message: &RegularMessage, now: i64) -> Result<Vec<u8>> {
        let current = self.load_session(remote)?;
        let mut state = match current {
            Some(state) if constant_time_str_eq(state.session_id(), &message.session_id) => state,
            _ if self.is_retired(&message.session_id) => {
                warn!(remote, session_id = %message.session_id, "Message for superseded session");
                return Err(SecureChatError::SessionSuperseded {
                    session_id: message.session_id.clone(),
                });
            }
            _ => {
                return Err(SecureChatError::SessionNotFound {
                    remote: remote.to_string(),
                });
            }
        };
        if state.core().is_expired(now) {
            return Err(SecureChatError::SessionExpired {
                session_id: message.session_id.clone(),
            });
        }

        let plaintext = match state.decrypt(
            message.counter,
            &message.cipher_text,
            self.config.sessions.max_skip,
        ) {
            Ok(plaintext) => plaintext,
            Err(e @ SecureChatError::ReplayedMessage { .. }) => {
                warn!(remote, session_id = %message.session_id, error = %e, "Rejected replayed message");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        state.mark_established();
        self.save_session(remote, &state)?;
        self.persist()?;
        Ok(plaintext)
    }

    // ----- housekeeping -----

    pub fn active_session(&self, remote: &str) -> Result<Option<SessionSummary>> {
        Ok(self
            .load_session(remote)?
            .as_ref()
            .map(SessionSummary::from))
    }

    /// Retire and drop the session with `remote`. Returns whether one existed.
    pub fn remove_session(&self, remote: &str) -> Result<bool> {
        let lock = self.session_lock(remote);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = self.load_session(remote)? else {
            return Ok(false);
        };
        self.retire(&state, self.clock.now())?;
        self.store.remove_data(&self.sessions_bucket(), remote);
        self.persist()?;
        Ok(true)
    }

    /// Drop expired sessions, plus retirement records and consumed one-time
    /// markers older than the session lifetime. Returns the number of
    /// sessions removed.
    pub fn remove_expired_sessions(&self) -> Result<usize> {
        let now = self.clock.now();
        let remotes: Vec<String> = self
            .store
            .get_all_data(&self.sessions_bucket())
            .snapshot()
            .into_keys()
            .collect();

        let mut removed = 0;
        for remote in remotes {
            let lock = self.session_lock(&remote);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = self.load_session(&remote)?
                && state.core().is_expired(now)
            {
                self.store.remove_data(&self.sessions_bucket(), &remote);
                debug!(remote = %remote, session_id = %state.session_id(), "Removed expired session");
                removed += 1;
            }
        }

        let ttl = secs(self.config.sessions.session_ttl_secs);
        self.store.update(&self.retired_bucket(), |entries| {
            entries.retain(|_, json| {
                serde_json::from_str::<RetiredSession>(json)
                    .is_ok_and(|retired| now.saturating_sub(retired.retired_at) < ttl)
            });
        });
        self.keys
            .prune_consumed_one_time_keys(now.saturating_sub(ttl));
        self.persist()?;
        if removed > 0 {
            info!(identity = %self.identity, removed, "Removed expired sessions");
        }
        Ok(removed)
    }

    /// Drop every session, retirement record and key of the local identity.
    ///
    /// Waits for in-flight operations on every known remote and holds their
    /// locks while the buckets go, so none of them can write a session back.
    /// The identity key is regenerated on the next [`SecureChat::new`]; cards
    /// already published stay in the directory.
    pub fn remove_identity_data(&self) -> Result<()> {
        let remote_locks: Vec<Arc<Mutex<()>>> = {
            let mut locks = self
                .session_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for remote in self.store.get_all_data(&self.sessions_bucket()).snapshot().into_keys() {
                locks.entry(remote).or_default();
            }
            let mut remotes: Vec<_> = locks.iter().collect();
            remotes.sort_by(|a, b| a.0.cmp(b.0));
            remotes.into_iter().map(|(_, lock)| Arc::clone(lock)).collect()
        };
        let _guards: Vec<_> = remote_locks
            .iter()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();

        self.store.remove_storage(&self.sessions_bucket());
        self.store.remove_storage(&self.retired_bucket());
        self.keys.remove_all();
        self.persist()?;
        info!(identity = %self.identity, "Removed identity data");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::card::{CardRecord, CredentialRecords};
    use crate::clock::ManualClock;
    use crate::directory::InMemoryDirectory;
    use crate::issuer::PublishRequest;

    /// Directory that rejects the next `failures` long-term publishes.
    struct FlakyDirectory {
        inner: Arc<InMemoryDirectory>,
        failures: AtomicUsize,
    }

    impl CardDirectory for FlakyDirectory {
        fn publish(&self, kind: CardKind, request: &PublishRequest) -> Result<CardRecord> {
            if kind == CardKind::LongTerm
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(SecureChatError::Directory("service unavailable".into()));
            }
            self.inner.publish(kind, request)
        }

        fn get_card(&self, card_id: &str) -> Result<Option<CardRecord>> {
            self.inner.get_card(card_id)
        }

        fn reserve_credentials(&self, identity: &str) -> Result<CredentialRecords> {
            self.inner.reserve_credentials(identity)
        }

        fn one_time_card_count(&self, identity: &str) -> Result<usize> {
            self.inner.one_time_card_count(identity)
        }
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.cards.desired_one_time_cards = 3;
        config.cards.one_time_low_watermark = 1;
        config
    }

    fn chat(directory: &Arc<InMemoryDirectory>, identity: &str, clock: &Arc<ManualClock>) -> SecureChat {
        let chat = SecureChat::new(
            small_config(),
            identity,
            Arc::clone(directory) as Arc<dyn CardDirectory>,
            Arc::new(UserDataStore::new()),
        )
        .unwrap()
        .with_clock(Arc::clone(clock) as Arc<dyn Clock>);
        chat.bootstrap().unwrap();
        chat.rotate_keys().unwrap();
        chat
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let alice = chat(&directory, "alice", &clock);
        let first = alice.identity_card_id().unwrap();
        assert_eq!(alice.bootstrap().unwrap(), first);
    }

    #[test]
    fn rotate_keys_tops_up_pool_and_keeps_fresh_long_term() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let bob = chat(&directory, "bob", &clock);
        assert_eq!(directory.one_time_card_count("bob").unwrap(), 3);
        assert!(!bob.needs_key_rotation().unwrap());

        directory.reserve_credentials("bob").unwrap();
        directory.reserve_credentials("bob").unwrap();
        assert!(bob.needs_key_rotation().unwrap());

        let summary = bob.rotate_keys().unwrap();
        assert_eq!(summary.long_term_card_id, None);
        assert_eq!(summary.one_time_cards_published, 2);
        assert_eq!(directory.one_time_card_count("bob").unwrap(), 3);
    }

    #[test]
    fn stale_long_term_card_is_replaced_with_successor() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let bob = chat(&directory, "bob", &clock);
        let first = bob.keys.current_long_term().unwrap().unwrap().card_id;

        clock.advance(secs(bob.config().cards.long_term_card_ttl_secs));
        assert!(bob.needs_key_rotation().unwrap());
        let second = bob.rotate_keys().unwrap().long_term_card_id.unwrap();
        assert_ne!(first, second);

        let card = Card::from_record(&directory.get_card(&second).unwrap().unwrap()).unwrap();
        assert_eq!(card.previous_card_id(), Some(first.as_str()));
    }

    #[test]
    fn rotate_before_bootstrap_is_rejected() {
        let directory = Arc::new(InMemoryDirectory::default());
        let chat = SecureChat::new(
            small_config(),
            "carol",
            directory as Arc<dyn CardDirectory>,
            Arc::new(UserDataStore::new()),
        )
        .unwrap();
        assert!(matches!(
            chat.rotate_keys(),
            Err(SecureChatError::MissingLocalKeys(_))
        ));
    }

    #[test]
    fn expired_session_triggers_new_handshake() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let alice = chat(&directory, "alice", &clock);
        let bob = chat(&directory, "bob", &clock);

        let first = alice.encrypt("bob", b"one").unwrap();
        bob.decrypt("alice", &first).unwrap();
        let old_id = alice.active_session("bob").unwrap().unwrap().session_id;

        clock.advance(secs(alice.config().sessions.session_ttl_secs));
        let wire = alice.encrypt("bob", b"two").unwrap();
        assert!(wire.contains("\"eph\""));
        assert_ne!(alice.active_session("bob").unwrap().unwrap().session_id, old_id);
        assert_eq!(bob.decrypt("alice", &wire).unwrap(), b"two");
    }

    #[test]
    fn expired_sessions_are_swept() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let alice = chat(&directory, "alice", &clock);
        let _bob = chat(&directory, "bob", &clock);

        alice.encrypt("bob", b"hello").unwrap();
        assert_eq!(alice.remove_expired_sessions().unwrap(), 0);
        clock.advance(secs(alice.config().sessions.session_ttl_secs) + 1);
        assert_eq!(alice.remove_expired_sessions().unwrap(), 1);
        assert!(alice.active_session("bob").unwrap().is_none());
    }

    #[test]
    fn state_blob_is_not_accepted_as_message() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let alice = chat(&directory, "alice", &clock);
        let _bob = chat(&directory, "bob", &clock);
        alice.encrypt("bob", b"hello").unwrap();

        let blob = alice
            .store
            .get_data(&alice.sessions_bucket(), "bob")
            .unwrap();
        assert!(matches!(
            alice.decrypt("bob", &blob),
            Err(SecureChatError::UnclassifiableRecord(_))
        ));
    }

    #[test]
    fn failed_long_term_publish_is_retried() {
        let directory = Arc::new(FlakyDirectory {
            inner: Arc::new(InMemoryDirectory::default()),
            failures: AtomicUsize::new(1),
        });
        let clock = Arc::new(ManualClock::new(1_000));
        let bob = SecureChat::new(
            small_config(),
            "bob",
            Arc::clone(&directory) as Arc<dyn CardDirectory>,
            Arc::new(UserDataStore::new()),
        )
        .unwrap()
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        bob.bootstrap().unwrap();

        assert!(matches!(
            bob.rotate_keys(),
            Err(SecureChatError::Directory(_))
        ));
        assert!(bob.keys.current_long_term().unwrap().is_none());
        assert!(bob.needs_key_rotation().unwrap());

        let summary = bob.rotate_keys().unwrap();
        let card_id = summary.long_term_card_id.unwrap();
        assert_eq!(bob.keys.current_long_term().unwrap().unwrap().card_id, card_id);

        let alice = chat(&directory.inner, "alice", &clock);
        let wire = alice.encrypt("bob", b"after outage").unwrap();
        assert_eq!(bob.decrypt("alice", &wire).unwrap(), b"after outage");
    }

    #[test]
    fn identity_removal_waits_for_in_flight_session_work() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let alice = Arc::new(chat(&directory, "alice", &clock));
        let _bob = chat(&directory, "bob", &clock);
        alice.encrypt("bob", b"hello").unwrap();

        let lock = alice.session_lock("bob");
        let guard = lock.lock().unwrap();
        let remover = {
            let alice = Arc::clone(&alice);
            thread::spawn(move || alice.remove_identity_data())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!remover.is_finished());

        // A send still holding the lock finishes its write first.
        let state = alice.load_session("bob").unwrap().unwrap();
        alice.save_session("bob", &state).unwrap();
        drop(guard);

        remover.join().unwrap().unwrap();
        assert!(alice.active_session("bob").unwrap().is_none());
        assert!(alice.store.get_all_data(&alice.sessions_bucket()).is_empty());
    }

    #[test]
    fn sweep_prunes_old_consumed_one_time_markers() {
        let directory = Arc::new(InMemoryDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let alice = chat(&directory, "alice", &clock);
        let bob = chat(&directory, "bob", &clock);

        let wire = alice.encrypt("bob", b"hello").unwrap();
        bob.decrypt("alice", &wire).unwrap();
        let markers = || {
            bob.store
                .get_all_data("otc::bob")
                .snapshot()
                .values()
                .filter(|json| json.contains("consumed"))
                .count()
        };
        assert_eq!(markers(), 1);

        bob.remove_expired_sessions().unwrap();
        assert_eq!(markers(), 1);

        clock.advance(secs(bob.config().sessions.session_ttl_secs) + 1);
        bob.remove_expired_sessions().unwrap();
        assert_eq!(markers(), 0);
    }
}
