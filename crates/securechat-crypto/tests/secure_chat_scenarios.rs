//! End-to-end conversations between identities sharing one directory.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::BTreeSet;
use std::sync::Arc;

use securechat_core::{Config, JsonFileBackend, UserDataStore};
use securechat_crypto::{
    CardDirectory, CardValidator, InMemoryDirectory, InitiationMessage, LocalKeyStore, RecordShape,
    RegularMessage, SecureChat, SecureChatError, SessionPhase, SessionState, classify,
};

struct Party {
    chat: Arc<SecureChat>,
    store: Arc<UserDataStore>,
}

fn config(one_time_cards: usize) -> Config {
    let mut config = Config::default();
    config.cards.desired_one_time_cards = one_time_cards;
    config.cards.one_time_low_watermark = 0;
    config
}

fn open(directory: &Arc<InMemoryDirectory>, identity: &str, store: Arc<UserDataStore>, one_time_cards: usize) -> Party {
    let chat = SecureChat::new(
        config(one_time_cards),
        identity,
        Arc::clone(directory) as Arc<dyn CardDirectory>,
        Arc::clone(&store),
    )
    .unwrap();
    chat.bootstrap().unwrap();
    chat.rotate_keys().unwrap();
    Party {
        chat: Arc::new(chat),
        store,
    }
}

fn party(directory: &Arc<InMemoryDirectory>, identity: &str, one_time_cards: usize) -> Party {
    open(directory, identity, Arc::new(UserDataStore::new()), one_time_cards)
}

fn stored_session(party: &Party, remote: &str) -> SessionState {
    let bucket = format!("sessions::{}", party.chat.identity());
    SessionState::from_json(&party.store.get_data(&bucket, remote).unwrap()).unwrap()
}

#[test]
fn alice_opens_session_with_bobs_only_one_time_card() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);
    assert_eq!(directory.one_time_card_count("bob").unwrap(), 1);

    let wire = alice.chat.encrypt("bob", b"hello bob").unwrap();
    let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(classify(&value), RecordShape::InitiationMessage);
    let initiation: InitiationMessage = serde_json::from_str(&wire).unwrap();
    let otc_1 = initiation.responder_otc_id.clone();
    assert_eq!(directory.one_time_card_count("bob").unwrap(), 0);

    match stored_session(&alice, "bob") {
        SessionState::Initiator(state) => assert_eq!(state.responder_otc_id, otc_1),
        other => panic!("alice should hold an initiator session, got {other:?}"),
    }

    assert_eq!(bob.chat.decrypt("alice", &wire).unwrap(), b"hello bob");
    let bob_keys = LocalKeyStore::new(Arc::clone(&bob.store), "bob");
    assert_eq!(bob_keys.one_time_key_count(), 0);
    assert!(matches!(
        bob_keys.one_time_key(&otc_1),
        Err(SecureChatError::OneTimeCardReused { .. })
    ));

    let alice_state = stored_session(&alice, "bob");
    let bob_state = stored_session(&bob, "alice");
    assert_eq!(alice_state.session_id(), bob_state.session_id());
    assert_eq!(alice_state.core().root_key(), bob_state.core().root_key());
    match bob_state {
        SessionState::Responder(state) => assert_eq!(state.consumed_otc_id, otc_1),
        other => panic!("bob should hold a responder session, got {other:?}"),
    }
}

#[test]
fn conversation_ratchets_both_directions() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 2);
    let bob = party(&directory, "bob", 2);

    let first = alice.chat.encrypt("bob", b"ping").unwrap();
    bob.chat.decrypt("alice", &first).unwrap();
    assert_eq!(
        bob.chat.active_session("alice").unwrap().unwrap().phase,
        SessionPhase::Initiating
    );

    for round in 0..5u8 {
        let reply = bob.chat.encrypt("alice", &[round]).unwrap();
        assert_eq!(alice.chat.decrypt("bob", &reply).unwrap(), vec![round]);
        let next = alice.chat.encrypt("bob", &[round, round]).unwrap();
        assert_eq!(bob.chat.decrypt("alice", &next).unwrap(), vec![round, round]);
    }

    let summary = alice.chat.active_session("bob").unwrap().unwrap();
    assert!(summary.is_initiator);
    assert_eq!(summary.phase, SessionPhase::Established);
    assert_eq!(summary.sent_count, 6);
    assert_eq!(summary.received_count, 5);
    assert_eq!(
        summary.session_id,
        bob.chat.active_session("alice").unwrap().unwrap().session_id
    );
}

#[test]
fn replayed_initiation_is_rejected_as_reuse() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);

    let wire = alice.chat.encrypt("bob", b"once").unwrap();
    bob.chat.decrypt("alice", &wire).unwrap();
    let session_id = bob.chat.active_session("alice").unwrap().unwrap().session_id;

    match bob.chat.decrypt("alice", &wire) {
        Err(SecureChatError::OneTimeCardReused { .. }) => {}
        other => panic!("expected one-time card reuse, got {other:?}"),
    }
    assert_eq!(
        bob.chat.active_session("alice").unwrap().unwrap().session_id,
        session_id
    );
}

#[test]
fn new_handshake_supersedes_previous_session() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 2);
    let bob = party(&directory, "bob", 2);

    let first = alice.chat.encrypt("bob", b"first").unwrap();
    bob.chat.decrypt("alice", &first).unwrap();
    let old_id = alice.chat.active_session("bob").unwrap().unwrap().session_id;
    let late = alice.chat.encrypt("bob", b"late").unwrap();

    let restart = alice.chat.start_new_session("bob", b"fresh start").unwrap();
    let new_id = alice.chat.active_session("bob").unwrap().unwrap().session_id;
    assert_ne!(old_id, new_id);
    assert_eq!(bob.chat.decrypt("alice", &restart).unwrap(), b"fresh start");
    assert_eq!(
        bob.chat.active_session("alice").unwrap().unwrap().session_id,
        new_id
    );

    match bob.chat.decrypt("alice", &late) {
        Err(SecureChatError::SessionSuperseded { session_id }) => assert_eq!(session_id, old_id),
        other => panic!("expected superseded session, got {other:?}"),
    }
}

#[test]
fn past_message_keys_are_gone_after_ratcheting() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);

    let first = alice.chat.encrypt("bob", b"m0").unwrap();
    bob.chat.decrypt("alice", &first).unwrap();
    let early_state = stored_session(&bob, "alice");
    let early_chain = early_state.core().receiving_chain();

    let mut sent = Vec::new();
    for i in 1..=4u8 {
        let wire = alice.chat.encrypt("bob", &[i]).unwrap();
        bob.chat.decrypt("alice", &wire).unwrap();
        sent.push(wire);
    }

    let current = stored_session(&bob, "alice");
    let current_chain = current.core().receiving_chain();
    assert_eq!(current_chain.index(), 5);
    assert_ne!(current_chain.key_bytes(), early_chain.key_bytes());
    let json = current.to_json().unwrap();
    assert!(!json.contains(&securechat_crypto::codec::encode(early_chain.key_bytes())));

    let old: RegularMessage = serde_json::from_str(&sent[1]).unwrap();
    let mut replay_target = current.clone();
    match replay_target.decrypt(old.counter, &old.cipher_text, 1000) {
        Err(SecureChatError::ReplayedMessage { counter, expected }) => {
            assert_eq!((counter, expected), (2, 5));
        }
        other => panic!("expected replay rejection, got {other:?}"),
    }
    assert!(matches!(
        bob.chat.decrypt("alice", &sent[1]),
        Err(SecureChatError::ReplayedMessage { .. })
    ));
}

#[test]
fn exhausted_pool_fails_the_handshake() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let carol = party(&directory, "carol", 1);
    let _bob = party(&directory, "bob", 1);

    carol.chat.encrypt("bob", b"first in line").unwrap();
    match alice.chat.encrypt("bob", b"too late") {
        Err(SecureChatError::OneTimeCardExhausted { identity }) => assert_eq!(identity, "bob"),
        other => panic!("expected exhausted pool, got {other:?}"),
    }
    assert!(alice.chat.active_session("bob").unwrap().is_none());
}

#[test]
fn forged_ephemeral_signature_is_rejected_without_consuming_key() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);

    let wire = alice.chat.encrypt("bob", b"signed").unwrap();
    let mut forged: InitiationMessage = serde_json::from_str(&wire).unwrap();
    forged.eph_sign[0] ^= 0x01;
    let forged = serde_json::to_string(&forged).unwrap();

    assert!(matches!(
        bob.chat.decrypt("alice", &forged),
        Err(SecureChatError::SignatureVerificationFailed(_))
    ));
    assert!(bob.chat.active_session("alice").unwrap().is_none());
    assert_eq!(LocalKeyStore::new(Arc::clone(&bob.store), "bob").one_time_key_count(), 1);

    assert_eq!(bob.chat.decrypt("alice", &wire).unwrap(), b"signed");
}

#[test]
fn initiation_claiming_another_identity_is_rejected() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);
    let _mallory = party(&directory, "mallory", 1);

    let wire = alice.chat.encrypt("bob", b"from alice").unwrap();
    assert!(matches!(
        bob.chat.decrypt("mallory", &wire),
        Err(SecureChatError::SignatureVerificationFailed(_))
    ));
}

#[test]
fn tampered_ciphertext_does_not_advance_the_chain() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);

    let first = alice.chat.encrypt("bob", b"hi").unwrap();
    bob.chat.decrypt("alice", &first).unwrap();

    let wire = alice.chat.encrypt("bob", b"intact").unwrap();
    let mut tampered: RegularMessage = serde_json::from_str(&wire).unwrap();
    let last = tampered.cipher_text.len() - 1;
    tampered.cipher_text[last] ^= 0x80;
    let tampered = serde_json::to_string(&tampered).unwrap();

    assert!(matches!(
        bob.chat.decrypt("alice", &tampered),
        Err(SecureChatError::DecryptionFailed(_))
    ));
    assert_eq!(
        bob.chat.active_session("alice").unwrap().unwrap().received_count,
        1
    );
    assert_eq!(bob.chat.decrypt("alice", &wire).unwrap(), b"intact");
}

#[test]
fn regular_message_without_session_is_not_found() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);

    alice.chat.encrypt("bob", b"lost initiation").unwrap();
    let regular = alice.chat.encrypt("bob", b"arrives first").unwrap();
    assert!(matches!(
        bob.chat.decrypt("alice", &regular),
        Err(SecureChatError::SessionNotFound { .. })
    ));
}

#[test]
fn concurrent_sends_never_reuse_a_counter() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let bob = party(&directory, "bob", 1);

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let chat = Arc::clone(&alice.chat);
            std::thread::spawn(move || chat.encrypt("bob", &[i]).unwrap())
        })
        .collect();
    let mut wires: Vec<(u64, String)> = handles
        .into_iter()
        .map(|h| {
            let wire = h.join().unwrap();
            let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
            (value["counter"].as_u64().unwrap(), wire)
        })
        .collect();
    wires.sort_by_key(|(counter, _)| *counter);

    let counters: BTreeSet<u64> = wires.iter().map(|(counter, _)| *counter).collect();
    assert_eq!(counters, (0..8).collect::<BTreeSet<_>>());

    let mut received = BTreeSet::new();
    for (_, wire) in &wires {
        received.insert(bob.chat.decrypt("alice", wire).unwrap()[0]);
    }
    assert_eq!(received, (0..8u8).collect::<BTreeSet<_>>());
}

#[test]
fn sessions_survive_reopening_a_file_backed_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.json");
    let directory = Arc::new(InMemoryDirectory::default());
    let bob = party(&directory, "bob", 2);

    let first = {
        let store = Arc::new(UserDataStore::open(Box::new(JsonFileBackend::new(&path))).unwrap());
        let alice = open(&directory, "alice", store, 1);
        alice.chat.encrypt("bob", b"before restart").unwrap()
    };
    assert_eq!(bob.chat.decrypt("alice", &first).unwrap(), b"before restart");

    let store = Arc::new(UserDataStore::open(Box::new(JsonFileBackend::new(&path))).unwrap());
    let alice = SecureChat::new(
        config(1),
        "alice",
        Arc::clone(&directory) as Arc<dyn CardDirectory>,
        store,
    )
    .unwrap();
    alice.bootstrap().unwrap();
    let after = alice.encrypt("bob", b"after restart").unwrap();
    assert!(serde_json::from_str::<RegularMessage>(&after).is_ok());
    assert_eq!(bob.chat.decrypt("alice", &after).unwrap(), b"after restart");
}

#[test]
fn directory_countersignature_can_be_required() {
    let directory = Arc::new(InMemoryDirectory::default());
    let (service_id, service_key) = directory.service_verifier();
    let _bob = party(&directory, "bob", 2);

    let store = Arc::new(UserDataStore::new());
    let alice = open(&directory, "alice", Arc::clone(&store), 1);
    drop(alice);
    let strict = SecureChat::new(
        config(1),
        "alice",
        Arc::clone(&directory) as Arc<dyn CardDirectory>,
        Arc::clone(&store),
    )
    .unwrap()
    .with_validator(CardValidator::new().with_verifier(service_id, &service_key));
    strict.encrypt("bob", b"countersigned").unwrap();

    let impostor = SecureChat::new(
        config(1),
        "alice",
        Arc::clone(&directory) as Arc<dyn CardDirectory>,
        store,
    )
    .unwrap()
    .with_validator(CardValidator::new().with_verifier("other-service", &[7u8; 32]));
    assert!(matches!(
        impostor.start_new_session("bob", b"rejected"),
        Err(SecureChatError::SignatureVerificationFailed(_))
    ));
}

#[test]
fn removing_identity_data_forgets_sessions() {
    let directory = Arc::new(InMemoryDirectory::default());
    let alice = party(&directory, "alice", 1);
    let _bob = party(&directory, "bob", 1);

    alice.chat.encrypt("bob", b"hello").unwrap();
    assert!(alice.chat.active_session("bob").unwrap().is_some());
    assert!(alice.chat.remove_session("bob").unwrap());
    assert!(!alice.chat.remove_session("bob").unwrap());

    alice.chat.remove_identity_data().unwrap();
    assert!(alice.chat.active_session("bob").unwrap().is_none());
    assert!(
        alice
            .store
            .storage_names()
            .iter()
            .all(|name| !name.ends_with("::alice"))
    );
}
