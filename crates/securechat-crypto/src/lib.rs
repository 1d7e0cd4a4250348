//! `SecureChat` PFS Library
//!
//! Pairwise end-to-end encrypted sessions between identities published in a
//! card directory, with perfect forward secrecy.
//!
//! ## Crypto primitives
//!
//! - **Cards**: Ed25519 identity card (self-signed), X25519 long-term and
//!   one-time cards signed by the identity key
//! - **Handshake**: three X25519 agreements (long-term/long-term,
//!   ephemeral/long-term, ephemeral/one-time) → HKDF-SHA256 → root and chain keys
//! - **Ratchet**: HMAC-SHA256 symmetric chain per direction, one key per message
//! - **Encryption**: ChaCha20-Poly1305 AEAD bound to session id and counter

pub mod card;
pub mod clock;
pub mod codec;
pub mod directory;
pub mod error;
pub mod exchange;
pub mod issuer;
pub mod keys;
pub mod keystore;
pub mod message;
pub mod ratchet;
pub mod schema;
pub mod secure_chat;
pub mod session;
pub mod validator;

pub use card::{Card, CardKind, CardRecord, CardSnapshot, CredentialRecords, CredentialSet};
#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use directory::{CardDirectory, InMemoryDirectory};
pub use error::{Result, SecureChatError};
pub use exchange::{constant_time_str_eq, session_id_of};
pub use issuer::{EphemeralCardRequest, PublishRequest};
pub use keys::{AgreementKeyPair, IdentityKeyPair};
pub use keystore::LocalKeyStore;
pub use message::{InitiationMessage, RegularMessage};
pub use schema::{RecordShape, SessionRecord, classify};
pub use secure_chat::{RotationSummary, SecureChat, SessionSummary};
pub use session::{SessionPhase, SessionState};
pub use validator::CardValidator;
