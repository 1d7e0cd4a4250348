//! Secure chat error types.

/// Errors from card handling, handshakes and message processing.
#[derive(Debug, thiserror::Error)]
pub enum SecureChatError {
    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("No one-time card available for {identity}")]
    OneTimeCardExhausted { identity: String },

    #[error("One-time card {card_id} was already consumed")]
    OneTimeCardReused { card_id: String },

    #[error("One-time card {card_id} was never issued by this identity")]
    UnknownOneTimeCard { card_id: String },

    #[error("No session with {remote}")]
    SessionNotFound { remote: String },

    #[error("Session {session_id} was superseded by a newer handshake")]
    SessionSuperseded { session_id: String },

    #[error("Session {session_id} expired")]
    SessionExpired { session_id: String },

    #[error("Message counter {counter} was already used (next expected {expected})")]
    ReplayedMessage { counter: u64, expected: u64 },

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Record does not match any known shape: {0}")]
    UnclassifiableRecord(String),

    #[error("Card id {claimed} does not match snapshot digest {actual}")]
    CardIdMismatch { claimed: String, actual: String },

    #[error("Invalid card request: {0}")]
    InvalidRequest(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Local key material missing: {0}")]
    MissingLocalKeys(String),

    #[error("Directory service error: {0}")]
    Directory(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] securechat_core::Error),
}

impl From<serde_json::Error> for SecureChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for SecureChatError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Serialization(format!("invalid base64: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SecureChatError>;
