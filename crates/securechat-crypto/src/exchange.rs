//! Handshake key agreement.
//!
//! The initiator generates an ephemeral X25519 keypair per handshake and
//! combines three Diffie-Hellman outputs against the responder's long-term
//! and one-time cards:
//!
//! ```text
//! DH1 = DH(LT_initiator, LT_responder)
//! DH2 = DH(EK,           LT_responder)
//! DH3 = DH(EK,           OT_responder)
//! ```
//!
//! The responder computes the same values from its private keys. HKDF-SHA256
//! over `DH1 || DH2 || DH3` yields the root key and one chain key per direction.

use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, SecureChatError};
use crate::keys::AgreementKeyPair;

/// HKDF info string for session secret derivation.
const HKDF_INFO: &[u8] = b"securechat-pfs-session-v1";

/// Domain label mixed into the ephemeral key signature.
const EPHEMERAL_SIGNING_LABEL: &[u8] = b"securechat-ephemeral-v1";

/// Size of the per-handshake HKDF salt.
pub const SALT_SIZE: usize = 32;

/// Secrets derived by a completed handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionSecrets {
    pub root_key: [u8; 32],
    /// Chain carrying initiator -> responder messages.
    pub initiator_chain: [u8; 32],
    /// Chain carrying responder -> initiator messages.
    pub responder_chain: [u8; 32],
}

fn derive_session_secrets(dh_outputs: &[Zeroizing<[u8; 32]>], salt: &[u8]) -> Result<SessionSecrets> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(dh_outputs.len() * 32));
    for dh in dh_outputs {
        ikm.extend_from_slice(dh.as_slice());
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut okm = Zeroizing::new([0u8; 96]);
    hk.expand(HKDF_INFO, okm.as_mut_slice())
        .map_err(|e| SecureChatError::KeyDerivationFailed(e.to_string()))?;

    let mut secrets = SessionSecrets {
        root_key: [0u8; 32],
        initiator_chain: [0u8; 32],
        responder_chain: [0u8; 32],
    };
    secrets.root_key.copy_from_slice(&okm[..32]);
    secrets.initiator_chain.copy_from_slice(&okm[32..64]);
    secrets.responder_chain.copy_from_slice(&okm[64..]);
    Ok(secrets)
}

/// Session id both sides compute from the card ids the handshake used.
pub fn session_id_of(initiator_ltc_id: &str, responder_ltc_id: &str, responder_otc_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [initiator_ltc_id, responder_ltc_id, responder_otc_id] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Compare two identifiers without leaking the position of the first difference.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Bytes the initiator signs to bind its ephemeral key to this handshake.
pub fn ephemeral_signing_data(
    ephemeral_public: &[u8],
    salt: &[u8],
    initiator_ltc_id: &str,
    responder_ltc_id: &str,
    responder_otc_id: &str,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(
        EPHEMERAL_SIGNING_LABEL.len() + ephemeral_public.len() + salt.len() + 3 * 64,
    );
    data.extend_from_slice(EPHEMERAL_SIGNING_LABEL);
    data.extend_from_slice(ephemeral_public);
    data.extend_from_slice(salt);
    for id in [initiator_ltc_id, responder_ltc_id, responder_otc_id] {
        data.extend_from_slice(&(id.len() as u64).to_be_bytes());
        data.extend_from_slice(id.as_bytes());
    }
    data
}

/// Initiator side of a handshake in progress.
pub struct InitiatorHandshake {
    ephemeral: AgreementKeyPair,
    salt: [u8; SALT_SIZE],
}

impl std::fmt::Debug for InitiatorHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorHandshake")
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

impl Default for InitiatorHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl InitiatorHandshake {
    /// Start a handshake with a fresh ephemeral keypair and salt.
    pub fn new() -> Self {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self {
            ephemeral: AgreementKeyPair::generate(),
            salt,
        }
    }

    pub fn ephemeral_public(&self) -> [u8; 32] {
        self.ephemeral.public_bytes()
    }

    pub const fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Derive session secrets against the responder's card keys.
    ///
    /// The ephemeral secret is dropped with `self` once the caller is done.
    pub fn complete(
        &self,
        local_long_term: &AgreementKeyPair,
        remote_long_term: &[u8],
        remote_one_time: &[u8],
    ) -> Result<SessionSecrets> {
        let outputs = [
            local_long_term.diffie_hellman(remote_long_term)?,
            self.ephemeral.diffie_hellman(remote_long_term)?,
            self.ephemeral.diffie_hellman(remote_one_time)?,
        ];
        derive_session_secrets(&outputs, &self.salt)
    }
}

/// Responder side: mirror of [`InitiatorHandshake::complete`].
pub fn respond(
    local_long_term: &AgreementKeyPair,
    local_one_time: &AgreementKeyPair,
    initiator_long_term: &[u8],
    initiator_ephemeral: &[u8],
    salt: &[u8],
) -> Result<SessionSecrets> {
    if salt.len() != SALT_SIZE {
        return Err(SecureChatError::InvalidMessage(format!(
            "salt must be {SALT_SIZE} bytes, got {}",
            salt.len()
        )));
    }
    let outputs = [
        local_long_term.diffie_hellman(initiator_long_term)?,
        local_long_term.diffie_hellman(initiator_ephemeral)?,
        local_one_time.diffie_hellman(initiator_ephemeral)?,
    ];
    derive_session_secrets(&outputs, salt)
}
