//! Key pairs backing published cards.
//!
//! Identity cards carry an Ed25519 verifying key used to sign every other card
//! and handshake. Long-term and one-time cards carry X25519 public keys used
//! for key agreement.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, SecureChatError};

/// Size of every raw public/secret key handled here.
pub const KEY_SIZE: usize = 32;

fn key_array(bytes: &[u8]) -> Result<[u8; KEY_SIZE]> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| {
        SecureChatError::InvalidKey(format!(
            "expected {KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Ed25519 identity keypair that signs cards and handshakes.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let mut arr = key_array(bytes)?;
        let signing = SigningKey::from_bytes(&arr);
        arr.zeroize();
        Ok(Self { signing })
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Get the secret key as raw bytes. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Verify an Ed25519 signature made by the holder of `public_key`.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(&key_array(public_key)?)
        .map_err(|e| SecureChatError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| SecureChatError::SignatureVerificationFailed(e.to_string()))?;
    key.verify_strict(message, &signature)
        .map_err(|e| SecureChatError::SignatureVerificationFailed(e.to_string()))
}

/// X25519 keypair for long-term, one-time and ephemeral key agreement.
pub struct AgreementKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl AgreementKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let mut arr = key_array(bytes)?;
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Get the secret key as raw bytes. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 with a remote public key given as raw bytes.
    pub fn diffie_hellman(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let remote = PublicKey::from(key_array(remote_public)?);
        let shared = self.secret.diffie_hellman(&remote);
        if !shared.was_contributory() {
            return Err(SecureChatError::InvalidKey(
                "remote public key is a low-order point".into(),
            ));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}
