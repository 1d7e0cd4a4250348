//! Symmetric chain ratchet and per-message AEAD.
//!
//! Each [`ChainKey::advance`] derives the message key for the current index
//! and replaces the chain key with its successor. The previous chain key is
//! zeroized, so a message key can never be re-derived from a later state.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecureChatError};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key.
const CHAIN_LABEL: &[u8] = b"securechat-chain";

/// Label for deriving a message key.
const MESSAGE_LABEL: &[u8] = b"securechat-message";

/// HKDF info expanding a message key into cipher key and nonce.
const MESSAGE_KEYS_INFO: &[u8] = b"securechat-message-keys-v1";

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

fn hmac_label(key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// One direction's chain: the current chain key and the index of the next
/// message key it will produce.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    index: u64,
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey")
            .field("index", &self.index)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ChainKey {
    pub const fn new(key: [u8; 32], index: u64) -> Self {
        Self { key, index }
    }

    pub const fn index(&self) -> u64 {
        self.index
    }

    pub const fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Produce the message key for the current index and step the chain.
    pub fn advance(&mut self) -> Result<MessageKey> {
        let next_index = self.index.checked_add(1).ok_or_else(|| {
            SecureChatError::KeyDerivationFailed("chain index exhausted".into())
        })?;
        let message_key = MessageKey {
            key: hmac_label(&self.key, MESSAGE_LABEL),
            index: self.index,
        };
        let mut next = hmac_label(&self.key, CHAIN_LABEL);
        self.key.zeroize();
        self.key = next;
        next.zeroize();
        self.index = next_index;
        Ok(message_key)
    }

    /// Step forward so the next [`advance`](Self::advance) yields `target`.
    ///
    /// Skipped message keys are discarded, not retained.
    pub fn skip_to(&mut self, target: u64, max_skip: u64) -> Result<()> {
        if target < self.index {
            return Err(SecureChatError::ReplayedMessage {
                counter: target,
                expected: self.index,
            });
        }
        if target - self.index > max_skip {
            return Err(SecureChatError::InvalidMessage(format!(
                "counter {target} is more than {max_skip} ahead of {}",
                self.index
            )));
        }
        while self.index < target {
            self.advance()?;
        }
        Ok(())
    }
}

/// Single-use key for one message.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; 32],
    index: u64,
}

impl MessageKey {
    pub const fn index(&self) -> u64 {
        self.index
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub const fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    fn cipher_and_nonce(&self) -> Result<(ChaCha20Poly1305, [u8; NONCE_SIZE])> {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut okm = [0u8; 32 + NONCE_SIZE];
        hk.expand(MESSAGE_KEYS_INFO, &mut okm)
            .map_err(|e| SecureChatError::KeyDerivationFailed(e.to_string()))?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..32]));
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok((cipher, nonce))
    }

    /// Encrypt `plaintext`, authenticating `associated_data`.
    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let (cipher, nonce) = self.cipher_and_nonce()?;
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|e| SecureChatError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt and authenticate `ciphertext`.
    pub fn open(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let (cipher, nonce) = self.cipher_and_nonce()?;
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|e| SecureChatError::DecryptionFailed(e.to_string()))
    }
}
