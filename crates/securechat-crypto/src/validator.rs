//! Card signature validation.
//!
//! Identity cards are self-signed. Long-term and one-time cards are signed by
//! their owner's identity card. A validator can additionally require
//! signatures from trusted services such as the directory itself.

use std::collections::BTreeMap;

use tracing::warn;

use crate::card::{Card, CredentialSet};
use crate::error::{Result, SecureChatError};
use crate::keys::verify_signature;

#[derive(Debug, Clone, Default)]
pub struct CardValidator {
    /// Extra signer id to Ed25519 public key; every card must carry each.
    verifiers: BTreeMap<String, Vec<u8>>,
}

impl CardValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a valid signature from `signer_id` on every card.
    #[must_use]
    pub fn with_verifier(mut self, signer_id: impl Into<String>, public_key: &[u8]) -> Self {
        self.verifiers.insert(signer_id.into(), public_key.to_vec());
        self
    }

    /// Check the self-signature of an identity card.
    pub fn validate_identity_card(&self, card: &Card) -> Result<()> {
        verify_card_signature(card, card.id(), card.public_key_data())?;
        self.verify_extra(card)
    }

    /// Check a long-term or one-time card against its owner's identity card.
    pub fn validate_owned_card(&self, card: &Card, identity_card: &Card) -> Result<()> {
        if card.identity() != identity_card.identity() {
            return Err(SecureChatError::SignatureVerificationFailed(format!(
                "card {} belongs to {:?}, identity card to {:?}",
                card.id(),
                card.identity(),
                identity_card.identity()
            )));
        }
        verify_card_signature(card, identity_card.id(), identity_card.public_key_data())?;
        self.verify_extra(card)
    }

    /// Check every card of a credential set.
    pub fn validate_credentials(&self, set: &CredentialSet) -> Result<()> {
        self.validate_identity_card(&set.identity_card)?;
        self.validate_owned_card(&set.long_term_card, &set.identity_card)?;
        if let Some(one_time) = &set.one_time_card {
            self.validate_owned_card(one_time, &set.identity_card)?;
        }
        Ok(())
    }

    fn verify_extra(&self, card: &Card) -> Result<()> {
        for (signer_id, public_key) in &self.verifiers {
            verify_card_signature(card, signer_id, public_key)?;
        }
        Ok(())
    }
}

fn verify_card_signature(card: &Card, signer_id: &str, public_key: &[u8]) -> Result<()> {
    let Some(signature) = card.signature(signer_id) else {
        warn!(card_id = %card.id(), signer = %signer_id, "Card is missing a required signature");
        return Err(SecureChatError::SignatureVerificationFailed(format!(
            "card {} has no signature from {signer_id}",
            card.id()
        )));
    };
    verify_signature(public_key, card.snapshot_bytes(), signature).inspect_err(|_| {
        warn!(card_id = %card.id(), signer = %signer_id, "Card signature is invalid");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::card::CardRecord;
    use crate::issuer::EphemeralCardRequest;
    use crate::keys::{AgreementKeyPair, IdentityKeyPair};

    fn publish(request: &EphemeralCardRequest) -> Card {
        let wire = request.to_publish_request();
        let record = CardRecord {
            id: request.card_id(),
            content_snapshot: wire.content_snapshot,
            meta: crate::card::CardMeta {
                signatures: wire.signatures,
                created_at: request.snapshot().created_at,
                version: request.snapshot().version.clone(),
            },
        };
        Card::from_record(&record).unwrap()
    }

    fn identity_card(identity: &str, key: &IdentityKeyPair) -> Card {
        let mut request =
            EphemeralCardRequest::build(identity, "username", &key.public_bytes(), None, None)
                .unwrap();
        let id = request.card_id();
        request.sign_with(&id, key);
        publish(&request)
    }

    fn owned_card(identity: &str, key: &IdentityKeyPair, ic: &Card) -> Card {
        let agreement = AgreementKeyPair::generate();
        let mut request = EphemeralCardRequest::build(
            identity,
            "username",
            &agreement.public_bytes(),
            None,
            None,
        )
        .unwrap();
        request.sign_with(ic.id(), key);
        publish(&request)
    }

    #[test]
    fn valid_credentials_pass() {
        let key = IdentityKeyPair::generate();
        let ic = identity_card("bob", &key);
        let set = CredentialSet {
            long_term_card: owned_card("bob", &key, &ic),
            one_time_card: Some(owned_card("bob", &key, &ic)),
            identity_card: ic,
        };
        CardValidator::new().validate_credentials(&set).unwrap();
    }

    #[test]
    fn card_signed_by_other_identity_fails() {
        let key = IdentityKeyPair::generate();
        let ic = identity_card("bob", &key);
        let mallory = IdentityKeyPair::generate();
        let forged = owned_card("bob", &mallory, &ic);

        let err = CardValidator::new()
            .validate_owned_card(&forged, &ic)
            .unwrap_err();
        assert!(matches!(err, SecureChatError::SignatureVerificationFailed(_)));
    }

    #[test]
    fn card_of_other_identity_fails() {
        let key = IdentityKeyPair::generate();
        let ic = identity_card("bob", &key);
        let other = owned_card("carol", &key, &ic);
        assert!(CardValidator::new().validate_owned_card(&other, &ic).is_err());
    }

    #[test]
    fn missing_required_verifier_signature_fails() {
        let key = IdentityKeyPair::generate();
        let ic = identity_card("bob", &key);
        let service = IdentityKeyPair::generate();
        let validator = CardValidator::new().with_verifier("directory", &service.public_bytes());

        let err = validator.validate_identity_card(&ic).unwrap_err();
        assert!(matches!(err, SecureChatError::SignatureVerificationFailed(_)));
    }
}
