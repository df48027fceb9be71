//! Transaction signing and verification.
//!
//! The signature primitive sits behind [`SignatureScheme`]: hash the canonical
//! transaction bytes, then check a signature over that digest against a public
//! key. [`Ed25519Scheme`] is the production implementation. The policy for
//! *which* key a transaction must verify against lives in [`TransactionVerifier`].

use crate::error::CryptoError;
use crate::types::{SignedTransaction, Transaction};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;

pub type Digest = [u8; 32];

/// Hashing and signature verification over transaction bytes.
pub trait SignatureScheme: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> Digest;

    /// Returns true when `signature` is a valid signature of `digest` by `public_key`.
    /// Malformed keys or signatures are simply invalid.
    fn verify(&self, digest: &Digest, signature: &str, public_key: &str) -> bool;
}

/// SHA-256 digests signed with ed25519, keys and signatures hex encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Scheme;

impl SignatureScheme for Ed25519Scheme {
    fn hash(&self, bytes: &[u8]) -> Digest {
        Sha256::digest(bytes).into()
    }

    fn verify(&self, digest: &Digest, signature: &str, public_key: &str) -> bool {
        let key = match parse_public_key(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match parse_signature(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        key.verify(digest, &signature).is_ok()
    }
}

fn parse_public_key(public_key: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(public_key)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

fn parse_signature(signature: &str) -> Result<Signature, CryptoError> {
    let bytes =
        hex::decode(signature).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    Signature::from_slice(&bytes).map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

/// The node's own signing identity.
pub struct NodeKeys {
    signing_key: SigningKey,
}

impl NodeKeys {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Hex-encoded public key; this is the node's account identifier.
    pub fn public_key(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a digest. The result is always 128 hex characters.
    pub fn sign(&self, digest: &Digest) -> String {
        hex::encode(self.signing_key.sign(digest).to_bytes())
    }

    pub fn sign_transaction(
        &self,
        scheme: &dyn SignatureScheme,
        transaction: Transaction,
    ) -> Result<SignedTransaction, CryptoError> {
        let digest = scheme.hash(&transaction.canonical_bytes()?);
        Ok(SignedTransaction {
            signature: self.sign(&digest),
            transaction,
        })
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Which public key a transaction signature is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// The key named in the `From` field. Binds the signature to the debited account.
    #[default]
    Sender,
    /// Any key this node knows about. Does not bind the signature to the sender.
    AnyKnown,
}

/// Applies a [`VerificationPolicy`] on top of a [`SignatureScheme`].
pub struct TransactionVerifier {
    scheme: Arc<dyn SignatureScheme>,
    policy: VerificationPolicy,
    known_keys: Mutex<Vec<String>>,
}

impl TransactionVerifier {
    pub fn new(scheme: Arc<dyn SignatureScheme>, policy: VerificationPolicy) -> Self {
        Self {
            scheme,
            policy,
            known_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn scheme(&self) -> &dyn SignatureScheme {
        self.scheme.as_ref()
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    /// Remember a public key for the `AnyKnown` policy. Returns false if already known.
    pub fn register_key(&self, public_key: &str) -> bool {
        let public_key = public_key.to_ascii_lowercase();
        let mut keys = self.known_keys.lock();
        if keys.contains(&public_key) {
            return false;
        }
        keys.push(public_key);
        true
    }

    pub fn known_keys(&self) -> Vec<String> {
        self.known_keys.lock().clone()
    }

    pub fn verify(&self, signed: &SignedTransaction) -> bool {
        let bytes = match signed.transaction.canonical_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Cannot encode transaction {}: {}", signed.id(), e);
                return false;
            }
        };
        let digest = self.scheme.hash(&bytes);

        match self.policy {
            VerificationPolicy::Sender => {
                self.scheme
                    .verify(&digest, &signed.signature, &signed.transaction.from)
            }
            VerificationPolicy::AnyKnown => {
                let keys = self.known_keys();
                keys.iter()
                    .any(|key| self.scheme.verify(&digest, &signed.signature, key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_by(keys: &NodeKeys, to: &str, amount: i64) -> SignedTransaction {
        let tx = Transaction::new("tx1", keys.public_key(), to, amount);
        keys.sign_transaction(&Ed25519Scheme, tx).unwrap()
    }

    #[test]
    fn test_signature_is_fixed_width() {
        let keys = NodeKeys::generate();
        let signed = signed_by(&keys, "bob", 5);
        assert_eq!(signed.signature.len(), 128);
        assert_eq!(keys.public_key().len(), 64);
    }

    #[test]
    fn test_sender_policy_accepts_own_signature() {
        let keys = NodeKeys::generate();
        let verifier = TransactionVerifier::new(Arc::new(Ed25519Scheme), VerificationPolicy::Sender);
        assert!(verifier.verify(&signed_by(&keys, "bob", 5)));
    }

    #[test]
    fn test_tampered_amount_is_rejected() {
        let keys = NodeKeys::generate();
        let verifier = TransactionVerifier::new(Arc::new(Ed25519Scheme), VerificationPolicy::Sender);

        let mut signed = signed_by(&keys, "bob", 5);
        signed.transaction.amount = 500;
        assert!(!verifier.verify(&signed));
    }

    #[test]
    fn test_sender_policy_rejects_spoofed_sender() {
        let alice = NodeKeys::generate();
        let mallory = NodeKeys::generate();
        let verifier = TransactionVerifier::new(Arc::new(Ed25519Scheme), VerificationPolicy::Sender);

        // Mallory signs a transfer that claims to debit Alice.
        let tx = Transaction::new("tx1", alice.public_key(), "mallory", 100);
        let spoofed = mallory.sign_transaction(&Ed25519Scheme, tx).unwrap();
        assert!(!verifier.verify(&spoofed));
    }

    #[test]
    fn test_any_known_policy_accepts_any_registered_key() {
        let alice = NodeKeys::generate();
        let mallory = NodeKeys::generate();
        let verifier =
            TransactionVerifier::new(Arc::new(Ed25519Scheme), VerificationPolicy::AnyKnown);

        let tx = Transaction::new("tx1", alice.public_key(), "mallory", 100);
        let spoofed = mallory.sign_transaction(&Ed25519Scheme, tx).unwrap();

        assert!(!verifier.verify(&spoofed));
        assert!(verifier.register_key(&mallory.public_key()));
        assert!(!verifier.register_key(&mallory.public_key()));
        assert!(verifier.verify(&spoofed));
    }

    #[test]
    fn test_malformed_key_and_signature_are_invalid() {
        let scheme = Ed25519Scheme;
        let digest = scheme.hash(b"payload");
        assert!(!scheme.verify(&digest, "zz", "not-hex"));
        assert!(!scheme.verify(&digest, &"00".repeat(64), &"11".repeat(31)));
    }
}
