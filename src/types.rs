use crate::error::CryptoError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Account identifier. Accounts created by this node are hex-encoded ed25519 public keys.
pub type AccountId = String;

/// A balance transfer between two accounts.
///
/// Field order is fixed: it defines the canonical bytes that get hashed and signed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "From")]
    pub from: AccountId,
    #[serde(rename = "To")]
    pub to: AccountId,
    #[serde(rename = "Amount")]
    pub amount: i64,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<AccountId>,
        to: impl Into<AccountId>,
        amount: i64,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            amount,
        }
    }

    /// Canonical byte encoding of `{ID, From, To, Amount}` used for hashing.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(bincode::serialize(self)?)
    }
}

/// A transaction together with the signature over its canonical digest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    /// Hex-encoded signature, fixed width for a given scheme.
    #[serde(rename = "Signature")]
    pub signature: String,
}

impl SignedTransaction {
    pub fn id(&self) -> &str {
        &self.transaction.id
    }
}

/// Builds transaction IDs from the sender, a per-node monotonic counter and a random salt.
///
/// IDs are the only deduplication key, so two senders that produce the same ID
/// are indistinguishable from a retransmission.
#[derive(Debug, Default)]
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, sender: &str) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::thread_rng().gen();
        // Short sender prefix keeps IDs readable when the sender is a full public key.
        let prefix: String = sender.chars().take(16).collect();
        format!("{}-{}-{:08x}", prefix, sequence, salt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_json_field_names() {
        let tx = Transaction::new("tx1", "alice", "bob", 20);
        let signed = SignedTransaction {
            transaction: tx,
            signature: "abcd".to_string(),
        };

        let json = serde_json::to_value(&signed).unwrap();
        assert_eq!(json["ID"], "tx1");
        assert_eq!(json["From"], "alice");
        assert_eq!(json["To"], "bob");
        assert_eq!(json["Amount"], 20);
        assert_eq!(json["Signature"], "abcd");
    }

    #[test]
    fn test_canonical_bytes_depend_on_every_field() {
        let base = Transaction::new("tx1", "alice", "bob", 20);
        let bytes = base.canonical_bytes().unwrap();

        let variants = [
            Transaction::new("tx2", "alice", "bob", 20),
            Transaction::new("tx1", "carol", "bob", 20),
            Transaction::new("tx1", "alice", "carol", 20),
            Transaction::new("tx1", "alice", "bob", 21),
        ];
        for variant in variants {
            assert_ne!(variant.canonical_bytes().unwrap(), bytes);
        }
        assert_eq!(base.clone().canonical_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_id_generator_is_monotonic_per_sender() {
        let ids = TransactionIdGenerator::new();
        let first = ids.next_id("alice");
        let second = ids.next_id("alice");

        assert!(first.starts_with("alice-0-"));
        assert!(second.starts_with("alice-1-"));
        assert_ne!(first, second);
    }
}
