//! Envelope dispatch and transaction flooding.
//!
//! Inbound lines are decoded once into an [`Envelope`] and matched on. A
//! transaction is verified, checked against the dedup store, applied to the
//! ledger and then re-broadcast as the exact frame that arrived. The dedup store
//! is what stops the flood: a node forwards each transaction ID at most once.

use crate::crypto::TransactionVerifier;
use crate::dedup::TransactionDedupStore;
use crate::error::{LedgerError, WireError};
use crate::ledger::Ledger;
use crate::network::connection_manager::{
    ConnectionDirection, ConnectionManager, FrameAction, InboundHandler, PeerHandle,
};
use crate::network::message::Envelope;
use crate::network::peer_directory::PeerDirectory;
use crate::network::wire::{self, Frame};
use crate::types::SignedTransaction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct FloodSettings {
    /// Do not send a re-flooded envelope back on the connection it arrived on
    pub skip_origin: bool,
    /// Re-flood `newpeer` announcements that added a new address
    pub relay_announcements: bool,
}

impl Default for FloodSettings {
    fn default() -> Self {
        Self {
            skip_origin: false,
            relay_announcements: true,
        }
    }
}

/// Outcome of handling one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Applied to the ledger and re-broadcast
    Applied,
    Duplicate,
    InvalidSignature,
    /// Verified and new, but the ledger refused it
    Rejected(LedgerError),
}

pub struct FloodRouter {
    connections: Arc<ConnectionManager>,
    directory: Arc<PeerDirectory>,
    ledger: Arc<Ledger>,
    dedup: Arc<TransactionDedupStore>,
    verifier: Arc<TransactionVerifier>,
    settings: FloodSettings,
    /// Our own key, carried in `newpeer` announcements
    public_key: Option<String>,
}

impl FloodRouter {
    pub fn new(
        connections: Arc<ConnectionManager>,
        directory: Arc<PeerDirectory>,
        ledger: Arc<Ledger>,
        dedup: Arc<TransactionDedupStore>,
        verifier: Arc<TransactionVerifier>,
        settings: FloodSettings,
        public_key: Option<String>,
    ) -> Self {
        Self {
            connections,
            directory,
            ledger,
            dedup,
            verifier,
            settings,
            public_key,
        }
    }

    /// Dispatch a decoded envelope. `frame` is the encoded form as received,
    /// reused verbatim when the envelope is forwarded.
    pub async fn dispatch(&self, envelope: Envelope, origin: Option<&PeerHandle>, frame: Option<Frame>) {
        debug!(
            "Dispatching {} from {}",
            envelope.message_type(),
            origin.map_or("local", |peer| peer.address.as_str())
        );
        match envelope {
            Envelope::PeerList { list, keys } => self.handle_peer_list(list, keys, origin).await,
            Envelope::NewPeer {
                address,
                public_key,
            } => {
                self.handle_new_peer(address, public_key, origin, frame)
                    .await
            }
            Envelope::Transaction(tx) => {
                self.handle_transaction(tx, origin, frame).await;
            }
        }
    }

    /// Handle a transaction created on this node.
    pub async fn submit_local(&self, tx: SignedTransaction) -> Disposition {
        self.handle_transaction(tx, None, None).await
    }

    pub async fn handle_transaction(
        &self,
        tx: SignedTransaction,
        origin: Option<&PeerHandle>,
        frame: Option<Frame>,
    ) -> Disposition {
        if !self.verifier.verify(&tx) {
            debug!("Dropping transaction {} with invalid signature", tx.id());
            return Disposition::InvalidSignature;
        }

        if self.dedup.check_and_mark(tx.id()) {
            debug!("Transaction {} already processed", tx.id());
            return Disposition::Duplicate;
        }

        if let Err(e) = self.ledger.apply(&tx.transaction) {
            warn!("Transaction {} not applied: {}", tx.id(), e);
            return Disposition::Rejected(e);
        }
        info!(
            "Applied transaction {}: {} -> {} amount {}",
            tx.id(),
            tx.transaction.from,
            tx.transaction.to,
            tx.transaction.amount
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.ledger.print_ledger();
        }

        let frame = match frame {
            Some(frame) => frame,
            None => match wire::encode(&Envelope::Transaction(tx)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode transaction for flooding: {}", e);
                    return Disposition::Applied;
                }
            },
        };
        self.flood(frame, origin).await;
        Disposition::Applied
    }

    async fn handle_peer_list(&self, list: Vec<String>, keys: Vec<String>, origin: Option<&PeerHandle>) {
        for key in &keys {
            self.verifier.register_key(key);
        }

        let Some(address) = self.directory.handle_peer_list(list, origin).await else {
            return;
        };

        info!("Joined network, announcing {}", address);
        let announcement = Envelope::new_peer(address, self.public_key.clone());
        match wire::encode(&announcement) {
            Ok(frame) => self.connections.broadcast(frame).await,
            Err(e) => warn!("Failed to encode announcement: {}", e),
        }
    }

    async fn handle_new_peer(
        &self,
        address: String,
        public_key: Option<String>,
        origin: Option<&PeerHandle>,
        frame: Option<Frame>,
    ) {
        if let Some(key) = &public_key {
            self.verifier.register_key(key);
        }

        if !self.directory.handle_new_peer(&address) {
            return;
        }
        info!("New peer announced: {}", address);

        if !self.settings.relay_announcements {
            return;
        }
        let frame = match frame {
            Some(frame) => frame,
            None => match wire::encode(&Envelope::new_peer(address, public_key)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode announcement: {}", e);
                    return;
                }
            },
        };
        self.flood(frame, origin).await;
    }

    async fn flood(&self, frame: Frame, origin: Option<&PeerHandle>) {
        match origin {
            Some(peer) if self.settings.skip_origin => {
                self.connections.broadcast_except(frame, peer.id).await
            }
            _ => self.connections.broadcast(frame).await,
        }
    }

    /// Our current peer list and known keys, encoded for sending.
    pub fn peer_list_frame(&self) -> Option<Frame> {
        let envelope = Envelope::peer_list(self.directory.peers(), self.verifier.known_keys());
        match wire::encode(&envelope) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Failed to encode peer list: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl InboundHandler for FloodRouter {
    /// The accepting side greets every newcomer with its peer list.
    fn greeting(&self, peer: &PeerHandle) -> Option<Frame> {
        match peer.direction {
            ConnectionDirection::Inbound => self.peer_list_frame(),
            ConnectionDirection::Outbound => None,
        }
    }

    async fn on_frame(&self, peer: &PeerHandle, frame: String) -> FrameAction {
        match wire::decode(&frame) {
            Ok(Some(envelope)) => {
                let mut frame = frame;
                frame.push('\n');
                self.dispatch(envelope, Some(peer), Some(Frame::from(frame)))
                    .await;
                FrameAction::Continue
            }
            Ok(None) => FrameAction::Continue,
            Err(WireError::Corrupt(e)) => {
                warn!("Corrupt stream from {}: {}", peer.address, e);
                FrameAction::Close
            }
            Err(e) => {
                warn!("Dropping message from {}: {}", peer.address, e);
                FrameAction::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Digest, SignatureScheme, VerificationPolicy};
    use crate::network::connection_manager::ConnectionSettings;
    use crate::shutdown::ShutdownManager;
    use crate::types::Transaction;

    /// Accepts every signature except the literal "bad".
    struct PermissiveScheme;

    impl SignatureScheme for PermissiveScheme {
        fn hash(&self, bytes: &[u8]) -> Digest {
            let mut digest = [0u8; 32];
            for (i, b) in bytes.iter().enumerate() {
                digest[i % 32] ^= *b;
            }
            digest
        }

        fn verify(&self, _digest: &Digest, signature: &str, _public_key: &str) -> bool {
            signature != "bad"
        }
    }

    fn router() -> FloodRouter {
        router_with(Ledger::new())
    }

    fn router_with(ledger: Ledger) -> FloodRouter {
        let connections = Arc::new(ConnectionManager::new(
            ConnectionSettings::default(),
            ShutdownManager::new(),
        ));
        let directory = Arc::new(PeerDirectory::new(
            "127.0.0.1:1".to_string(),
            10,
            connections.clone(),
        ));
        let verifier = Arc::new(TransactionVerifier::new(
            Arc::new(PermissiveScheme),
            VerificationPolicy::Sender,
        ));
        FloodRouter::new(
            connections,
            directory,
            Arc::new(ledger),
            Arc::new(TransactionDedupStore::new()),
            verifier,
            FloodSettings::default(),
            None,
        )
    }

    fn signed(id: &str, from: &str, to: &str, amount: i64) -> SignedTransaction {
        SignedTransaction {
            transaction: Transaction::new(id, from, to, amount),
            signature: "ok".to_string(),
        }
    }

    fn inbound_peer() -> PeerHandle {
        PeerHandle {
            id: 7,
            address: "127.0.0.1:5555".to_string(),
            direction: ConnectionDirection::Inbound,
        }
    }

    #[tokio::test]
    async fn test_first_delivery_applies() {
        let router = router();
        let disposition = router
            .handle_transaction(signed("tx1", "alice", "bob", 20), None, None)
            .await;

        assert_eq!(disposition, Disposition::Applied);
        assert_eq!(router.ledger.balance("alice"), Some(-20));
        assert_eq!(router.ledger.balance("bob"), Some(20));
    }

    #[tokio::test]
    async fn test_same_id_different_payload_is_dropped() {
        let router = router();
        router
            .handle_transaction(signed("tx1", "alice", "bob", 20), None, None)
            .await;
        let before = router.ledger.snapshot();

        let disposition = router
            .handle_transaction(signed("tx1", "alice", "carol", 5), None, None)
            .await;

        assert_eq!(disposition, Disposition::Duplicate);
        assert_eq!(router.ledger.snapshot(), before);
        assert!(!router.ledger.contains_account("carol"));
    }

    #[tokio::test]
    async fn test_invalid_signature_is_not_marked_seen() {
        let router = router();
        let mut forged = signed("tx1", "alice", "bob", 20);
        forged.signature = "bad".to_string();

        assert_eq!(
            router.handle_transaction(forged, None, None).await,
            Disposition::InvalidSignature
        );
        assert!(!router.dedup.contains("tx1"));
        assert!(router.ledger.snapshot().is_empty());

        // The genuine transaction with that ID still goes through.
        assert_eq!(
            router
                .handle_transaction(signed("tx1", "alice", "bob", 20), None, None)
                .await,
            Disposition::Applied
        );
    }

    #[tokio::test]
    async fn test_inbound_frames_dispatch_by_type() {
        let router = router();
        let peer = inbound_peer();

        let tx = r#"{"Type":"transaction","ID":"tx9","From":"a","To":"b","Amount":3,"Signature":"ok"}"#;
        assert_eq!(router.on_frame(&peer, tx.to_string()).await, FrameAction::Continue);
        assert_eq!(router.ledger.balance("b"), Some(3));

        let announce = r#"{"Type":"newpeer","Address":"127.0.0.1:4242"}"#;
        assert_eq!(router.on_frame(&peer, announce.to_string()).await, FrameAction::Continue);
        assert!(router.directory.contains("127.0.0.1:4242"));
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_connection_open() {
        let router = router();
        let action = router
            .on_frame(&inbound_peer(), r#"{"Type":"ping"}"#.to_string())
            .await;
        assert_eq!(action, FrameAction::Continue);
    }

    #[tokio::test]
    async fn test_corrupt_frame_closes_connection() {
        let router = router();
        let action = router
            .on_frame(&inbound_peer(), "}{ definitely not json".to_string())
            .await;
        assert_eq!(action, FrameAction::Close);
    }

    #[tokio::test]
    async fn test_announced_keys_are_registered() {
        let router = router();
        let announce = r#"{"Type":"newpeer","Address":"127.0.0.1:4242","PublicKey":"abcd"}"#;
        router.on_frame(&inbound_peer(), announce.to_string()).await;
        assert_eq!(router.verifier.known_keys(), vec!["abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_only_inbound_connections_are_greeted() {
        let router = router();
        router.directory.handle_new_peer("127.0.0.1:2");

        let frame = router.greeting(&inbound_peer()).unwrap();
        assert_eq!(
            wire::decode(frame.trim_end()).unwrap().unwrap(),
            Envelope::peer_list(vec!["127.0.0.1:2".to_string()], vec![])
        );

        let outbound = PeerHandle {
            direction: ConnectionDirection::Outbound,
            ..inbound_peer()
        };
        assert!(router.greeting(&outbound).is_none());
    }

    #[tokio::test]
    async fn test_negative_transfer_rejected_under_reject_policy() {
        let router = router_with(Ledger::with_policy(crate::ledger::OverdraftPolicy::Reject));

        let disposition = router
            .handle_transaction(signed("tx1", "mallory", "victim", -50), None, None)
            .await;
        let expected = Disposition::Rejected(LedgerError::NegativeAmount(-50));
        assert_eq!(disposition.clone(), expected);

        assert!(router.ledger.snapshot().is_empty());
        // Seen even though rejected, so a replay is a duplicate.
        assert_eq!(
            router
                .handle_transaction(signed("tx1", "mallory", "victim", -50), None, None)
                .await,
            Disposition::Duplicate
        );
    }
}
