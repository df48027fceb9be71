//! A running ledger node: listener, connections, directory, router and ledger
//! wired together under one shutdown manager.

use crate::config::Config;
use crate::crypto::{Ed25519Scheme, NodeKeys, SignatureScheme, TransactionVerifier};
use crate::dedup::TransactionDedupStore;
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::network::connection_manager::{ConnectionManager, InboundHandler};
use crate::network::flood_router::{Disposition, FloodRouter};
use crate::network::peer_directory::{JoinState, PeerDirectory};
use crate::shutdown::ShutdownManager;
use crate::types::{AccountId, SignedTransaction, Transaction, TransactionIdGenerator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Node {
    address: String,
    keys: NodeKeys,
    shutdown: ShutdownManager,
    connections: Arc<ConnectionManager>,
    directory: Arc<PeerDirectory>,
    ledger: Arc<Ledger>,
    verifier: Arc<TransactionVerifier>,
    router: Arc<FloodRouter>,
    ids: TransactionIdGenerator,
}

impl Node {
    /// Start a node with a freshly generated identity.
    pub async fn start(config: Config) -> Result<Self, AppError> {
        Self::start_with_keys(config, NodeKeys::generate()).await
    }

    pub async fn start_with_keys(config: Config, keys: NodeKeys) -> Result<Self, AppError> {
        Self::start_with(config, keys, Arc::new(Ed25519Scheme)).await
    }

    /// Bind, start the background tasks and join the network.
    ///
    /// A bootstrap peer that cannot be reached is not an error: the node falls
    /// back to dialing itself and forms a network of one.
    pub async fn start_with(
        config: Config,
        keys: NodeKeys,
        scheme: Arc<dyn SignatureScheme>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let shutdown = ShutdownManager::new();
        let connections = Arc::new(ConnectionManager::new(
            config.network.connection_settings(),
            shutdown.clone(),
        ));

        let listener = connections.bind(&config.network.listen_address).await?;
        let local = listener.local_addr()?;
        let address = match &config.network.advertise_address {
            Some(address) => address.clone(),
            None => advertised_address(local),
        };
        connections.set_local_address(address.clone());
        info!("Node {} listening on {} as {}", config.node.name, local, address);

        let directory = Arc::new(PeerDirectory::new(
            address.clone(),
            config.network.max_fanout,
            connections.clone(),
        ));
        let ledger = Arc::new(Ledger::with_policy(config.ledger.overdraft));
        for (account, amount) in &config.ledger.initial_balances {
            ledger.deposit(account, *amount)?;
        }
        let verifier = Arc::new(TransactionVerifier::new(
            scheme,
            config.security.verification,
        ));
        let public_key = keys.public_key();
        verifier.register_key(&public_key);

        let router = Arc::new(FloodRouter::new(
            connections.clone(),
            directory.clone(),
            ledger.clone(),
            Arc::new(TransactionDedupStore::new()),
            verifier.clone(),
            config.flood.settings(),
            Some(public_key),
        ));
        let handler: Arc<dyn InboundHandler> = router.clone();
        connections.bind_handler(Arc::downgrade(&handler));

        connections.start_fanout();
        connections.listen(listener);

        if let Err(e) = directory.begin_join(config.network.bootstrap.as_deref()).await {
            shutdown.shutdown(SHUTDOWN_TIMEOUT).await;
            return Err(e.into());
        }

        Ok(Self {
            address,
            keys,
            shutdown,
            connections,
            directory,
            ledger,
            verifier,
            router,
            ids: TransactionIdGenerator::new(),
        })
    }

    /// Create, sign and submit a transfer originating at this node.
    pub async fn transfer(
        &self,
        amount: i64,
        from: impl Into<AccountId>,
        to: impl Into<AccountId>,
    ) -> Result<Disposition, AppError> {
        let from = from.into();
        let id = self.ids.next_id(&from);
        let transaction = Transaction::new(id, from, to, amount);
        let signed = self
            .keys
            .sign_transaction(self.verifier.scheme(), transaction)?;
        Ok(self.submit(signed).await)
    }

    /// Submit an already signed transaction as if it were created here.
    pub async fn submit(&self, signed: SignedTransaction) -> Disposition {
        let disposition = self.router.submit_local(signed).await;
        if disposition != Disposition::Applied {
            warn!("Local transaction not applied: {:?}", disposition);
        }
        disposition
    }

    /// The address other peers dial to reach this node
    pub fn address(&self) -> &str {
        &self.address
    }

    /// This node's account identifier
    pub fn public_key(&self) -> String {
        self.keys.public_key()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn verifier(&self) -> &Arc<TransactionVerifier> {
        &self.verifier
    }

    pub fn join_state(&self) -> JoinState {
        self.directory.join_state()
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// Stop accepting, close every connection and wait for all tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.address);
        self.shutdown.shutdown(SHUTDOWN_TIMEOUT).await;
    }
}

/// Peers cannot dial an unspecified address, so advertise loopback instead.
fn advertised_address(local: SocketAddr) -> String {
    if local.ip().is_unspecified() {
        let loopback = if local.is_ipv4() {
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        } else {
            std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
        };
        SocketAddr::new(loopback, local.port()).to_string()
    } else {
        local.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_address_advertises_loopback() {
        let local: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(advertised_address(local), "127.0.0.1:7000");

        let local: SocketAddr = "[::]:7000".parse().unwrap();
        assert_eq!(advertised_address(local), "[::1]:7000");

        let local: SocketAddr = "192.168.1.5:7000".parse().unwrap();
        assert_eq!(advertised_address(local), "192.168.1.5:7000");
    }

    #[tokio::test]
    async fn test_initial_balances_are_seeded() {
        let mut config = Config::default();
        config.ledger.initial_balances.insert("alice".to_string(), 50);
        let node = Node::start(config).await.unwrap();

        assert_eq!(node.ledger().balance("alice"), Some(50));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_key_is_known() {
        let node = Node::start(Config::default()).await.unwrap();
        assert_eq!(node.verifier().known_keys(), vec![node.public_key()]);
        node.shutdown().await;
    }
}
