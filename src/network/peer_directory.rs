//! Known peer addresses and the join protocol.
//!
//! A node starts `Unjoined`, becomes `Joining` once it dials its bootstrap
//! target, and `Joined` when it adopts the first peer list it receives. It then
//! connects to the most recent entries of that list (bounded by the fan-out
//! limit) and appends its own address. The list only ever grows.

use crate::error::DialError;
use crate::network::connection_manager::{ConnectionManager, PeerHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of peers a joining node connects to
pub const DEFAULT_MAX_FANOUT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    Joining,
    Joined,
}

struct DirectoryState {
    peers: Vec<String>,
    join_state: JoinState,
}

pub struct PeerDirectory {
    state: Mutex<DirectoryState>,
    own_address: String,
    max_fanout: usize,
    connections: Arc<ConnectionManager>,
}

/// The peers a joining node dials: the last `max_fanout` entries, in list order.
pub fn select_join_targets(peers: &[String], max_fanout: usize) -> Vec<String> {
    let start = peers.len().saturating_sub(max_fanout);
    peers[start..].to_vec()
}

impl PeerDirectory {
    pub fn new(own_address: String, max_fanout: usize, connections: Arc<ConnectionManager>) -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                peers: Vec::new(),
                join_state: JoinState::Unjoined,
            }),
            own_address,
            max_fanout,
            connections,
        }
    }

    pub fn join_state(&self) -> JoinState {
        self.state.lock().join_state
    }

    /// Snapshot of known addresses in insertion order
    pub fn peers(&self) -> Vec<String> {
        self.state.lock().peers.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &str) -> bool {
        self.state.lock().peers.iter().any(|peer| peer == address)
    }

    /// Dial the bootstrap target, or our own endpoint when there is none.
    /// An unreachable bootstrap falls back to our own endpoint as well.
    pub async fn begin_join(&self, bootstrap: Option<&str>) -> Result<PeerHandle, DialError> {
        {
            let mut state = self.state.lock();
            if state.join_state == JoinState::Joined {
                debug!("Already joined, ignoring join request");
            } else {
                state.join_state = JoinState::Joining;
            }
        }

        let target = bootstrap.unwrap_or(&self.own_address);
        info!("Joining network via {}", target);

        match self.connections.dial(target).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let mut state = self.state.lock();
                if state.join_state == JoinState::Joining {
                    state.join_state = JoinState::Unjoined;
                }
                Err(e)
            }
        }
    }

    /// Adopt a received peer list if we have not joined yet.
    ///
    /// Dials the selected subset, then appends our own address. `via` is the
    /// connection the list arrived on; it is closed once at least one selected
    /// peer is connected and it is not itself among the selection, so the node
    /// ends up connected to exactly the selected peers. Returns the address to
    /// announce, or `None` when the list was ignored.
    pub async fn handle_peer_list(&self, list: Vec<String>, via: Option<&PeerHandle>) -> Option<String> {
        let targets = {
            let mut state = self.state.lock();
            if state.join_state == JoinState::Joined || !state.peers.is_empty() {
                debug!("Ignoring peer list of {} entries, already joined", list.len());
                return None;
            }
            state.peers = list;
            state.join_state = JoinState::Joined;
            select_join_targets(&state.peers, self.max_fanout)
        };

        info!("Adopted peer list, connecting to {} peer(s)", targets.len());
        let mut connected = 0;
        for target in &targets {
            if *target == self.own_address {
                continue;
            }
            match self.connections.connect(target).await {
                Ok(_) => connected += 1,
                Err(e) => warn!("Failed to connect to listed peer: {}", e),
            }
        }

        if let Some(via) = via {
            if connected > 0 && !targets.contains(&via.address) {
                debug!("Closing bootstrap connection to {}", via.address);
                self.connections.on_disconnect(via);
            }
        }

        {
            let mut state = self.state.lock();
            if !state.peers.contains(&self.own_address) {
                state.peers.push(self.own_address.clone());
            }
        }
        Some(self.own_address.clone())
    }

    /// Merge an announced address. Returns true if it was new.
    /// Never dials the newcomer.
    pub fn handle_new_peer(&self, address: &str) -> bool {
        let mut state = self.state.lock();
        if state.peers.iter().any(|peer| peer == address) {
            return false;
        }
        state.peers.push(address.to_string());
        debug!("Learned about new peer {}", address);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection_manager::ConnectionSettings;
    use crate::shutdown::ShutdownManager;

    fn addresses(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("10.0.0.{}:7000", i)).collect()
    }

    fn directory(own: &str) -> PeerDirectory {
        let connections = Arc::new(ConnectionManager::new(
            ConnectionSettings::default(),
            ShutdownManager::new(),
        ));
        PeerDirectory::new(own.to_string(), DEFAULT_MAX_FANOUT, connections)
    }

    #[test]
    fn test_select_all_when_under_limit() {
        let peers = addresses(4);
        assert_eq!(select_join_targets(&peers, 10), peers);
        assert!(select_join_targets(&[], 10).is_empty());
    }

    #[test]
    fn test_select_most_recent_when_over_limit() {
        let peers = addresses(25);
        let targets = select_join_targets(&peers, 10);
        assert_eq!(targets.len(), 10);
        assert_eq!(targets, peers[15..].to_vec());
    }

    #[test]
    fn test_new_peer_merge_is_append_only() {
        let dir = directory("127.0.0.1:1");
        assert!(dir.handle_new_peer("127.0.0.1:2"));
        assert!(dir.handle_new_peer("127.0.0.1:3"));
        assert!(!dir.handle_new_peer("127.0.0.1:2"));
        assert_eq!(dir.peers(), vec!["127.0.0.1:2", "127.0.0.1:3"]);
        // Announcements never dial.
        assert_eq!(dir.connections.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_list_joins_alone() {
        let dir = directory("127.0.0.1:1");
        assert_eq!(dir.join_state(), JoinState::Unjoined);

        let announce = dir.handle_peer_list(vec![], None).await;
        assert_eq!(announce.as_deref(), Some("127.0.0.1:1"));
        assert_eq!(dir.join_state(), JoinState::Joined);
        assert_eq!(dir.peers(), vec!["127.0.0.1:1"]);
    }

    #[tokio::test]
    async fn test_second_peer_list_is_ignored() {
        let dir = directory("127.0.0.1:1");
        dir.handle_peer_list(vec![], None).await;

        let announce = dir.handle_peer_list(vec!["127.0.0.1:9".to_string()], None).await;
        assert!(announce.is_none());
        assert_eq!(dir.peers(), vec!["127.0.0.1:1"]);
    }

    #[tokio::test]
    async fn test_unreachable_listed_peers_are_skipped() {
        let dir = directory("127.0.0.1:1");
        // Nothing listens on these; the join still completes.
        let mut listed = Vec::new();
        for _ in 0..2 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listed.push(listener.local_addr().unwrap().to_string());
        }

        let announce = dir.handle_peer_list(listed.clone(), None).await;
        assert!(announce.is_some());

        let mut expected = listed;
        expected.push("127.0.0.1:1".to_string());
        assert_eq!(dir.peers(), expected);
        assert_eq!(dir.len(), 3);
    }
}
