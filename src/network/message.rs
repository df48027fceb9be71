//! Wire envelopes exchanged between peers, tagged by their `Type` field.

use crate::types::SignedTransaction;
use serde::{Deserialize, Serialize};

/// Every message exchanged between nodes, discriminated on the wire by `Type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "Type")]
pub enum Envelope {
    /// Sent by an accepting node to every new connection.
    #[serde(rename = "peerlist")]
    PeerList {
        #[serde(rename = "List")]
        list: Vec<String>,
        /// Public keys known to the sender
        #[serde(rename = "Keys", default, skip_serializing_if = "Vec::is_empty")]
        keys: Vec<String>,
    },
    /// Flooded by a node once it has joined.
    #[serde(rename = "newpeer")]
    NewPeer {
        #[serde(rename = "Address")]
        address: String,
        #[serde(rename = "PublicKey", default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    #[serde(rename = "transaction")]
    Transaction(SignedTransaction),
}

impl Envelope {
    /// Wire discriminator, also used in logs
    pub fn message_type(&self) -> &'static str {
        match self {
            Envelope::PeerList { .. } => "peerlist",
            Envelope::NewPeer { .. } => "newpeer",
            Envelope::Transaction(_) => "transaction",
        }
    }

    pub fn peer_list(list: Vec<String>, keys: Vec<String>) -> Self {
        Envelope::PeerList { list, keys }
    }

    pub fn new_peer(address: impl Into<String>, public_key: Option<String>) -> Self {
        Envelope::NewPeer {
            address: address.into(),
            public_key,
        }
    }
}
