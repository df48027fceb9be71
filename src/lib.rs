//! A minimal decentralized ledger. Nodes join an overlay network through any
//! known peer, learn about each other by gossip, and flood signed transfers so
//! every node applies each transaction exactly once.

pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod input;
pub mod ledger;
pub mod network;
pub mod node;
pub mod shutdown;
pub mod types;

pub use config::Config;
pub use error::AppError;
pub use node::Node;
