pub mod connection_manager;
pub mod flood_router;
pub mod message;
pub mod peer_directory;
pub mod wire;
