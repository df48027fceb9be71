//! Node configuration.
//!
//! Loaded from a TOML file. Every section and field has a default, so a file
//! only needs the values that differ. Command-line flags are applied on top in
//! `main.rs`.

use crate::crypto::VerificationPolicy;
use crate::error::AppError;
use crate::ledger::OverdraftPolicy;
use crate::network::connection_manager::ConnectionSettings;
use crate::network::flood_router::FloodSettings;
use crate::network::peer_directory::DEFAULT_MAX_FANOUT;
use crate::network::wire::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
        }
    }
}

fn default_node_name() -> String {
    "floodledger".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on; port 0 picks a free port
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Address other peers should dial. Derived from the bound socket when unset.
    #[serde(default)]
    pub advertise_address: Option<String>,
    /// Peer to join through. Without one the node starts its own network.
    #[serde(default)]
    pub bootstrap: Option<String>,
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            advertise_address: None,
            bootstrap: None,
            max_fanout: default_max_fanout(),
            queue_capacity: default_queue_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl NetworkConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue_capacity: self.queue_capacity,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_max_fanout() -> usize {
    DEFAULT_MAX_FANOUT
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodConfig {
    #[serde(default = "default_false")]
    pub skip_origin: bool,
    #[serde(default = "default_true")]
    pub relay_announcements: bool,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            skip_origin: false,
            relay_announcements: true,
        }
    }
}

impl FloodConfig {
    pub fn settings(&self) -> FloodSettings {
        FloodSettings {
            skip_origin: self.skip_origin,
            relay_announcements: self.relay_announcements,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub overdraft: OverdraftPolicy,
    /// Opening balances credited locally at startup. Never flooded.
    #[serde(default)]
    pub initial_balances: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub verification: VerificationPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Load `path` if it exists, otherwise fall back to defaults without
    /// writing anything.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.network.max_fanout == 0 {
            return Err(AppError::Config("network.max_fanout must be at least 1".into()));
        }
        if self.network.queue_capacity == 0 {
            return Err(AppError::Config(
                "network.queue_capacity must be at least 1".into(),
            ));
        }
        if self.network.max_frame_bytes < 64 {
            return Err(AppError::Config(
                "network.max_frame_bytes must be at least 64".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.listen_address, "127.0.0.1:0");
        assert_eq!(config.network.max_fanout, 10);
        assert!(config.network.bootstrap.is_none());
        assert!(!config.flood.skip_origin);
        assert!(config.flood.relay_announcements);
        assert_eq!(config.ledger.overdraft, OverdraftPolicy::Allow);
        assert_eq!(config.security.verification, VerificationPolicy::Sender);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]").unwrap();
        writeln!(file, "bootstrap = \"127.0.0.1:7000\"").unwrap();
        writeln!(file, "[ledger]").unwrap();
        writeln!(file, "overdraft = \"reject\"").unwrap();
        writeln!(file, "[ledger.initial_balances]").unwrap();
        writeln!(file, "alice = 100").unwrap();
        writeln!(file, "[security]").unwrap();
        writeln!(file, "verification = \"any_known\"").unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.network.bootstrap.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(config.network.max_fanout, 10);
        assert_eq!(config.ledger.overdraft, OverdraftPolicy::Reject);
        assert_eq!(config.ledger.initial_balances.get("alice"), Some(&100));
        assert_eq!(config.security.verification, VerificationPolicy::AnyKnown);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let mut config = Config::default();
        config.node.name = "node-a".to_string();
        config.flood.skip_origin = true;
        config.save_to_file(&path).unwrap();

        assert_eq!(Config::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]").unwrap();
        writeln!(file, "max_fanout = 0").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(AppError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ledger]").unwrap();
        writeln!(file, "overdraft = \"sometimes\"").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(AppError::TomlDe(_))
        ));
    }
}
