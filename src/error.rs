use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(#[from] DialError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient funds in {account}: balance {balance}, debit {amount}")]
    InsufficientFunds {
        account: String,
        balance: i64,
        amount: i64,
    },

    #[error("Negative transfer amount {0} not allowed")]
    NegativeAmount(i64),

    #[error("Balance of {0} would overflow")]
    Overflow(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("Canonical encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum WireError {
    /// The stream no longer carries well-formed frames; the connection must close.
    #[error("Corrupt stream: {0}")]
    Corrupt(String),

    /// A well-formed frame that is not a known envelope; drop it and keep reading.
    #[error("Unrecognized envelope: {0}")]
    Unrecognized(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

#[derive(Error, Debug)]
pub enum DialError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection manager is shutting down")]
    ShuttingDown,
}
