//! Error types for session repository operations.

use crate::record::SessionId;

/// Error type for session repository operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store rejected a write because the entry changed since it was read.
    #[error("Concurrent modification of session {id} (expected version {expected:?}, found {actual:?})")]
    Concurrency {
        id: SessionId,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// The backing store could not be reached.
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// An index could not be created.
    #[error("Failed to create index '{name}': {reason}")]
    IndexCreation { name: String, reason: String },

    /// A lookup was attempted before the index set was built.
    #[error("Index not ready: {0}")]
    IndexNotReady(String),

    /// Session state could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to parse a TOML configuration document.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to read a configuration file.
    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for session repository operations.
pub type Result<T> = std::result::Result<T, Error>;
