//! Error types for coffre

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can occur in coffre
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid backend options or connection string
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network-level failure talking to the backend
    #[error("Backend network error: {0}")]
    BackendNetwork(String),

    /// The requested object does not exist in the backend
    #[error("Object not found")]
    BackendNotFound,

    /// Conditional write failed because the object changed underneath us
    #[error("Backend version conflict")]
    BackendConflict,

    /// AEAD authentication failure, truncated stream, or malformed envelope.
    /// Wrong-key and corrupted-data cases are deliberately indistinguishable.
    #[error("Cryptography error: {0}")]
    Crypto(String),

    /// No key slot accepted the provided passphrase or GPG key
    #[error("Cannot unlock the repository")]
    Unlock,

    /// Index save exceeded the maximum number of compare-and-swap retries
    #[error("Index conflict: too many concurrent modifications")]
    IndexConflict,

    /// The path already exists in the index
    #[error("Path already exists: {0}")]
    Exists(String),

    /// The path is not a valid repository path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON or protobuf encoding/decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (task join failures and similar)
    #[error("Internal error: {0}")]
    Internal(String),
}
