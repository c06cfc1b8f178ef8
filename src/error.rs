//! Error types for the calvault engine.
//!
//! Read paths absorb corruption internally and never surface it here; the
//! variants below are the failures that callers are expected to handle.

use thiserror::Error;

/// Errors that can occur in calvault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Task error: {0}")]
    Task(String),
}

/// Result type alias for calvault operations.
pub type VaultResult<T> = Result<T, VaultError>;
