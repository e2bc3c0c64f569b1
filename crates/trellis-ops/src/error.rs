//! Error types for the operational layer.

use thiserror::Error;

/// Errors raised by operator answering and sweeps.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying store refused or failed an operation.
    #[error("Store error: {0}")]
    Store(#[from] trellis_store::Error),

    /// Filesystem or subprocess plumbing failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The replication transport failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for operational code.
pub type Result<T> = std::result::Result<T, Error>;
