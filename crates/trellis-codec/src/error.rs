//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Codec error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Action rule string that does not match the wire grammar.
    #[error("Malformed action rule: {0}")]
    MalformedRule(String),

    /// Sense reading that matches no known wire form.
    #[error("Malformed sense reading: {0}")]
    MalformedReading(String),

    /// Timestamp or clock string that does not parse.
    #[error("Malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
