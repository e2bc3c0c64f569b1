//! Error types for the shadow store.

use thiserror::Error;

/// Errors raised by store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document serialization or parsing failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Archive read or write failed.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Payload translation failed.
    #[error("Codec error: {0}")]
    Codec(#[from] trellis_codec::Error),

    /// Caller handed over a payload the store refuses to hold.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A delta was requested for a thing that never reported its config.
    #[error("No reported config for thing: {0}")]
    MissingConfig(String),

    /// Name did not resolve to any thing in the store.
    #[error("No such thing: {0}")]
    NoSuchThing(String),

    /// A thing with that id already exists.
    #[error("Thing already exists: {0}")]
    ThingExists(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;
