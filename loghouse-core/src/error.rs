//! Error types for the storage engine.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum LogError {
    /// The requested offset is beyond the highest offset in the log.
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    /// A read past the used entries of an index, or from an empty index.
    #[error("end of index")]
    EndOfIndex,

    /// The index has no room for another entry.
    #[error("index is full")]
    IndexFull,

    /// A stored record failed to decode.
    #[error("record decode: {0}")]
    Decode(#[from] prost::DecodeError),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
