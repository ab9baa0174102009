//! Error types for Loam.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LoamError>;

/// Errors produced by the memory store, queue, and reflection worker.
#[derive(Debug, Error)]
pub enum LoamError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure (index file, lock sentinel, store reset).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The embedding encoder could not be loaded or could not encode.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// The persisted vector index could not be decoded. Recoverable: the
    /// facade rebuilds the index from the document table.
    #[error("corrupt vector index: {0}")]
    CorruptIndex(String),

    /// The advisory index lock could not be acquired or released.
    #[error("index lock error: {0}")]
    Lock(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A referenced document or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The language oracle failed at the transport level.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// An argument violated an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LoamError {
    pub fn embedding(msg: impl Into<String>) -> Self {
        LoamError::Embedding(msg.into())
    }

    pub fn corrupt_index(msg: impl Into<String>) -> Self {
        LoamError::CorruptIndex(msg.into())
    }

    pub fn lock(msg: impl Into<String>) -> Self {
        LoamError::Lock(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        LoamError::InvalidConfig(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        LoamError::NotFound(msg.into())
    }

    pub fn oracle(msg: impl Into<String>) -> Self {
        LoamError::Oracle(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        LoamError::InvalidArgument(msg.into())
    }
}
