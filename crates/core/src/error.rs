//! Error types for the mirror store
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Expected conditions (store not ready, zero-match queries, remote timeouts)
//! travel as flagged responses at the facade layer; the variants here are the
//! underlying error kinds those responses carry.

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for mirror store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the mirror store
#[derive(Debug, Error)]
pub enum Error {
    /// Store has not completed initialization
    #[error("store not ready: {0}")]
    NotReady(String),

    /// A correlated remote request expired before a response arrived
    #[error("request timed out: correlation {0}")]
    Timeout(Uuid),

    /// Query filter expression failed to compile
    #[error("filter expression invalid: {0}")]
    FilterCompile(String),

    /// Record not found by id
    #[error("record not found: {0}")]
    RecordNotFound(Uuid),

    /// Store not registered under any known key
    #[error("store not found: {0}")]
    StoreNotFound(String),

    /// I/O error (file operations during save/load/append)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Cache file failed corruption checks; recoverable via a backup generation
    #[error("cache file corrupt: {0}")]
    Corrupt(String),

    /// Allocation-class failure reported by a codec or cipher during save
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Record encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Encryption or decryption failure
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Sequence numbering would exceed `u64::MAX`; wraparound is unsupported
    #[error("sequence numbering exhausted")]
    SequenceOverflow,

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
