use std::fmt;

use thiserror::Error;

use crate::ids::{ChunkId, GenerationId};

pub type Result<T> = std::result::Result<T, BurrowError>;

/// Why a lock could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// Someone else kept the lock marker until the timeout ran out.
    Timeout,
    /// The storage layer refused to create the marker.
    Conflict(String),
}

impl fmt::Display for LockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFailure::Timeout => write!(f, "timeout"),
            LockFailure::Conflict(msg) => write!(f, "conflict: {msg}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("locking failed for {resource}: {reason}")]
    LockFailed {
        resource: String,
        reason: LockFailure,
    },

    #[error("locking failed for {0}: already locked by this process")]
    AlreadyLocked(String),

    #[error("{0} is not locked")]
    NotLocked(String),

    #[error("lock marker '{0}' is missing")]
    LockMarkerMissing(String),

    #[error("client '{0}' already exists")]
    ClientAlreadyExists(String),

    #[error("client '{0}' does not exist")]
    ClientNotFound(String),

    #[error("client '{0}' has no generations")]
    ClientHasNoGenerations(String),

    #[error("client '{client}' has no generation {generation}")]
    GenerationNotFound {
        client: String,
        generation: String,
    },

    #[error("client '{0}' already has a generation in progress")]
    GenerationAlreadyStarted(String),

    #[error("client '{0}' has no generation in progress")]
    NoCurrentGeneration(String),

    #[error("file '{path}' does not exist in generation {generation}")]
    FileNotFound {
        path: String,
        generation: GenerationId,
    },

    #[error("chunk {0} does not exist")]
    ChunkNotFound(ChunkId),

    #[error("bag {0:016x} does not exist")]
    BagNotFound(u64),

    #[error("malformed blob id '{0}'")]
    InvalidObjectId(String),

    #[error("incompatible repository format {found} (expected {expected})")]
    BadFormat { found: String, expected: u32 },

    #[error("key must be {expected} bytes, got {actual}")]
    KeySize { expected: usize, actual: usize },

    #[error("corrupt data in '{0}'")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("{0}")]
    Other(String),
}

impl BurrowError {
    /// Lock errors are recoverable by retrying the whole locked session.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            BurrowError::LockFailed { .. }
                | BurrowError::AlreadyLocked(_)
                | BurrowError::NotLocked(_)
                | BurrowError::LockMarkerMissing(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BurrowError::ClientNotFound(_)
                | BurrowError::GenerationNotFound { .. }
                | BurrowError::FileNotFound { .. }
                | BurrowError::ChunkNotFound(_)
                | BurrowError::BagNotFound(_)
        )
    }
}
