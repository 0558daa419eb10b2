pub mod bag;
pub mod compress;
pub mod config;
pub mod filter;
pub mod forest;
pub mod metadata;
pub mod platform;
pub mod repo;

pub use burrow_types::error::{BurrowError, LockFailure, Result};
pub use burrow_types::{Checksum, ChunkId, ClientId, FileId, GenerationId, MAX_ID};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
