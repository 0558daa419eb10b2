//! Bags: immutable containers of opaque blobs, written once.
//!
//! A blob is addressed by the bag it lives in and its position there.

pub mod bag_store;
pub mod blob_store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use burrow_types::error::BurrowError;

pub use bag_store::BagStore;
pub use blob_store::BlobStore;

/// Address of a blob: `<bag id as 16 hex digits>.<index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId {
    pub bag_id: u64,
    pub index: usize,
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{}", self.bag_id, self.index)
    }
}

impl FromStr for BlobId {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BurrowError::InvalidObjectId(s.to_string());
        let (bag, index) = s.split_once('.').ok_or_else(invalid)?;
        Ok(BlobId {
            bag_id: u64::from_str_radix(bag, 16).map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

/// An append-only list of blobs with a fixed id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bag {
    id: u64,
    blobs: Vec<Vec<u8>>,
}

impl Bag {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            blobs: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Add a blob and return its index.
    pub fn append(&mut self, blob: Vec<u8>) -> usize {
        self.blobs.push(blob);
        self.blobs.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.blobs.get(index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn blob_id(&self, index: usize) -> BlobId {
        BlobId {
            bag_id: self.id,
            index,
        }
    }
}
