use burrow_types::error::{BurrowError, Result};

use super::{Bag, BagStore, BlobId};

/// Packs blobs into bags. The open bag is written out once it holds
/// `max_blobs` blobs, or on [`BlobStore::flush`].
pub struct BlobStore {
    bags: BagStore,
    max_blobs: usize,
    open: Option<Bag>,
    last_read: Option<Bag>,
}

impl BlobStore {
    pub fn new(bags: BagStore, max_blobs: usize) -> Self {
        Self {
            bags,
            max_blobs: max_blobs.max(1),
            open: None,
            last_read: None,
        }
    }

    pub fn bag_store(&self) -> &BagStore {
        &self.bags
    }

    pub fn put_blob(&mut self, blob: Vec<u8>) -> Result<BlobId> {
        let bag = match self.open.take() {
            Some(bag) => bag,
            None => Bag::new(self.bags.reserve_bag_id()?),
        };
        let bag = self.open.insert(bag);
        let index = bag.append(blob);
        let blob_id = bag.blob_id(index);
        if bag.len() >= self.max_blobs {
            self.flush()?;
        }
        Ok(blob_id)
    }

    pub fn get_blob(&mut self, blob_id: BlobId) -> Result<Vec<u8>> {
        let missing = || BurrowError::InvalidObjectId(blob_id.to_string());
        if let Some(bag) = self.open.as_ref().filter(|b| b.id() == blob_id.bag_id) {
            return bag.get(blob_id.index).map(<[u8]>::to_vec).ok_or_else(missing);
        }
        if self.last_read.as_ref().map(Bag::id) != Some(blob_id.bag_id) {
            self.last_read = Some(self.bags.get_bag(blob_id.bag_id)?);
        }
        self.last_read
            .as_ref()
            .and_then(|bag| bag.get(blob_id.index))
            .map(<[u8]>::to_vec)
            .ok_or_else(missing)
    }

    /// Write the open bag, if it holds anything.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(bag) = self.open.take() {
            if !bag.is_empty() {
                self.bags.put_bag(&bag)?;
            }
        }
        Ok(())
    }
}
