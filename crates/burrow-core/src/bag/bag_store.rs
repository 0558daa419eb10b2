use std::sync::Arc;

use tracing::debug;

use burrow_types::error::{BurrowError, Result};

use crate::repo::fs::RepositoryFs;

use super::Bag;

/// Bags stored as `<dirname>/<id as 16 hex digits>.bag`.
pub struct BagStore {
    fs: Arc<RepositoryFs>,
    dirname: String,
    prev_id: Option<u64>,
}

impl BagStore {
    pub fn new(fs: Arc<RepositoryFs>, dirname: &str) -> Self {
        Self {
            fs,
            dirname: dirname.trim_end_matches('/').to_string(),
            prev_id: None,
        }
    }

    fn bag_key(&self, bag_id: u64) -> String {
        format!("{}/{bag_id:016x}.bag", self.dirname)
    }

    /// Claim an unused bag id by creating its (empty) file exclusively.
    pub fn reserve_bag_id(&mut self) -> Result<u64> {
        let mut bag_id = match self.prev_id {
            Some(prev) => prev.wrapping_add(1),
            None => rand::random::<u64>(),
        };
        loop {
            match self.fs.write_new(&self.bag_key(bag_id), &[]) {
                Ok(()) => break,
                Err(BurrowError::AlreadyExists(_)) => bag_id = rand::random::<u64>(),
                Err(e) => return Err(e),
            }
        }
        self.prev_id = Some(bag_id);
        Ok(bag_id)
    }

    pub fn put_bag(&self, bag: &Bag) -> Result<()> {
        self.fs
            .overwrite(&self.bag_key(bag.id()), &rmp_serde::to_vec(bag)?)?;
        debug!(bag = %format!("{:016x}", bag.id()), blobs = bag.len(), "bag written");
        Ok(())
    }

    pub fn get_bag(&self, bag_id: u64) -> Result<Bag> {
        match self.fs.cat(&self.bag_key(bag_id))? {
            Some(data) if !data.is_empty() => Ok(rmp_serde::from_slice(&data)?),
            _ => Err(BurrowError::BagNotFound(bag_id)),
        }
    }

    /// Whether a bag with content exists. A reserved id alone does not count.
    pub fn has_bag(&self, bag_id: u64) -> Result<bool> {
        Ok(self
            .fs
            .cat(&self.bag_key(bag_id))?
            .is_some_and(|data| !data.is_empty()))
    }

    /// Ids of every bag file, reserved ones included.
    pub fn get_bag_ids(&self) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .fs
            .list_dir(&self.dirname)?
            .iter()
            .filter_map(|key| key.rsplit('/').next()?.strip_suffix(".bag"))
            .filter_map(|name| u64::from_str_radix(name, 16).ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn remove_bag(&self, bag_id: u64) -> Result<()> {
        self.fs.remove(&self.bag_key(bag_id))
    }
}
