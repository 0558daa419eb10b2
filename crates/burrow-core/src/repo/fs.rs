use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use burrow_storage::StorageBackend;
use burrow_types::error::{BurrowError, Result};
use tracing::debug;

use crate::filter::RepositoryFilter;

/// Name of the lock marker kept inside every lockable directory.
pub const LOCK_FILE: &str = "lock";

/// Storage as the repository sees it: every blob lives under a toplevel
/// directory and passes through the filter on the way in and out.
pub struct RepositoryFs {
    storage: Box<dyn StorageBackend>,
    filter: Box<dyn RepositoryFilter>,
    initialized: Mutex<HashSet<String>>,
}

impl RepositoryFs {
    pub fn new(storage: Box<dyn StorageBackend>, filter: Box<dyn RepositoryFilter>) -> Self {
        Self {
            storage,
            filter,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    /// Unfiltered access, for lock markers and the format marker.
    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    fn toplevel(key: &str) -> Result<&str> {
        match key.split_once('/') {
            Some((top, rest)) if !top.is_empty() && !rest.is_empty() => Ok(top),
            _ => Err(BurrowError::InvalidKey(format!(
                "'{key}' is not inside a toplevel directory"
            ))),
        }
    }

    /// Read and unfilter a blob.
    pub fn cat(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let top = Self::toplevel(key)?;
        match self.storage.get(key)? {
            Some(data) => Ok(Some(self.filter.filter_read(top, data)?)),
            None => Ok(None),
        }
    }

    /// Write a blob that must not exist yet.
    pub fn write_new(&self, key: &str, data: &[u8]) -> Result<()> {
        let top = Self::toplevel(key)?;
        self.init_toplevel(top)?;
        let data = self.filter.filter_write(top, data.to_vec())?;
        self.storage.put_new(key, &data)
    }

    /// Atomically replace a blob.
    pub fn overwrite(&self, key: &str, data: &[u8]) -> Result<()> {
        let top = Self::toplevel(key)?;
        self.init_toplevel(top)?;
        let data = self.filter.filter_write(top, data.to_vec())?;
        self.storage.put(key, &data)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.storage.exists(key)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        Self::toplevel(key)?;
        self.storage.delete(key)
    }

    /// All keys below a directory, recursively.
    pub fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        self.storage.list(dir)
    }

    pub fn remove_dir(&self, dir: &str) -> Result<()> {
        self.storage.delete_dir(dir)?;
        self.initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dir);
        Ok(())
    }

    /// Fire the filter's toplevel hook if `top` holds nothing but a lock marker.
    fn init_toplevel(&self, top: &str) -> Result<()> {
        let mut initialized = self
            .initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if initialized.contains(top) {
            return Ok(());
        }
        let lock_key = format!("{top}/{LOCK_FILE}");
        if !self.storage.has_keys_besides(top, &lock_key)? {
            debug!(toplevel = top, "initializing toplevel");
            self.filter.toplevel_init(self.storage.as_ref(), top)?;
        }
        initialized.insert(top.to_string());
        Ok(())
    }
}
