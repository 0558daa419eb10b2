use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burrow_types::error::{BurrowError, Result};

use crate::repo::fs::RepositoryFs;

use super::tree::Node;

/// Node files of one forest, read on demand.
///
/// Every tree of the forest shares one store, so a leaf used by several
/// generations is read and decoded once. The cache lives as long as the
/// forest: closing a forest handle drops it.
pub struct NodeStore {
    fs: Arc<RepositoryFs>,
    dirname: String,
    cache: Mutex<HashMap<u64, Arc<Node>>>,
}

impl fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStore")
            .field("dirname", &self.dirname)
            .finish_non_exhaustive()
    }
}

impl NodeStore {
    pub fn new(fs: Arc<RepositoryFs>, dirname: &str) -> Self {
        Self {
            fs,
            dirname: dirname.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn node_key(&self, node_id: u64) -> String {
        format!("{}/nodes/{node_id:x}", self.dirname)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<u64, Arc<Node>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self, node_id: u64) -> Result<Arc<Node>> {
        if let Some(node) = self.cache().get(&node_id) {
            return Ok(Arc::clone(node));
        }
        let key = self.node_key(node_id);
        let data = self
            .fs
            .cat(&key)?
            .ok_or_else(|| BurrowError::Corrupt(format!("missing node {key}")))?;
        let node: Arc<Node> = Arc::new(rmp_serde::from_slice(&data)?);
        self.cache().insert(node_id, Arc::clone(&node));
        Ok(node)
    }

    pub fn write(&self, node_id: u64, node: &Arc<Node>) -> Result<()> {
        self.fs
            .overwrite(&self.node_key(node_id), &rmp_serde::to_vec(&**node)?)?;
        self.cache().insert(node_id, Arc::clone(node));
        Ok(())
    }

    pub fn remove(&self, node_id: u64) -> Result<()> {
        self.cache().remove(&node_id);
        self.fs.remove(&self.node_key(node_id))
    }

    /// Number of decoded nodes held in memory.
    pub fn cached(&self) -> usize {
        self.cache().len()
    }

    pub fn clear(&self) {
        self.cache().clear();
    }
}
