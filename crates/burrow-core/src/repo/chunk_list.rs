use std::sync::Arc;

use burrow_types::error::Result;
use burrow_types::{Checksum, ChunkId};

use crate::forest::OrderedMap;

use super::fs::RepositoryFs;
use super::repo_tree::RepositoryTree;

pub const CHUNK_LIST_DIR: &str = "chunklist";
pub const KEY_SIZE: usize = 8;

/// Chunk id to checksum. Only the newest tree is kept.
pub struct ChunkList {
    tree: RepositoryTree,
}

impl ChunkList {
    pub fn new(fs: Arc<RepositoryFs>, node_size: usize) -> Self {
        Self {
            tree: RepositoryTree::new(fs, CHUNK_LIST_DIR, KEY_SIZE, node_size, true),
        }
    }

    pub fn tree(&mut self) -> &mut RepositoryTree {
        &mut self.tree
    }

    pub fn add(&mut self, chunk_id: ChunkId, checksum: &Checksum) -> Result<()> {
        self.tree
            .working_tree()?
            .insert(&chunk_id.to_be_bytes(), checksum.as_bytes())
    }

    pub fn get_checksum(&mut self, chunk_id: ChunkId) -> Result<Option<Checksum>> {
        let Some(tree) = self.tree.view()? else {
            return Ok(None);
        };
        Ok(tree
            .lookup(&chunk_id.to_be_bytes())?
            .and_then(|v| Checksum::from_slice(&v)))
    }

    pub fn remove(&mut self, chunk_id: ChunkId) -> Result<bool> {
        self.tree.working_tree()?.remove(&chunk_id.to_be_bytes())
    }
}
