//! Dedup index: `checksum(32) | chunk_id(8) | client_id(8)` with empty
//! values. One entry per client referencing a chunk.

use std::sync::Arc;

use burrow_types::error::Result;
use burrow_types::{Checksum, ChunkId, ClientId};

use crate::forest::{OrderedMap, Tree};

use super::fs::RepositoryFs;
use super::repo_tree::RepositoryTree;

pub const CHECKSUM_TREE_DIR: &str = "chunksums";
pub const KEY_SIZE: usize = Checksum::LEN + 8 + 8;

fn key(checksum: &Checksum, chunk_id: u64, client_id: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(KEY_SIZE);
    k.extend_from_slice(checksum.as_bytes());
    k.extend_from_slice(&chunk_id.to_be_bytes());
    k.extend_from_slice(&client_id.to_be_bytes());
    k
}

fn unkey(k: &[u8]) -> Option<(Checksum, ChunkId, ClientId)> {
    if k.len() != KEY_SIZE {
        return None;
    }
    let checksum = Checksum::from_slice(&k[..Checksum::LEN])?;
    let chunk: [u8; 8] = k[Checksum::LEN..Checksum::LEN + 8].try_into().ok()?;
    let client: [u8; 8] = k[Checksum::LEN + 8..].try_into().ok()?;
    Some((
        checksum,
        ChunkId::from_be_bytes(chunk),
        ClientId::from_be_bytes(client),
    ))
}

fn chunk_refs(tree: &Tree, checksum: &Checksum, chunk_id: ChunkId) -> Result<Vec<ClientId>> {
    Ok(tree
        .lookup_range(
            &key(checksum, chunk_id.0, 0),
            &key(checksum, chunk_id.0, u64::MAX),
        )?
        .iter()
        .filter_map(|(k, _)| unkey(k).map(|(_, _, client)| client))
        .collect())
}

pub struct ChecksumTree {
    tree: RepositoryTree,
}

impl ChecksumTree {
    pub fn new(fs: Arc<RepositoryFs>, node_size: usize) -> Self {
        Self {
            tree: RepositoryTree::new(fs, CHECKSUM_TREE_DIR, KEY_SIZE, node_size, true),
        }
    }

    pub fn tree(&mut self) -> &mut RepositoryTree {
        &mut self.tree
    }

    pub fn add(&mut self, checksum: &Checksum, chunk_id: ChunkId, client_id: ClientId) -> Result<()> {
        self.tree
            .working_tree()?
            .insert(&key(checksum, chunk_id.0, client_id.0), &[])
    }

    /// Chunk ids stored with this checksum. More than one means a hash
    /// collision; callers compare content before reusing any of them.
    pub fn find_chunks(&mut self, checksum: &Checksum) -> Result<Vec<ChunkId>> {
        let Some(tree) = self.tree.view()? else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<ChunkId> = tree
            .lookup_range(&key(checksum, 0, 0), &key(checksum, u64::MAX, u64::MAX))?
            .iter()
            .filter_map(|(k, _)| unkey(k).map(|(_, chunk, _)| chunk))
            .collect();
        ids.dedup();
        Ok(ids)
    }

    /// Whether any client still references the chunk.
    pub fn chunk_is_used(&mut self, checksum: &Checksum, chunk_id: ChunkId) -> Result<bool> {
        Ok(!self.clients_of(checksum, chunk_id)?.is_empty())
    }

    /// Clients holding a reference to the chunk.
    pub fn clients_of(&mut self, checksum: &Checksum, chunk_id: ChunkId) -> Result<Vec<ClientId>> {
        match self.tree.view()? {
            Some(tree) => chunk_refs(tree, checksum, chunk_id),
            None => Ok(Vec::new()),
        }
    }

    /// Every reference in the index, found by a full scan.
    pub fn all_refs(&mut self) -> Result<Vec<(Checksum, ChunkId, ClientId)>> {
        let Some(tree) = self.tree.view()? else {
            return Ok(Vec::new());
        };
        Ok(tree
            .lookup_range(&[0u8; KEY_SIZE], &[0xffu8; KEY_SIZE])?
            .iter()
            .filter_map(|(k, _)| unkey(k))
            .collect())
    }

    /// Every chunk a client references.
    pub fn chunks_of_client(&mut self, client_id: ClientId) -> Result<Vec<(Checksum, ChunkId)>> {
        Ok(self
            .all_refs()?
            .into_iter()
            .filter(|(_, _, client)| *client == client_id)
            .map(|(checksum, chunk, _)| (checksum, chunk))
            .collect())
    }

    /// Drop one client's reference. Returns whether it was present.
    pub fn remove(&mut self, checksum: &Checksum, chunk_id: ChunkId, client_id: ClientId) -> Result<bool> {
        self.tree
            .working_tree()?
            .remove(&key(checksum, chunk_id.0, client_id.0))
    }
}
