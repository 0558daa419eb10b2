use std::collections::BTreeSet;

use burrow_types::error::Result;
use burrow_types::{Checksum, ChunkId, ClientId, GenerationId};

use super::checksum_tree::ChecksumTree;
use super::chunk_list::ChunkList;

/// Generations removed from a locked client and not yet committed.
///
/// The chunk indexes are left alone until the client is committed, so
/// unlocking the client or losing it to a crash never leaves the indexes
/// without references a surviving generation still needs.
#[derive(Debug, Default)]
pub struct RemovedGenerations {
    pub generations: Vec<GenerationId>,
    /// Chunks used by the removed generations: candidates for release.
    pub chunks: BTreeSet<ChunkId>,
}

/// Drop `client_id`'s reference to a chunk from the working indexes.
///
/// Returns whether the chunk is now unreferenced, in which case it has
/// also left the chunk list. A chunk without a recorded checksum was never
/// indexed and counts as unreferenced.
pub fn drop_reference(
    chunk_list: &mut ChunkList,
    checksum_tree: &mut ChecksumTree,
    chunk_id: ChunkId,
    checksum: Option<Checksum>,
    client_id: ClientId,
) -> Result<bool> {
    let checksum = match checksum {
        Some(checksum) => checksum,
        None => match chunk_list.get_checksum(chunk_id)? {
            Some(checksum) => checksum,
            None => return Ok(true),
        },
    };
    checksum_tree.remove(&checksum, chunk_id, client_id)?;
    if checksum_tree.chunk_is_used(&checksum, chunk_id)? {
        return Ok(false);
    }
    chunk_list.remove(chunk_id)?;
    Ok(true)
}
