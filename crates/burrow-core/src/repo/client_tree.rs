//! Per-client metadata: one tree per generation in the client's forest.
//!
//! Every key is 18 bytes: `prefix(1) | main(8) | subtype(1) | subkey(8)`.
//!
//! | region        | main              | subtype         | subkey   | value            |
//! |---------------|-------------------|-----------------|----------|------------------|
//! | fs metadata   | default file id   | `FileName`      | file id  | pathname         |
//! | fs metadata   | file id           | `FileChunks`    | batch no | packed chunk ids |
//! | fs metadata   | file id           | `FileMetadata`  | 0        | metadata blob    |
//! | fs metadata   | parent file id    | `DirContents`   | child id | child basename   |
//! | chunk refs    | chunk id          | 0               | file id  | empty            |
//! | generation    | hash("generation")| 0               | key code | u64, big endian  |

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use burrow_types::error::{BurrowError, Result};
use burrow_types::{Checksum, ChunkId, ClientId, FileId, GenerationId};

use crate::forest::{OrderedMap, Tree, TreeId};

use super::fs::RepositoryFs;
use super::repo_tree::RepositoryTree;

pub const KEY_SIZE: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Prefix {
    FsMeta = 0,
    ChunkRef = 1,
    GenMeta = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FsSubtype {
    FileName = 0,
    FileChunks = 1,
    FileMetadata = 3,
    DirContents = 4,
}

/// Per-generation values kept in the generation region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GenerationKey {
    Id = 0,
    Started = 1,
    Ended = 2,
    IsCheckpoint = 3,
    FileCount = 4,
    TotalData = 5,
}

impl GenerationKey {
    pub const ALL: [GenerationKey; 6] = [
        GenerationKey::Id,
        GenerationKey::Started,
        GenerationKey::Ended,
        GenerationKey::IsCheckpoint,
        GenerationKey::FileCount,
        GenerationKey::TotalData,
    ];
}

fn key(prefix: Prefix, main: u64, subtype: u8, subkey: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(KEY_SIZE);
    k.push(prefix as u8);
    k.extend_from_slice(&main.to_be_bytes());
    k.push(subtype);
    k.extend_from_slice(&subkey.to_be_bytes());
    k
}

fn fs_key(file_id: u64, subtype: FsSubtype, subkey: u64) -> Vec<u8> {
    key(Prefix::FsMeta, file_id, subtype as u8, subkey)
}

fn subkey_of(k: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&k[KEY_SIZE - 8..]);
    u64::from_be_bytes(b)
}

fn main_of(k: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&k[1..9]);
    u64::from_be_bytes(b)
}

fn hash_bytes<const N: usize>(data: &[u8]) -> [u8; N] {
    let digest = Checksum::compute(data);
    let mut out = [0u8; N];
    out.copy_from_slice(&digest.0[..N]);
    out
}

fn generation_main() -> u64 {
    u64::from_be_bytes(hash_bytes::<8>(b"generation"))
}

fn gen_key(which: GenerationKey) -> Vec<u8> {
    key(Prefix::GenMeta, generation_main(), 0, which as u64)
}

fn chunk_ref_key(chunk_id: ChunkId, file_id: FileId) -> Vec<u8> {
    key(Prefix::ChunkRef, chunk_id.0, 0, file_id.0)
}

/// Split a path into its parent and basename. The root is its own parent.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Hash of the parent directory followed by hash of the basename, so that
/// siblings cluster in the key space.
pub fn default_file_id(path: &str) -> u64 {
    let (dir, base) = split_path(path);
    let mut b = [0u8; 8];
    b[..4].copy_from_slice(&hash_bytes::<4>(dir.as_bytes()));
    b[4..].copy_from_slice(&hash_bytes::<4>(base.as_bytes()));
    u64::from_be_bytes(b)
}

fn now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

fn decode_u64(v: &[u8]) -> Option<u64> {
    let b: [u8; 8] = v.try_into().ok()?;
    Some(u64::from_be_bytes(b))
}

pub fn generation_value(tree: &dyn OrderedMap, which: GenerationKey) -> Result<Option<u64>> {
    Ok(tree.lookup(&gen_key(which))?.and_then(|v| decode_u64(&v)))
}

fn generation_id_of(tree: &dyn OrderedMap) -> Result<Option<GenerationId>> {
    Ok(generation_value(tree, GenerationKey::Id)?.map(GenerationId))
}

/// Resolve a pathname to its file id. The stored pathname is compared, so
/// two paths sharing a default id each keep their own entry.
pub fn get_file_id(tree: &dyn OrderedMap, path: &str) -> Result<Option<FileId>> {
    let default = default_file_id(path);
    Ok(tree
        .lookup_range(
            &fs_key(default, FsSubtype::FileName, 0),
            &fs_key(default, FsSubtype::FileName, u64::MAX),
        )?
        .into_iter()
        .find(|(_, v)| v == path.as_bytes())
        .map(|(k, _)| FileId(subkey_of(&k))))
}

/// Find or allocate the file id for a pathname. New ids are random and
/// re-rolled until nothing in the fs region uses them.
pub fn set_file_id(tree: &mut dyn OrderedMap, path: &str) -> Result<FileId> {
    if let Some(id) = get_file_id(tree, path)? {
        return Ok(id);
    }
    let id = loop {
        let candidate = FileId::random();
        let lo = key(Prefix::FsMeta, candidate.0, 0, 0);
        let hi = key(Prefix::FsMeta, candidate.0, u8::MAX, u64::MAX);
        if tree.range_is_empty(&lo, &hi)? {
            break candidate;
        }
    };
    tree.insert(
        &fs_key(default_file_id(path), FsSubtype::FileName, id.0),
        path.as_bytes(),
    )?;
    Ok(id)
}

fn unpack_chunk_ids(value: &[u8]) -> impl Iterator<Item = ChunkId> + '_ {
    value
        .chunks_exact(8)
        .filter_map(decode_u64)
        .map(ChunkId)
}

fn pack_chunk_ids(ids: &[ChunkId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

pub fn file_chunks(tree: &dyn OrderedMap, file_id: FileId) -> Result<Vec<ChunkId>> {
    Ok(tree
        .lookup_range(
            &fs_key(file_id.0, FsSubtype::FileChunks, 0),
            &fs_key(file_id.0, FsSubtype::FileChunks, u64::MAX),
        )?
        .iter()
        .flat_map(|(_, v)| unpack_chunk_ids(v).collect::<Vec<_>>())
        .collect())
}

fn file_metadata(tree: &dyn OrderedMap, file_id: FileId) -> Result<Option<Vec<u8>>> {
    tree.lookup(&fs_key(file_id.0, FsSubtype::FileMetadata, 0))
}

fn dir_children(tree: &dyn OrderedMap, dir_id: FileId) -> Result<Vec<(FileId, String)>> {
    Ok(tree
        .lookup_range(
            &fs_key(dir_id.0, FsSubtype::DirContents, 0),
            &fs_key(dir_id.0, FsSubtype::DirContents, u64::MAX),
        )?
        .into_iter()
        .map(|(k, v)| (FileId(subkey_of(&k)), String::from_utf8_lossy(&v).into_owned()))
        .collect())
}

fn remove_file(tree: &mut dyn OrderedMap, path: &str, file_id: FileId) -> Result<()> {
    for (_, name) in dir_children(tree, file_id)? {
        let child = join_path(path, &name);
        if let Some(child_id) = get_file_id(tree, &child)? {
            remove_file(tree, &child, child_id)?;
        }
    }
    for chunk_id in file_chunks(tree, file_id)? {
        tree.remove(&chunk_ref_key(chunk_id, file_id))?;
    }
    tree.remove_range(
        &key(Prefix::FsMeta, file_id.0, 0, 0),
        &key(Prefix::FsMeta, file_id.0, u8::MAX, u64::MAX),
    )?;
    tree.remove(&fs_key(default_file_id(path), FsSubtype::FileName, file_id.0))?;

    let (parent, _) = split_path(path);
    if parent != path {
        if let Some(parent_id) = get_file_id(tree, parent)? {
            tree.remove(&fs_key(parent_id.0, FsSubtype::DirContents, file_id.0))?;
        }
    }
    Ok(())
}

/// A client's forest of generations plus the lookup caches that go with
/// it. The caches live only as long as the client is locked.
pub struct ClientMetadataTree {
    client: String,
    client_id: ClientId,
    tree: RepositoryTree,
    chunkids_per_key: usize,
    known_generations: HashMap<GenerationId, TreeId>,
    file_ids: HashMap<String, FileId>,
}

impl ClientMetadataTree {
    pub fn new(
        fs: Arc<RepositoryFs>,
        client: &str,
        client_id: ClientId,
        node_size: usize,
    ) -> Self {
        Self {
            client: client.to_string(),
            client_id,
            tree: RepositoryTree::new(fs, &client_id.to_string(), KEY_SIZE, node_size, false),
            chunkids_per_key: (node_size / 4 / 8).max(1),
            known_generations: HashMap::new(),
            file_ids: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn tree(&mut self) -> &mut RepositoryTree {
        &mut self.tree
    }

    pub fn clear_caches(&mut self) {
        self.known_generations.clear();
        self.file_ids.clear();
    }

    /// Generation ids in creation order, including an open one.
    pub fn list_generations(&mut self) -> Result<Vec<GenerationId>> {
        self.tree.init_forest()?;
        let mut generations = Vec::new();
        if let Some(forest) = self.tree.forest() {
            for (_, tree) in forest.trees() {
                if let Some(generation) = generation_id_of(tree)? {
                    generations.push(generation);
                }
            }
        }
        Ok(generations)
    }

    fn not_found(&self, generation: GenerationId) -> BurrowError {
        BurrowError::GenerationNotFound {
            client: self.client.clone(),
            generation: generation.to_string(),
        }
    }

    pub fn find_generation(&mut self, generation: GenerationId) -> Result<TreeId> {
        self.tree.init_forest()?;
        let forest = self.tree.forest();
        if let Some(&tree_id) = self.known_generations.get(&generation) {
            if forest.is_some_and(|f| f.tree(tree_id).is_some()) {
                return Ok(tree_id);
            }
        }
        let mut found = None;
        if let Some(forest) = forest {
            for (tree_id, tree) in forest.trees() {
                if generation_id_of(tree)? == Some(generation) {
                    found = Some(tree_id);
                    break;
                }
            }
        }
        match found {
            Some(tree_id) => {
                self.known_generations.insert(generation, tree_id);
                Ok(tree_id)
            }
            None => Err(self.not_found(generation)),
        }
    }

    fn generation_tree(&mut self, generation: GenerationId) -> Result<&Tree> {
        let tree_id = self.find_generation(generation)?;
        let err = self.not_found(generation);
        self.tree
            .forest()
            .and_then(|f| f.tree(tree_id))
            .ok_or(err)
    }

    fn current_tree(&mut self) -> Result<&mut Tree> {
        let client = &self.client;
        self.tree
            .current_tree_mut()
            .ok_or_else(|| BurrowError::NoCurrentGeneration(client.clone()))
    }

    pub fn current_generation(&self) -> Result<Option<GenerationId>> {
        match self.tree.current_tree() {
            Some(tree) => generation_id_of(tree),
            None => Ok(None),
        }
    }

    /// Open a new generation as a clone of the newest one.
    pub fn start_generation(&mut self) -> Result<GenerationId> {
        if let Some(current) = self.current_generation()? {
            return Err(BurrowError::GenerationAlreadyStarted(format!(
                "{} (generation {current})",
                self.client
            )));
        }
        let existing = self.list_generations()?;
        self.tree.start_changes(true)?;
        self.file_ids.clear();
        let generation = loop {
            let candidate = GenerationId::random();
            if !existing.contains(&candidate) {
                break candidate;
            }
        };
        let tree = self.current_tree()?;
        tree.insert(&gen_key(GenerationKey::Id), &generation.to_be_bytes())?;
        tree.insert(&gen_key(GenerationKey::Started), &now().to_be_bytes())?;
        tree.insert(&gen_key(GenerationKey::IsCheckpoint), &0u64.to_be_bytes())?;
        for which in [
            GenerationKey::Ended,
            GenerationKey::FileCount,
            GenerationKey::TotalData,
        ] {
            tree.remove(&gen_key(which))?;
        }
        info!(client = %self.client, generation = %generation, "generation started");
        Ok(generation)
    }

    pub fn remove_generation(&mut self, generation: GenerationId) -> Result<()> {
        let tree_id = self.find_generation(generation)?;
        if self.current_generation()? == Some(generation) {
            self.file_ids.clear();
        }
        self.tree.remove_tree(tree_id)?;
        self.known_generations.remove(&generation);
        info!(client = %self.client, generation = %generation, "generation removed");
        Ok(())
    }

    pub fn get_generation_key(
        &mut self,
        generation: GenerationId,
        which: GenerationKey,
    ) -> Result<Option<u64>> {
        generation_value(self.generation_tree(generation)?, which)
    }

    pub fn set_generation_key(&mut self, which: GenerationKey, value: Option<u64>) -> Result<()> {
        let tree = self.current_tree()?;
        match value {
            Some(v) => tree.insert(&gen_key(which), &v.to_be_bytes())?,
            None => {
                tree.remove(&gen_key(which))?;
            }
        }
        Ok(())
    }

    /// Start and end times, seconds since the epoch. `None` for an end
    /// time means the generation is still open.
    pub fn get_generation_times(
        &mut self,
        generation: GenerationId,
    ) -> Result<(Option<u64>, Option<u64>)> {
        let tree = self.generation_tree(generation)?;
        Ok((
            generation_value(tree, GenerationKey::Started)?,
            generation_value(tree, GenerationKey::Ended)?,
        ))
    }

    pub fn get_is_checkpoint(&mut self, generation: GenerationId) -> Result<bool> {
        Ok(self
            .get_generation_key(generation, GenerationKey::IsCheckpoint)?
            .is_some_and(|v| v != 0))
    }

    pub fn set_is_checkpoint(&mut self, is_checkpoint: bool) -> Result<()> {
        self.set_generation_key(GenerationKey::IsCheckpoint, Some(u64::from(is_checkpoint)))
    }

    fn current_file_id(&mut self, path: &str) -> Result<Option<FileId>> {
        if let Some(&id) = self.file_ids.get(path) {
            return Ok(Some(id));
        }
        let id = get_file_id(self.current_tree()?, path)?;
        if let Some(id) = id {
            self.file_ids.insert(path.to_string(), id);
        }
        Ok(id)
    }

    fn ensure_file_id(&mut self, path: &str) -> Result<FileId> {
        if let Some(id) = self.current_file_id(path)? {
            return Ok(id);
        }
        let id = set_file_id(self.current_tree()?, path)?;
        self.file_ids.insert(path.to_string(), id);
        Ok(id)
    }

    fn file_not_found(&self, path: &str, generation: GenerationId) -> BurrowError {
        BurrowError::FileNotFound {
            path: path.to_string(),
            generation,
        }
    }

    fn current_or_zero(&self) -> Result<GenerationId> {
        Ok(self.current_generation()?.unwrap_or(GenerationId(0)))
    }

    /// Make sure a file exists with this metadata and is listed in its
    /// parent directory. Unchanged metadata is not rewritten.
    pub fn create(&mut self, path: &str, metadata: &[u8]) -> Result<()> {
        let file_id = self.ensure_file_id(path)?;
        let (parent, basename) = split_path(path);
        let parent_id = if parent != path {
            Some(self.ensure_file_id(parent)?)
        } else {
            None
        };

        let tree = self.current_tree()?;
        let meta_key = fs_key(file_id.0, FsSubtype::FileMetadata, 0);
        if tree.lookup(&meta_key)?.as_deref() != Some(metadata) {
            tree.insert(&meta_key, metadata)?;
        }
        if let Some(parent_id) = parent_id {
            let entry = fs_key(parent_id.0, FsSubtype::DirContents, file_id.0);
            if tree.lookup(&entry)?.is_none() {
                tree.insert(&entry, basename.as_bytes())?;
            }
        }
        Ok(())
    }

    pub fn set_metadata(&mut self, path: &str, metadata: &[u8]) -> Result<()> {
        let file_id = self.ensure_file_id(path)?;
        self.current_tree()?
            .insert(&fs_key(file_id.0, FsSubtype::FileMetadata, 0), metadata)
    }

    /// Remove a file, its children if it is a directory, its chunk
    /// references and its entry in the parent directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let generation = self.current_or_zero()?;
        let file_id = self
            .current_file_id(path)?
            .ok_or_else(|| self.file_not_found(path, generation))?;
        // Cached ids below a removed directory are stale.
        self.file_ids.clear();
        remove_file(self.current_tree()?, path, file_id)?;
        debug!(client = %self.client, path, "file removed");
        Ok(())
    }

    pub fn get_metadata(&mut self, generation: GenerationId, path: &str) -> Result<Vec<u8>> {
        let tree = self.generation_tree(generation)?;
        let found = match get_file_id(tree, path)? {
            Some(id) => file_metadata(tree, id)?,
            None => None,
        };
        found.ok_or_else(|| self.file_not_found(path, generation))
    }

    pub fn file_exists(&mut self, generation: GenerationId, path: &str) -> Result<bool> {
        let tree = self.generation_tree(generation)?;
        match get_file_id(tree, path)? {
            Some(id) => Ok(file_metadata(tree, id)?.is_some()),
            None => Ok(false),
        }
    }

    /// Basenames of a directory's entries. Unknown directories are empty.
    pub fn listdir(&mut self, generation: GenerationId, dirname: &str) -> Result<Vec<String>> {
        let tree = self.generation_tree(generation)?;
        Ok(match get_file_id(tree, dirname)? {
            Some(dir_id) => dir_children(tree, dir_id)?
                .into_iter()
                .map(|(_, name)| name)
                .collect(),
            None => Vec::new(),
        })
    }

    pub fn get_file_chunks(&mut self, generation: GenerationId, path: &str) -> Result<Vec<ChunkId>> {
        let tree = self.generation_tree(generation)?;
        match get_file_id(tree, path)? {
            Some(id) => file_chunks(tree, id),
            None => Err(self.file_not_found(path, generation)),
        }
    }

    fn existing_file_id(&mut self, path: &str) -> Result<FileId> {
        let generation = self.current_or_zero()?;
        self.current_file_id(path)?
            .ok_or_else(|| self.file_not_found(path, generation))
    }

    /// Replace a file's chunk list and bring the chunk-ref region in line
    /// with it.
    pub fn set_file_chunks(&mut self, path: &str, chunk_ids: &[ChunkId]) -> Result<()> {
        let file_id = self.existing_file_id(path)?;
        let per_key = self.chunkids_per_key;
        let tree = self.current_tree()?;
        let old = file_chunks(tree, file_id)?;
        if old == chunk_ids {
            return Ok(());
        }

        tree.remove_range(
            &fs_key(file_id.0, FsSubtype::FileChunks, 0),
            &fs_key(file_id.0, FsSubtype::FileChunks, u64::MAX),
        )?;
        for (i, batch) in chunk_ids.chunks(per_key).enumerate() {
            tree.insert(
                &fs_key(file_id.0, FsSubtype::FileChunks, i as u64),
                &pack_chunk_ids(batch),
            )?;
        }

        let old: BTreeSet<ChunkId> = old.into_iter().collect();
        let new: BTreeSet<ChunkId> = chunk_ids.iter().copied().collect();
        for stale in old.difference(&new) {
            tree.remove(&chunk_ref_key(*stale, file_id))?;
        }
        for added in new.difference(&old) {
            tree.insert(&chunk_ref_key(*added, file_id), &[])?;
        }
        Ok(())
    }

    pub fn append_file_chunks(&mut self, path: &str, chunk_ids: &[ChunkId]) -> Result<()> {
        let file_id = self.existing_file_id(path)?;
        let per_key = self.chunkids_per_key;
        let tree = self.current_tree()?;
        let next = tree
            .lookup_range(
                &fs_key(file_id.0, FsSubtype::FileChunks, 0),
                &fs_key(file_id.0, FsSubtype::FileChunks, u64::MAX),
            )?
            .last()
            .map_or(0, |(k, _)| subkey_of(k) + 1);
        for (i, batch) in chunk_ids.chunks(per_key).enumerate() {
            tree.insert(
                &fs_key(file_id.0, FsSubtype::FileChunks, next + i as u64),
                &pack_chunk_ids(batch),
            )?;
        }
        for chunk_id in chunk_ids {
            tree.insert(&chunk_ref_key(*chunk_id, file_id), &[])?;
        }
        Ok(())
    }

    /// Every chunk any file in the generation refers to.
    pub fn get_generation_chunk_ids(&mut self, generation: GenerationId) -> Result<BTreeSet<ChunkId>> {
        let tree = self.generation_tree(generation)?;
        Ok(tree
            .lookup_range(
                &key(Prefix::ChunkRef, 0, 0, 0),
                &key(Prefix::ChunkRef, u64::MAX, u8::MAX, u64::MAX),
            )?
            .iter()
            .map(|(k, _)| ChunkId(main_of(k)))
            .collect())
    }

    pub fn chunk_in_use(&mut self, generation: GenerationId, chunk_id: ChunkId) -> Result<bool> {
        let tree = self.generation_tree(generation)?;
        Ok(!tree.range_is_empty(
            &chunk_ref_key(chunk_id, FileId(0)),
            &chunk_ref_key(chunk_id, FileId(u64::MAX)),
        )?)
    }

    /// Stamp the open generation's end time and persist the forest.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(tree) = self.tree.current_tree_mut() {
            tree.insert(&gen_key(GenerationKey::Ended), &now().to_be_bytes())?;
        }
        let generation = self.current_generation()?;
        self.tree.commit()?;
        self.clear_caches();
        info!(
            client = %self.client,
            generation = ?generation,
            "client metadata committed"
        );
        Ok(())
    }

    pub fn close(&mut self) {
        self.tree.close();
        self.clear_caches();
    }
}
