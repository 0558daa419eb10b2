pub mod checksum_tree;
pub mod chunk_list;
pub mod client_list;
pub mod client_tree;
pub mod format;
pub mod fs;
pub mod gc;
pub mod idpath;
pub mod lock;
pub mod repo_tree;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use burrow_storage::StorageBackend;
use burrow_types::error::{BurrowError, Result};
use burrow_types::{Checksum, ChunkId, ClientId, GenerationId};

use crate::bag::{BagStore, BlobStore};
use crate::config::RepositoryConfig;
use crate::filter::{filter_from_config, RepositoryFilter};

use self::checksum_tree::ChecksumTree;
use self::chunk_list::ChunkList;
use self::client_list::ClientList;
use self::client_tree::{ClientMetadataTree, GenerationKey};
use self::fs::RepositoryFs;
use self::gc::{drop_reference, RemovedGenerations};
use self::idpath::IdPath;
use self::lock::LockManager;

/// Lock directory of the client list: the repository root.
const CLIENT_LIST_LOCK_DIR: &str = ".";

/// Chunk files, bucketed by [`IdPath`].
pub const CHUNKS_DIR: &str = "chunks";

/// Directories locked together as "the chunk indexes".
const CHUNK_INDEX_DIRS: [&str; 3] = [
    chunk_list::CHUNK_LIST_DIR,
    checksum_tree::CHECKSUM_TREE_DIR,
    CHUNKS_DIR,
];

const CLIENT_LIST_RESOURCE: &str = "client list";
const CHUNK_INDEXES_RESOURCE: &str = "chunk indexes";

fn client_resource(name: &str) -> String {
    format!("client '{name}'")
}

/// Replace the directory name in a lock error with a name users recognize.
fn relabel(err: BurrowError, resource: &str) -> BurrowError {
    match err {
        BurrowError::LockFailed { reason, .. } => BurrowError::LockFailed {
            resource: resource.to_string(),
            reason,
        },
        BurrowError::AlreadyLocked(_) => BurrowError::AlreadyLocked(resource.to_string()),
        BurrowError::LockMarkerMissing(_) => BurrowError::NotLocked(resource.to_string()),
        other => other,
    }
}

/// A handle to a repository.
///
/// Three kinds of resource are locked independently: the client list, each
/// client's metadata, and the shared chunk indexes. Mutations need the
/// matching lock; `commit_*` persists and releases, `unlock_*` discards
/// and releases.
pub struct Repository {
    fs: Arc<RepositoryFs>,
    config: RepositoryConfig,
    locks: LockManager,
    client_list: ClientList,
    removed_clients: Vec<(String, ClientId)>,
    clients: HashMap<String, ClientMetadataTree>,
    chunk_list: ChunkList,
    checksum_tree: ChecksumTree,
    chunk_idpath: IdPath,
    prev_chunk_id: Option<ChunkId>,
    removed_generations: HashMap<String, RemovedGenerations>,
    /// Chunks unreferenced in the working indexes, deleted on index commit.
    pending_gc: BTreeSet<ChunkId>,
}

impl Repository {
    /// Open a repository with the filter the configuration asks for.
    pub fn open(storage: Box<dyn StorageBackend>, config: RepositoryConfig) -> Result<Self> {
        let filter = filter_from_config(&config.compression);
        Self::open_with_filter(storage, filter, config)
    }

    /// Open a repository, failing on an incompatible format marker. A
    /// missing marker is fine: it is written with the first lock.
    pub fn open_with_filter(
        storage: Box<dyn StorageBackend>,
        filter: Box<dyn RepositoryFilter>,
        config: RepositoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        format::check_format(storage.as_ref())?;

        let fs = Arc::new(RepositoryFs::new(storage, filter));
        let node_size = config.node_size;
        let idpath = &config.idpath;
        Ok(Self {
            locks: LockManager::new(
                Arc::clone(&fs),
                config.lock_timeout(),
                config.lock_retry_interval(),
            ),
            client_list: ClientList::new(Arc::clone(&fs), node_size),
            removed_clients: Vec::new(),
            clients: HashMap::new(),
            chunk_list: ChunkList::new(Arc::clone(&fs), node_size),
            checksum_tree: ChecksumTree::new(Arc::clone(&fs), node_size),
            chunk_idpath: IdPath::new(CHUNKS_DIR, idpath.depth, idpath.bits, idpath.skip),
            prev_chunk_id: None,
            removed_generations: HashMap::new(),
            pending_gc: BTreeSet::new(),
            config,
            fs,
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// A blob store keeping its bags in `dirname`.
    pub fn blob_store(&self, dirname: &str) -> BlobStore {
        BlobStore::new(
            BagStore::new(Arc::clone(&self.fs), dirname),
            self.config.max_bag_blobs,
        )
    }

    fn lock_dirs(&mut self, dirs: &[&str], resource: &str) -> Result<()> {
        self.locks.lock(dirs).map_err(|e| relabel(e, resource))?;
        if let Err(e) = format::ensure_format(self.fs.storage()) {
            if let Err(unlock_err) = self.locks.unlock(dirs) {
                warn!(resource, error = %unlock_err, "failed to release lock after format error");
            }
            return Err(e);
        }
        Ok(())
    }

    // ----- client list -------------------------------------------------

    fn require_client_list_lock(&self) -> Result<()> {
        if self.locks.got_lock(CLIENT_LIST_LOCK_DIR) {
            Ok(())
        } else {
            Err(BurrowError::NotLocked(CLIENT_LIST_RESOURCE.to_string()))
        }
    }

    pub fn get_client_names(&mut self) -> Result<Vec<String>> {
        self.client_list.list_client_names()
    }

    pub fn lock_client_list(&mut self) -> Result<()> {
        self.lock_dirs(&[CLIENT_LIST_LOCK_DIR], CLIENT_LIST_RESOURCE)?;
        self.client_list.tree().close();
        self.removed_clients.clear();
        debug!("client list locked");
        Ok(())
    }

    pub fn unlock_client_list(&mut self) -> Result<()> {
        self.require_client_list_lock()?;
        self.client_list.tree().close();
        self.removed_clients.clear();
        self.locks
            .unlock(&[CLIENT_LIST_LOCK_DIR])
            .map_err(|e| relabel(e, CLIENT_LIST_RESOURCE))
    }

    /// Persist client additions and removals, then release the lock.
    ///
    /// Removed clients lose their directory and their chunk references
    /// here, so committing a removal also needs the chunk index lock. The
    /// freed chunk files go when the indexes are committed.
    pub fn commit_client_list(&mut self) -> Result<()> {
        self.require_client_list_lock()?;
        if !self.removed_clients.is_empty() {
            self.require_chunk_indexes_lock()?;
            self.locks
                .verify(&CHUNK_INDEX_DIRS)
                .map_err(|e| relabel(e, CHUNK_INDEXES_RESOURCE))?;
        }
        self.locks
            .verify(&[CLIENT_LIST_LOCK_DIR])
            .map_err(|e| relabel(e, CLIENT_LIST_RESOURCE))?;
        self.client_list.tree().commit()?;
        for (name, client_id) in std::mem::take(&mut self.removed_clients) {
            self.purge_client(&name, client_id)?;
        }
        info!("client list committed");
        self.locks
            .unlock(&[CLIENT_LIST_LOCK_DIR])
            .map_err(|e| relabel(e, CLIENT_LIST_RESOURCE))
    }

    pub fn got_client_list_lock(&self) -> bool {
        self.locks.got_lock(CLIENT_LIST_LOCK_DIR)
    }

    pub fn client_list_is_locked(&self) -> Result<bool> {
        self.locks.is_locked(CLIENT_LIST_LOCK_DIR)
    }

    pub fn force_client_list_lock(&mut self) -> Result<()> {
        self.client_list.tree().close();
        self.removed_clients.clear();
        self.locks.force(&[CLIENT_LIST_LOCK_DIR])
    }

    pub fn add_client(&mut self, name: &str) -> Result<ClientId> {
        self.require_client_list_lock()?;
        let client_id = self.client_list.add_client(name)?;
        info!(client = name, id = %client_id, "client added");
        Ok(client_id)
    }

    pub fn remove_client(&mut self, name: &str) -> Result<()> {
        self.require_client_list_lock()?;
        let client_id = self.client_list.remove_client(name)?;
        self.removed_clients.push((name.to_string(), client_id));
        info!(client = name, id = %client_id, "client removed");
        Ok(())
    }

    pub fn rename_client(&mut self, old: &str, new: &str) -> Result<()> {
        self.require_client_list_lock()?;
        let client_id = self.client_list.rename_client(old, new)?;
        if let Some(tree) = self.clients.remove(old) {
            self.clients.insert(new.to_string(), tree);
        }
        if let Some(removed) = self.removed_generations.remove(old) {
            self.removed_generations.insert(new.to_string(), removed);
        }
        info!(from = old, to = new, id = %client_id, "client renamed");
        Ok(())
    }

    pub fn get_client_id(&mut self, name: &str) -> Result<ClientId> {
        self.client_list
            .get_client_id(name)?
            .ok_or_else(|| BurrowError::ClientNotFound(name.to_string()))
    }

    pub fn get_client_key_id(&mut self, name: &str) -> Result<Option<String>> {
        self.client_list.get_client_key_id(name)
    }

    pub fn set_client_key_id(&mut self, name: &str, key_id: Option<&str>) -> Result<()> {
        self.require_client_list_lock()?;
        self.client_list.set_client_key_id(name, key_id)
    }

    fn purge_client(&mut self, name: &str, client_id: ClientId) -> Result<()> {
        if let Some(mut tree) = self.clients.remove(name) {
            tree.close();
        }
        self.removed_generations.remove(name);
        self.fs.remove_dir(&client_id.to_string())?;

        let refs = self.checksum_tree.chunks_of_client(client_id)?;
        let mut unreferenced = 0;
        for &(checksum, chunk_id) in &refs {
            if drop_reference(
                &mut self.chunk_list,
                &mut self.checksum_tree,
                chunk_id,
                Some(checksum),
                client_id,
            )? {
                self.pending_gc.insert(chunk_id);
                unreferenced += 1;
            }
        }
        debug!(
            client = name,
            refs = refs.len(),
            unreferenced,
            "dropped chunk references of removed client"
        );
        Ok(())
    }

    /// Drop references held by client ids missing from the client list,
    /// left behind by older repositories or interrupted removals. Returns
    /// the number of references dropped. Chunks left unreferenced are
    /// deleted when the indexes are committed.
    pub fn remove_orphaned_references(&mut self) -> Result<usize> {
        self.require_chunk_indexes_lock()?;
        let known = self.client_list.list_client_ids()?;
        let mut dropped = 0;
        let mut unreferenced = 0;
        for (checksum, chunk_id, client_id) in self.checksum_tree.all_refs()? {
            if known.contains(&client_id) {
                continue;
            }
            dropped += 1;
            if drop_reference(
                &mut self.chunk_list,
                &mut self.checksum_tree,
                chunk_id,
                Some(checksum),
                client_id,
            )? {
                self.pending_gc.insert(chunk_id);
                unreferenced += 1;
            }
        }
        if dropped > 0 {
            info!(refs = dropped, unreferenced, "orphaned chunk references dropped");
        }
        Ok(dropped)
    }

    // ----- per-client locking ------------------------------------------

    fn client_dir(&mut self, name: &str) -> Result<(ClientId, String)> {
        let client_id = self.get_client_id(name)?;
        Ok((client_id, client_id.to_string()))
    }

    fn require_client_lock(&mut self, name: &str) -> Result<()> {
        let (_, dir) = self.client_dir(name)?;
        if self.locks.got_lock(&dir) {
            Ok(())
        } else {
            Err(BurrowError::NotLocked(client_resource(name)))
        }
    }

    pub fn lock_client(&mut self, name: &str) -> Result<()> {
        if !self.got_client_list_lock() {
            // Pick up clients committed by other handles.
            self.client_list.tree().close();
        }
        let (client_id, dir) = self.client_dir(name)?;
        self.lock_dirs(&[dir.as_str()], &client_resource(name))?;
        let tree = ClientMetadataTree::new(
            Arc::clone(&self.fs),
            name,
            client_id,
            self.config.node_size,
        );
        if let Some(mut old) = self.clients.insert(name.to_string(), tree) {
            old.close();
        }
        self.removed_generations.remove(name);
        debug!(client = name, "client locked");
        Ok(())
    }

    /// Release the client without keeping its changes, generation
    /// removals included.
    pub fn unlock_client(&mut self, name: &str) -> Result<()> {
        self.require_client_lock(name)?;
        if let Some(mut tree) = self.clients.remove(name) {
            tree.close();
        }
        self.removed_generations.remove(name);
        let (_, dir) = self.client_dir(name)?;
        self.locks
            .unlock(&[dir.as_str()])
            .map_err(|e| relabel(e, &client_resource(name)))
    }

    /// Persist the client's metadata, then release the lock.
    ///
    /// Generation removals reach the chunk indexes here, once the metadata
    /// without those generations is on disk: references that no remaining
    /// generation uses are dropped from the working indexes. That needs the
    /// chunk index lock, and the freed chunk files are deleted when the
    /// indexes are committed.
    pub fn commit_client(&mut self, name: &str) -> Result<()> {
        self.require_client_lock(name)?;
        let (client_id, dir) = self.client_dir(name)?;
        let removed = self.removed_generations.contains_key(name);
        if removed {
            self.require_chunk_indexes_lock()?;
            self.locks
                .verify(&CHUNK_INDEX_DIRS)
                .map_err(|e| relabel(e, CHUNK_INDEXES_RESOURCE))?;
        }
        self.locks
            .verify(&[dir.as_str()])
            .map_err(|e| relabel(e, &client_resource(name)))?;

        let mut kept = BTreeSet::new();
        if removed {
            let client = self.client(name)?;
            for generation in client.list_generations()? {
                kept.extend(client.get_generation_chunk_ids(generation)?);
            }
        }
        if let Some(tree) = self.clients.get_mut(name) {
            tree.commit()?;
        }
        if let Some(mut tree) = self.clients.remove(name) {
            tree.close();
        }
        if let Some(removed) = self.removed_generations.remove(name) {
            self.release_chunks(name, client_id, &removed, &kept)?;
        }
        self.locks
            .unlock(&[dir.as_str()])
            .map_err(|e| relabel(e, &client_resource(name)))
    }

    fn release_chunks(
        &mut self,
        name: &str,
        client_id: ClientId,
        removed: &RemovedGenerations,
        kept: &BTreeSet<ChunkId>,
    ) -> Result<()> {
        let mut unreferenced = 0;
        for &chunk_id in removed.chunks.difference(kept) {
            if drop_reference(
                &mut self.chunk_list,
                &mut self.checksum_tree,
                chunk_id,
                None,
                client_id,
            )? {
                self.pending_gc.insert(chunk_id);
                unreferenced += 1;
            }
        }
        debug!(
            client = name,
            generations = removed.generations.len(),
            candidates = removed.chunks.len(),
            unreferenced,
            "chunk references of removed generations dropped"
        );
        Ok(())
    }

    pub fn got_client_lock(&mut self, name: &str) -> Result<bool> {
        let (_, dir) = self.client_dir(name)?;
        Ok(self.locks.got_lock(&dir))
    }

    pub fn client_is_locked(&mut self, name: &str) -> Result<bool> {
        let (_, dir) = self.client_dir(name)?;
        self.locks.is_locked(&dir)
    }

    pub fn force_client_lock(&mut self, name: &str) -> Result<()> {
        let (_, dir) = self.client_dir(name)?;
        if let Some(mut tree) = self.clients.remove(name) {
            tree.close();
        }
        self.removed_generations.remove(name);
        self.locks.force(&[dir.as_str()])
    }

    /// The client's metadata tree: the locked one if this handle holds the
    /// lock, otherwise a read-only view opened on first use.
    fn client(&mut self, name: &str) -> Result<&mut ClientMetadataTree> {
        if !self.clients.contains_key(name) {
            let (client_id, _) = self.client_dir(name)?;
            let tree = ClientMetadataTree::new(
                Arc::clone(&self.fs),
                name,
                client_id,
                self.config.node_size,
            );
            self.clients.insert(name.to_string(), tree);
        }
        self.clients
            .get_mut(name)
            .ok_or_else(|| BurrowError::ClientNotFound(name.to_string()))
    }

    fn locked_client(&mut self, name: &str) -> Result<&mut ClientMetadataTree> {
        self.require_client_lock(name)?;
        self.client(name)
    }

    // ----- generations -------------------------------------------------

    pub fn list_generations(&mut self, name: &str) -> Result<Vec<GenerationId>> {
        self.client(name)?.list_generations()
    }

    pub fn start_generation(&mut self, name: &str) -> Result<GenerationId> {
        self.locked_client(name)?.start_generation()
    }

    pub fn current_generation(&mut self, name: &str) -> Result<Option<GenerationId>> {
        self.client(name)?.current_generation()
    }

    /// Resolve `latest` or a numeric generation id.
    pub fn interpret_generation_spec(&mut self, name: &str, spec: &str) -> Result<GenerationId> {
        let generations = self.list_generations(name)?;
        if spec == "latest" {
            return generations
                .last()
                .copied()
                .ok_or_else(|| BurrowError::ClientHasNoGenerations(name.to_string()));
        }
        let not_found = || BurrowError::GenerationNotFound {
            client: name.to_string(),
            generation: spec.to_string(),
        };
        let id: GenerationId = spec.parse().map_err(|_| not_found())?;
        if generations.contains(&id) {
            Ok(id)
        } else {
            Err(not_found())
        }
    }

    pub fn get_generation_times(
        &mut self,
        name: &str,
        generation: GenerationId,
    ) -> Result<(Option<u64>, Option<u64>)> {
        self.client(name)?.get_generation_times(generation)
    }

    pub fn get_is_checkpoint(&mut self, name: &str, generation: GenerationId) -> Result<bool> {
        self.client(name)?.get_is_checkpoint(generation)
    }

    pub fn set_is_checkpoint(&mut self, name: &str, is_checkpoint: bool) -> Result<()> {
        self.locked_client(name)?.set_is_checkpoint(is_checkpoint)
    }

    pub fn get_generation_key(
        &mut self,
        name: &str,
        generation: GenerationId,
        which: GenerationKey,
    ) -> Result<Option<u64>> {
        self.client(name)?.get_generation_key(generation, which)
    }

    pub fn set_generation_key(
        &mut self,
        name: &str,
        which: GenerationKey,
        value: Option<u64>,
    ) -> Result<()> {
        self.locked_client(name)?.set_generation_key(which, value)
    }

    pub fn get_generation_chunk_ids(
        &mut self,
        name: &str,
        generation: GenerationId,
    ) -> Result<BTreeSet<ChunkId>> {
        self.client(name)?.get_generation_chunk_ids(generation)
    }

    /// Remove a generation from the client's metadata.
    ///
    /// Needs both the client lock and the chunk index lock. The chunk
    /// indexes are only touched when the client is committed; chunks left
    /// without references are deleted once the indexes are committed too.
    /// Removing the open generation is allowed and leaves the client with
    /// no open generation.
    pub fn remove_generation(&mut self, name: &str, generation: GenerationId) -> Result<()> {
        self.require_client_lock(name)?;
        self.require_chunk_indexes_lock()?;

        let client = self.client(name)?;
        let chunks = client.get_generation_chunk_ids(generation)?;
        client.remove_generation(generation)?;
        let removed = self.removed_generations.entry(name.to_string()).or_default();
        removed.generations.push(generation);
        removed.chunks.extend(chunks);
        debug!(
            client = name,
            generation = %generation,
            candidates = removed.chunks.len(),
            "generation removal pending until commit"
        );
        Ok(())
    }

    // ----- files -------------------------------------------------------

    pub fn create(&mut self, name: &str, path: &str, metadata: &[u8]) -> Result<()> {
        self.locked_client(name)?.create(path, metadata)
    }

    pub fn set_metadata(&mut self, name: &str, path: &str, metadata: &[u8]) -> Result<()> {
        self.locked_client(name)?.set_metadata(path, metadata)
    }

    pub fn remove(&mut self, name: &str, path: &str) -> Result<()> {
        self.locked_client(name)?.remove(path)
    }

    pub fn get_metadata(
        &mut self,
        name: &str,
        generation: GenerationId,
        path: &str,
    ) -> Result<Vec<u8>> {
        self.client(name)?.get_metadata(generation, path)
    }

    pub fn file_exists(&mut self, name: &str, generation: GenerationId, path: &str) -> Result<bool> {
        self.client(name)?.file_exists(generation, path)
    }

    pub fn listdir(
        &mut self,
        name: &str,
        generation: GenerationId,
        dirname: &str,
    ) -> Result<Vec<String>> {
        self.client(name)?.listdir(generation, dirname)
    }

    pub fn get_file_chunks(
        &mut self,
        name: &str,
        generation: GenerationId,
        path: &str,
    ) -> Result<Vec<ChunkId>> {
        self.client(name)?.get_file_chunks(generation, path)
    }

    pub fn set_file_chunks(&mut self, name: &str, path: &str, chunk_ids: &[ChunkId]) -> Result<()> {
        self.locked_client(name)?.set_file_chunks(path, chunk_ids)
    }

    pub fn append_file_chunks(
        &mut self,
        name: &str,
        path: &str,
        chunk_ids: &[ChunkId],
    ) -> Result<()> {
        self.locked_client(name)?.append_file_chunks(path, chunk_ids)
    }

    pub fn chunk_in_use(
        &mut self,
        name: &str,
        generation: GenerationId,
        chunk_id: ChunkId,
    ) -> Result<bool> {
        self.client(name)?.chunk_in_use(generation, chunk_id)
    }

    // ----- chunks ------------------------------------------------------

    fn chunk_key(&self, chunk_id: ChunkId) -> String {
        self.chunk_idpath.convert(chunk_id.0)
    }

    pub fn checksum(&self, data: &[u8]) -> Checksum {
        Checksum::compute(data)
    }

    /// Store chunk bytes under a fresh id. Ids follow the previous one so
    /// that neighbouring chunks share a bucket; a taken id re-rolls a
    /// random one. No lock is needed.
    pub fn put_chunk_only(&mut self, data: &[u8]) -> Result<ChunkId> {
        let mut chunk_id = match self.prev_chunk_id {
            Some(prev) => ChunkId(prev.0.wrapping_add(1)),
            None => ChunkId::random(),
        };
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fs.write_new(&self.chunk_key(chunk_id), data) {
                Ok(()) => break,
                Err(BurrowError::AlreadyExists(_)) => {
                    debug!(chunk = %chunk_id, attempt, "chunk id taken, picking another");
                    chunk_id = ChunkId::random();
                }
                Err(e) => return Err(e),
            }
        }
        self.prev_chunk_id = Some(chunk_id);
        debug!(chunk = %chunk_id, size = data.len(), "chunk written");
        Ok(chunk_id)
    }

    /// Record a stored chunk in the chunk list and as referenced by `name`.
    pub fn put_chunk_in_shared_trees(
        &mut self,
        name: &str,
        chunk_id: ChunkId,
        checksum: &Checksum,
    ) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(name)?;
        self.chunk_list.add(chunk_id, checksum)?;
        self.checksum_tree.add(checksum, chunk_id, client_id)
    }

    /// Store `data` for a client, reusing an identical stored chunk when
    /// there is one.
    pub fn backup_chunk(&mut self, name: &str, data: &[u8]) -> Result<ChunkId> {
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(name)?;
        let checksum = self.checksum(data);
        for candidate in self.checksum_tree.find_chunks(&checksum)? {
            if self.fs.cat(&self.chunk_key(candidate))?.as_deref() == Some(data) {
                self.checksum_tree.add(&checksum, candidate, client_id)?;
                debug!(client = name, chunk = %candidate, "chunk deduplicated");
                return Ok(candidate);
            }
            warn!(chunk = %candidate, checksum = %checksum, "checksum collision");
        }
        let chunk_id = self.put_chunk_only(data)?;
        self.put_chunk_in_shared_trees(name, chunk_id, &checksum)?;
        Ok(chunk_id)
    }

    pub fn find_chunks(&mut self, checksum: &Checksum) -> Result<Vec<ChunkId>> {
        self.checksum_tree.find_chunks(checksum)
    }

    /// Chunks whose stored bytes equal `data`.
    pub fn find_chunks_by_content(&mut self, data: &[u8]) -> Result<Vec<ChunkId>> {
        let checksum = self.checksum(data);
        let mut found = Vec::new();
        for candidate in self.checksum_tree.find_chunks(&checksum)? {
            if self.fs.cat(&self.chunk_key(candidate))?.as_deref() == Some(data) {
                found.push(candidate);
            }
        }
        Ok(found)
    }

    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Vec<u8>> {
        self.fs
            .cat(&self.chunk_key(chunk_id))?
            .ok_or(BurrowError::ChunkNotFound(chunk_id))
    }

    pub fn has_chunk(&self, chunk_id: ChunkId) -> Result<bool> {
        self.fs.exists(&self.chunk_key(chunk_id))
    }

    /// Delete a chunk file. Does not touch the indexes.
    pub fn remove_chunk(&mut self, chunk_id: ChunkId) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.fs.remove(&self.chunk_key(chunk_id))
    }

    pub fn list_chunks(&self) -> Result<Vec<ChunkId>> {
        Ok(self
            .fs
            .list_dir(CHUNKS_DIR)?
            .iter()
            .filter_map(|key| self.chunk_idpath.parse(key))
            .map(ChunkId)
            .collect())
    }

    /// Drop one client's reference to a chunk. Returns whether the chunk
    /// is now unreferenced, in which case it has also left the chunk list.
    pub fn remove_chunk_from_indexes(&mut self, chunk_id: ChunkId, name: &str) -> Result<bool> {
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(name)?;
        drop_reference(
            &mut self.chunk_list,
            &mut self.checksum_tree,
            chunk_id,
            None,
            client_id,
        )
    }

    /// Drop every client's reference to a chunk and the chunk list entry.
    /// Returns whether the chunk was indexed at all.
    pub fn remove_chunk_from_indexes_for_all_clients(&mut self, chunk_id: ChunkId) -> Result<bool> {
        self.require_chunk_indexes_lock()?;
        let Some(checksum) = self.chunk_list.get_checksum(chunk_id)? else {
            return Ok(false);
        };
        for client_id in self.checksum_tree.clients_of(&checksum, chunk_id)? {
            self.checksum_tree.remove(&checksum, chunk_id, client_id)?;
        }
        self.chunk_list.remove(chunk_id)?;
        Ok(true)
    }

    /// Compare a chunk's bytes with its recorded checksum. `None` when the
    /// chunk has no recorded checksum.
    pub fn validate_chunk_content(&mut self, chunk_id: ChunkId) -> Result<Option<bool>> {
        let Some(expected) = self.chunk_list.get_checksum(chunk_id)? else {
            return Ok(None);
        };
        let data = self.get_chunk(chunk_id)?;
        Ok(Some(Checksum::compute(&data) == expected))
    }

    // ----- chunk indexes -----------------------------------------------

    pub fn got_chunk_indexes_lock(&self) -> bool {
        CHUNK_INDEX_DIRS.iter().all(|dir| self.locks.got_lock(dir))
    }

    fn require_chunk_indexes_lock(&self) -> Result<()> {
        if self.got_chunk_indexes_lock() {
            Ok(())
        } else {
            Err(BurrowError::NotLocked(CHUNK_INDEXES_RESOURCE.to_string()))
        }
    }

    pub fn chunk_indexes_are_locked(&self) -> Result<bool> {
        for dir in CHUNK_INDEX_DIRS {
            if self.locks.is_locked(dir)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn close_chunk_indexes(&mut self) {
        self.chunk_list.tree().close();
        self.checksum_tree.tree().close();
    }

    pub fn lock_chunk_indexes(&mut self) -> Result<()> {
        self.lock_dirs(&CHUNK_INDEX_DIRS, CHUNK_INDEXES_RESOURCE)?;
        self.close_chunk_indexes();
        debug!("chunk indexes locked");
        Ok(())
    }

    /// Release the indexes without keeping their changes. Pending chunk
    /// deletions that relied on them are forgotten.
    pub fn unlock_chunk_indexes(&mut self) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.close_chunk_indexes();
        self.pending_gc.clear();
        self.locks
            .unlock(&CHUNK_INDEX_DIRS)
            .map_err(|e| relabel(e, CHUNK_INDEXES_RESOURCE))
    }

    /// Persist the chunk list, then the checksum tree, then release.
    pub fn commit_chunk_indexes(&mut self) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.locks
            .verify(&CHUNK_INDEX_DIRS)
            .map_err(|e| relabel(e, CHUNK_INDEXES_RESOURCE))?;
        self.chunk_list.tree().commit()?;
        self.checksum_tree.tree().commit()?;
        self.run_pending_gc()?;
        info!("chunk indexes committed");
        self.locks
            .unlock(&CHUNK_INDEX_DIRS)
            .map_err(|e| relabel(e, CHUNK_INDEXES_RESOURCE))
    }

    pub fn force_chunk_indexes_lock(&mut self) -> Result<()> {
        self.close_chunk_indexes();
        self.pending_gc.clear();
        self.locks.force(&CHUNK_INDEX_DIRS)
    }

    // ----- deferred deletion -------------------------------------------

    /// Delete chunk files left unreferenced by the indexes just committed.
    fn run_pending_gc(&mut self) -> Result<()> {
        for chunk_id in std::mem::take(&mut self.pending_gc) {
            if self.chunk_list.get_checksum(chunk_id)?.is_some() {
                debug!(chunk = %chunk_id, "chunk indexed again, keeping it");
                continue;
            }
            self.fs.remove(&self.chunk_key(chunk_id))?;
            debug!(chunk = %chunk_id, "unreferenced chunk deleted");
        }
        Ok(())
    }
}
