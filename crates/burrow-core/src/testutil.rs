use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use burrow_storage::StorageBackend;
use burrow_types::error::{BurrowError, Result};

use crate::config::RepositoryConfig;
use crate::filter::{Passthrough, RepositoryFilter};
use crate::repo::fs::RepositoryFs;
use crate::repo::Repository;

/// In-memory storage backend for testing. Clones share the same contents,
/// which is how tests open two handles on one repository.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    reads: Arc<AtomicUsize>,
    lists: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of `get` calls since creation or the last reset.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reset_reads(&self) {
        self.reads.store(0, Ordering::SeqCst);
    }

    /// Number of `list` calls since creation.
    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn put_new(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        if map.contains_key(key) {
            return Err(BurrowError::AlreadyExists(key.to_string()));
        }
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let prefix = prefix.trim_end_matches('/');
        let map = self.data.lock().unwrap();
        Ok(map
            .keys()
            .filter(|k| prefix.is_empty() || k.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect())
    }

    fn has_keys_besides(&self, prefix: &str, except: &str) -> Result<bool> {
        let below = format!("{}/", prefix.trim_end_matches('/'));
        let map = self.data.lock().unwrap();
        Ok(map.keys().any(|k| k.starts_with(&below) && k != except))
    }

    fn create_dir(&self, _key: &str) -> Result<()> {
        // No-op for in-memory backend
        Ok(())
    }
}

/// Filter that prepends a marker to everything it writes and records which
/// toplevels it was asked to initialize.
#[derive(Clone, Default)]
pub struct TaggingFilter {
    inits: Arc<Mutex<Vec<String>>>,
}

impl TaggingFilter {
    pub const TAG: &'static [u8] = b"TAG:";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn inits(&self) -> Vec<String> {
        self.inits.lock().unwrap().clone()
    }
}

impl RepositoryFilter for TaggingFilter {
    fn filter_read(&self, _toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        data.strip_prefix(Self::TAG)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| BurrowError::Corrupt("untagged blob".into()))
    }

    fn filter_write(&self, _toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut out = Self::TAG.to_vec();
        out.extend_from_slice(&data);
        Ok(out)
    }

    fn toplevel_init(&self, _storage: &dyn StorageBackend, toplevel: &str) -> Result<()> {
        self.inits.lock().unwrap().push(toplevel.to_string());
        Ok(())
    }
}

/// Settings that keep tests fast: no lock waiting, tiny leaves so trees
/// split early.
pub fn test_config() -> RepositoryConfig {
    RepositoryConfig {
        lock_timeout_secs: 0,
        lock_retry_ms: 1,
        node_size: 256,
        max_bag_blobs: 4,
        ..RepositoryConfig::default()
    }
}

pub fn test_fs(storage: &MemoryBackend) -> Arc<RepositoryFs> {
    Arc::new(RepositoryFs::new(
        Box::new(storage.clone()),
        Box::new(Passthrough),
    ))
}

/// Open a repository on shared in-memory storage.
pub fn open_repo(storage: &MemoryBackend) -> Repository {
    Repository::open(Box::new(storage.clone()), test_config()).unwrap()
}

/// A fresh repository and the storage under it.
pub fn test_repo() -> (MemoryBackend, Repository) {
    let storage = MemoryBackend::new();
    let repo = open_repo(&storage);
    (storage, repo)
}

/// A repository with one registered client, committed.
pub fn test_repo_with_client(name: &str) -> (MemoryBackend, Repository) {
    let (storage, mut repo) = test_repo();
    repo.lock_client_list().unwrap();
    repo.add_client(name).unwrap();
    repo.commit_client_list().unwrap();
    (storage, repo)
}
