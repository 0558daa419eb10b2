//! The repository-wide directory of clients.
//!
//! Keys are `name_hash(16) | client_id(8) | subkey(1)`. Hashing the name
//! keeps keys fixed-width; the literal name is stored under `CLIENT_NAME`
//! and compared on lookup, so two names sharing a hash never mix.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use burrow_types::error::{BurrowError, Result};
use burrow_types::{Checksum, ClientId};

use crate::forest::{OrderedMap, Tree};

use super::fs::RepositoryFs;
use super::repo_tree::RepositoryTree;

pub const CLIENT_LIST_DIR: &str = "clientlist";

const NAME_HASH_LEN: usize = 16;
pub const KEY_SIZE: usize = NAME_HASH_LEN + 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Subkey {
    ClientName = 0,
    KeyId = 1,
}

fn name_hash(name: &str) -> [u8; NAME_HASH_LEN] {
    let digest = Checksum::compute(name.as_bytes());
    let mut out = [0u8; NAME_HASH_LEN];
    out.copy_from_slice(&digest.0[..NAME_HASH_LEN]);
    out
}

fn key(hash: &[u8; NAME_HASH_LEN], id: u64, subkey: u8) -> Vec<u8> {
    let mut k = Vec::with_capacity(KEY_SIZE);
    k.extend_from_slice(hash);
    k.extend_from_slice(&id.to_be_bytes());
    k.push(subkey);
    k
}

fn unkey(k: &[u8]) -> Option<(ClientId, u8)> {
    if k.len() != KEY_SIZE {
        return None;
    }
    let id: [u8; 8] = k[NAME_HASH_LEN..NAME_HASH_LEN + 8].try_into().ok()?;
    Some((ClientId::from_be_bytes(id), k[KEY_SIZE - 1]))
}

fn find_id(tree: &Tree, name: &str) -> Result<Option<ClientId>> {
    let hash = name_hash(name);
    Ok(tree
        .lookup_range(&key(&hash, 0, 0), &key(&hash, u64::MAX, u8::MAX))?
        .into_iter()
        .find_map(|(k, v)| match unkey(&k) {
            Some((id, sub)) if sub == Subkey::ClientName as u8 && v == name.as_bytes() => Some(id),
            _ => None,
        }))
}

fn all_entries(tree: &Tree) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    tree.lookup_range(&[0u8; KEY_SIZE], &[0xffu8; KEY_SIZE])
}

pub struct ClientList {
    tree: RepositoryTree,
}

impl ClientList {
    pub fn new(fs: Arc<RepositoryFs>, node_size: usize) -> Self {
        Self {
            tree: RepositoryTree::new(fs, CLIENT_LIST_DIR, KEY_SIZE, node_size, true),
        }
    }

    pub fn tree(&mut self) -> &mut RepositoryTree {
        &mut self.tree
    }

    /// Every registered client name, in key order.
    pub fn list_client_names(&mut self) -> Result<Vec<String>> {
        let Some(tree) = self.tree.view()? else {
            return Ok(Vec::new());
        };
        Ok(all_entries(tree)?
            .into_iter()
            .filter(|(k, _)| matches!(unkey(k), Some((_, sub)) if sub == Subkey::ClientName as u8))
            .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
            .collect())
    }

    /// Ids of every registered client.
    pub fn list_client_ids(&mut self) -> Result<BTreeSet<ClientId>> {
        let Some(tree) = self.tree.view()? else {
            return Ok(BTreeSet::new());
        };
        Ok(all_entries(tree)?
            .iter()
            .filter_map(|(k, _)| unkey(k).map(|(id, _)| id))
            .collect())
    }

    pub fn get_client_id(&mut self, name: &str) -> Result<Option<ClientId>> {
        match self.tree.view()? {
            Some(tree) => find_id(tree, name),
            None => Ok(None),
        }
    }

    pub fn get_client_key_id(&mut self, name: &str) -> Result<Option<String>> {
        let not_found = || BurrowError::ClientNotFound(name.to_string());
        let tree = self.tree.view()?.ok_or_else(not_found)?;
        let id = find_id(tree, name)?.ok_or_else(not_found)?;
        Ok(tree
            .lookup(&key(&name_hash(name), id.0, Subkey::KeyId as u8))?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn unused_id(tree: &Tree) -> Result<ClientId> {
        let used: BTreeSet<ClientId> = all_entries(tree)?
            .iter()
            .filter_map(|(k, _)| unkey(k).map(|(id, _)| id))
            .collect();
        loop {
            let candidate = ClientId::random();
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Register a new client in the working tree.
    pub fn add_client(&mut self, name: &str) -> Result<ClientId> {
        let tree = self.tree.working_tree()?;
        if find_id(tree, name)?.is_some() {
            return Err(BurrowError::ClientAlreadyExists(name.to_string()));
        }
        let id = Self::unused_id(tree)?;
        tree.insert(
            &key(&name_hash(name), id.0, Subkey::ClientName as u8),
            name.as_bytes(),
        )?;
        debug!(client = name, id = %id, "client registered");
        Ok(id)
    }

    /// Drop a client from the working tree, returning its id.
    pub fn remove_client(&mut self, name: &str) -> Result<ClientId> {
        let tree = self.tree.working_tree()?;
        let id = find_id(tree, name)?.ok_or_else(|| BurrowError::ClientNotFound(name.to_string()))?;
        let hash = name_hash(name);
        tree.remove_range(&key(&hash, id.0, 0), &key(&hash, id.0, u8::MAX))?;
        Ok(id)
    }

    /// Give a client a new name. The id, and with it the client's data,
    /// stays the same.
    pub fn rename_client(&mut self, old: &str, new: &str) -> Result<ClientId> {
        let tree = self.tree.working_tree()?;
        let id = find_id(tree, old)?.ok_or_else(|| BurrowError::ClientNotFound(old.to_string()))?;
        if find_id(tree, new)?.is_some() {
            return Err(BurrowError::ClientAlreadyExists(new.to_string()));
        }
        let old_hash = name_hash(old);
        let new_hash = name_hash(new);
        let key_id = tree.lookup(&key(&old_hash, id.0, Subkey::KeyId as u8))?;
        tree.remove_range(&key(&old_hash, id.0, 0), &key(&old_hash, id.0, u8::MAX))?;
        tree.insert(
            &key(&new_hash, id.0, Subkey::ClientName as u8),
            new.as_bytes(),
        )?;
        if let Some(key_id) = key_id {
            tree.insert(&key(&new_hash, id.0, Subkey::KeyId as u8), &key_id)?;
        }
        Ok(id)
    }

    /// Set or clear the encryption key id recorded for a client.
    pub fn set_client_key_id(&mut self, name: &str, key_id: Option<&str>) -> Result<()> {
        let tree = self.tree.working_tree()?;
        let id = find_id(tree, name)?.ok_or_else(|| BurrowError::ClientNotFound(name.to_string()))?;
        let k = key(&name_hash(name), id.0, Subkey::KeyId as u8);
        match key_id {
            Some(key_id) => tree.insert(&k, key_id.as_bytes())?,
            None => {
                tree.remove(&k)?;
            }
        }
        Ok(())
    }
}
