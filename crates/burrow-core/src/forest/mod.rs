//! A forest of copy-on-write trees persisted in one directory.
//!
//! Layout inside the forest directory:
//!
//! - `metadata`: the root record listing every tree and its leaf node ids.
//!   Overwriting this file is the commit point.
//! - `nodes/<hex id>`: immutable leaf nodes. A node file is never modified
//!   after it is written; it is deleted once no committed tree uses it.

pub mod store;
pub mod tree;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use burrow_types::error::{BurrowError, Result};

use crate::repo::fs::RepositoryFs;
pub use store::NodeStore;
pub use tree::{Node, OrderedMap, Tree};
use tree::Leaf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

#[derive(Debug, Serialize, Deserialize)]
struct ForestMeta {
    key_size: usize,
    node_size: usize,
    last_id: u64,
    trees: Vec<TreeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeRecord {
    id: u64,
    leaves: Vec<LeafRecord>,
}

/// Enough about a leaf to route lookups without reading it.
#[derive(Debug, Serialize, Deserialize)]
struct LeafRecord {
    node: u64,
    first_key: Vec<u8>,
    bytes: usize,
}

pub struct Forest {
    fs: Arc<RepositoryFs>,
    store: Arc<NodeStore>,
    dirname: String,
    key_size: usize,
    node_size: usize,
    last_id: u64,
    trees: Vec<(TreeId, Tree)>,
    stored_nodes: BTreeSet<u64>,
}

impl Forest {
    /// Open the forest in `dirname`, or start an empty one if nothing has
    /// been committed there yet. Only the root record is read; leaves are
    /// fetched when a lookup reaches them.
    pub fn open(
        fs: Arc<RepositoryFs>,
        dirname: &str,
        key_size: usize,
        node_size: usize,
    ) -> Result<Self> {
        let mut forest = Forest {
            store: Arc::new(NodeStore::new(Arc::clone(&fs), dirname)),
            fs,
            dirname: dirname.to_string(),
            key_size,
            node_size,
            last_id: 0,
            trees: Vec::new(),
            stored_nodes: BTreeSet::new(),
        };

        let Some(data) = forest.fs.cat(&forest.metadata_key())? else {
            return Ok(forest);
        };
        let meta: ForestMeta = rmp_serde::from_slice(&data)?;
        if meta.key_size != key_size {
            return Err(BurrowError::KeySize {
                expected: key_size,
                actual: meta.key_size,
            });
        }

        for record in meta.trees {
            let leaves: Vec<Leaf> = record
                .leaves
                .into_iter()
                .map(|leaf| {
                    forest.stored_nodes.insert(leaf.node);
                    Leaf::stored(leaf.node, leaf.first_key, leaf.bytes)
                })
                .collect();
            forest.trees.push((
                TreeId(record.id),
                Tree::from_leaves(key_size, node_size, leaves, Some(Arc::clone(&forest.store))),
            ));
        }
        forest.last_id = meta.last_id;
        debug!(
            dir = %forest.dirname,
            trees = forest.trees.len(),
            nodes = forest.stored_nodes.len(),
            "forest opened"
        );
        Ok(forest)
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// The node cache shared by this forest's trees.
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    fn metadata_key(&self) -> String {
        format!("{}/metadata", self.dirname)
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Trees in creation order; the newest is last.
    pub fn trees(&self) -> impl Iterator<Item = (TreeId, &Tree)> + '_ {
        self.trees.iter().map(|(id, tree)| (*id, tree))
    }

    pub fn tree_ids(&self) -> Vec<TreeId> {
        self.trees.iter().map(|(id, _)| *id).collect()
    }

    pub fn last_tree_id(&self) -> Option<TreeId> {
        self.trees.last().map(|(id, _)| *id)
    }

    pub fn tree(&self, id: TreeId) -> Option<&Tree> {
        self.trees.iter().find(|(t, _)| *t == id).map(|(_, tree)| tree)
    }

    pub fn tree_mut(&mut self, id: TreeId) -> Option<&mut Tree> {
        self.trees
            .iter_mut()
            .find(|(t, _)| *t == id)
            .map(|(_, tree)| tree)
    }

    /// Add a tree, either empty or as a copy-on-write clone of `base`.
    pub fn new_tree(&mut self, base: Option<TreeId>) -> Result<TreeId> {
        let tree = match base {
            Some(base_id) => self
                .tree(base_id)
                .cloned()
                .ok_or_else(|| BurrowError::Other(format!("no tree {} to clone", base_id.0)))?,
            None => Tree::from_leaves(
                self.key_size,
                self.node_size,
                Vec::new(),
                Some(Arc::clone(&self.store)),
            ),
        };
        let id = TreeId(self.next_id());
        self.trees.push((id, tree));
        Ok(id)
    }

    pub fn remove_tree(&mut self, id: TreeId) -> bool {
        let before = self.trees.len();
        self.trees.retain(|(t, _)| *t != id);
        self.trees.len() != before
    }

    /// Persist every tree.
    ///
    /// Dirty leaves become new node files first; the metadata overwrite that
    /// follows is the single step that makes the new state visible. Node
    /// files no longer referenced are removed afterwards.
    pub fn commit(&mut self) -> Result<()> {
        let mut written: HashMap<*const Node, u64> = HashMap::new();
        let mut last_id = self.last_id;
        for (_, tree) in self.trees.iter_mut() {
            for leaf in tree.leaves_mut() {
                if leaf.node_id.is_some() {
                    continue;
                }
                let entries = leaf
                    .loaded()
                    .ok_or_else(|| BurrowError::Corrupt("dirty leaf without entries".into()))?;
                let ptr = Arc::as_ptr(entries);
                if let Some(&node_id) = written.get(&ptr) {
                    leaf.node_id = Some(node_id);
                    continue;
                }
                last_id += 1;
                self.store.write(last_id, entries)?;
                leaf.node_id = Some(last_id);
                written.insert(ptr, last_id);
            }
        }
        self.last_id = last_id;

        let meta = ForestMeta {
            key_size: self.key_size,
            node_size: self.node_size,
            last_id: self.last_id,
            trees: self
                .trees
                .iter()
                .map(|(id, tree)| TreeRecord {
                    id: id.0,
                    leaves: tree
                        .leaves()
                        .iter()
                        .filter_map(|l| {
                            l.node_id.map(|node| LeafRecord {
                                node,
                                first_key: l.first_key().to_vec(),
                                bytes: l.bytes(),
                            })
                        })
                        .collect(),
                })
                .collect(),
        };
        self.fs
            .overwrite(&self.metadata_key(), &rmp_serde::to_vec(&meta)?)?;

        let live: BTreeSet<u64> = meta
            .trees
            .iter()
            .flat_map(|t| t.leaves.iter().map(|l| l.node))
            .collect();
        let stale: Vec<u64> = self.stored_nodes.difference(&live).copied().collect();
        for node_id in &stale {
            self.store.remove(*node_id)?;
        }
        debug!(
            dir = %self.dirname,
            trees = self.trees.len(),
            written = written.len(),
            removed = stale.len(),
            "forest committed"
        );
        self.stored_nodes = live;
        Ok(())
    }
}
