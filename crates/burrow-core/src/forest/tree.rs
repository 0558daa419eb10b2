use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, OnceLock};

use burrow_types::error::{BurrowError, Result};

use super::store::NodeStore;

/// Contents of one leaf node.
pub type Node = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered key/value operations over fixed-size byte keys.
///
/// Range bounds are inclusive at both ends, which matches how composite
/// keys are built: a fixed prefix followed by all-zero / all-one suffixes.
/// Reads can fail because stored leaves are fetched on first use.
pub trait OrderedMap {
    fn key_size(&self) -> usize;

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn lookup_range(&self, first: &[u8], last: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove one key. Returns whether it was present.
    fn remove(&mut self, key: &[u8]) -> Result<bool>;

    fn remove_range(&mut self, first: &[u8], last: &[u8]) -> Result<usize> {
        let mut removed = 0;
        for (k, _) in self.lookup_range(first, last)? {
            if self.remove(&k)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn count_range(&self, first: &[u8], last: &[u8]) -> Result<usize> {
        Ok(self.lookup_range(first, last)?.len())
    }

    fn range_is_empty(&self, first: &[u8], last: &[u8]) -> Result<bool> {
        Ok(self.count_range(first, last)? == 0)
    }
}

/// A leaf of a tree. `node_id` is set while the leaf matches a node file on
/// disk and cleared as soon as it is modified. A stored leaf knows its first
/// key and size without its entries, which are read on first use.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub(crate) node_id: Option<u64>,
    first_key: Vec<u8>,
    bytes: usize,
    entries: OnceLock<Arc<Node>>,
}

fn node_bytes(node: &Node) -> usize {
    node.iter().map(|(k, v)| k.len() + v.len()).sum()
}

impl Leaf {
    pub(crate) fn stored(node_id: u64, first_key: Vec<u8>, bytes: usize) -> Self {
        Self {
            node_id: Some(node_id),
            first_key,
            bytes,
            entries: OnceLock::new(),
        }
    }

    fn dirty(entries: Node) -> Self {
        let bytes = node_bytes(&entries);
        let first_key = entries.keys().next().cloned().unwrap_or_default();
        Self {
            node_id: None,
            first_key,
            bytes,
            entries: OnceLock::from(Arc::new(entries)),
        }
    }

    pub(crate) fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Entries, if they are in memory.
    pub(crate) fn loaded(&self) -> Option<&Arc<Node>> {
        self.entries.get()
    }
}

/// An ordered map split into leaves of bounded size.
///
/// Cloning a tree is cheap: leaves are shared until one side writes to them.
#[derive(Debug, Clone)]
pub struct Tree {
    key_size: usize,
    node_size: usize,
    leaves: Vec<Leaf>,
    store: Option<Arc<NodeStore>>,
}

impl Tree {
    pub fn new(key_size: usize, node_size: usize) -> Self {
        Self {
            key_size,
            node_size,
            leaves: Vec::new(),
            store: None,
        }
    }

    pub(crate) fn from_leaves(
        key_size: usize,
        node_size: usize,
        leaves: Vec<Leaf>,
        store: Option<Arc<NodeStore>>,
    ) -> Self {
        Self {
            key_size,
            node_size,
            leaves,
            store,
        }
    }

    pub(crate) fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    pub(crate) fn leaves_mut(&mut self) -> &mut [Leaf] {
        &mut self.leaves
    }

    /// Number of entries. Reads every leaf.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for idx in 0..self.leaves.len() {
            total += self.entries(idx)?.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Number of leaves not yet written to storage.
    pub fn dirty_leaves(&self) -> usize {
        self.leaves.iter().filter(|l| l.node_id.is_none()).count()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Number of leaves whose entries are in memory.
    pub fn loaded_leaves(&self) -> usize {
        self.leaves.iter().filter(|l| l.loaded().is_some()).count()
    }

    /// Index of the leaf whose key span covers `key`.
    fn leaf_index(&self, key: &[u8]) -> usize {
        self.leaves
            .partition_point(|l| l.first_key() <= key)
            .saturating_sub(1)
    }

    fn entries(&self, idx: usize) -> Result<&Arc<Node>> {
        let leaf = &self.leaves[idx];
        if let Some(entries) = leaf.entries.get() {
            return Ok(entries);
        }
        let (Some(node_id), Some(store)) = (leaf.node_id, self.store.as_ref()) else {
            return Err(BurrowError::Corrupt("leaf has neither entries nor a node".into()));
        };
        let node = store.load(node_id)?;
        Ok(leaf.entries.get_or_init(|| node))
    }

    /// Writable entries of a leaf; the leaf stops matching its node file.
    fn entries_mut(&mut self, idx: usize) -> Result<&mut Node> {
        self.entries(idx)?;
        let leaf = &mut self.leaves[idx];
        leaf.node_id = None;
        let entries = leaf
            .entries
            .get_mut()
            .ok_or_else(|| BurrowError::Corrupt("leaf entries vanished".into()))?;
        Ok(Arc::make_mut(entries))
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(BurrowError::KeySize {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn split(&mut self, idx: usize) -> Result<()> {
        let entries = self.entries_mut(idx)?;
        let Some(mid_key) = entries.keys().nth(entries.len() / 2).cloned() else {
            return Ok(());
        };
        let upper = entries.split_off(&mid_key);
        let lower_bytes = node_bytes(entries);
        self.leaves[idx].bytes = lower_bytes;
        self.leaves.insert(idx + 1, Leaf::dirty(upper));
        Ok(())
    }
}

impl OrderedMap for Tree {
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.leaves.is_empty() {
            return Ok(None);
        }
        Ok(self.entries(self.leaf_index(key))?.get(key).cloned())
    }

    fn lookup_range(&self, first: &[u8], last: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        if self.leaves.is_empty() || first > last {
            return Ok(out);
        }
        for idx in self.leaf_index(first)..self.leaves.len() {
            if self.leaves[idx].first_key() > last {
                break;
            }
            let range = self
                .entries(idx)?
                .range::<[u8], _>((Bound::Included(first), Bound::Included(last)));
            out.extend(range.map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(out)
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if self.leaves.is_empty() {
            let mut node = Node::new();
            node.insert(key.to_vec(), value.to_vec());
            self.leaves.push(Leaf::dirty(node));
            return Ok(());
        }

        let idx = self.leaf_index(key);
        if self.entries(idx)?.get(key).map(Vec::as_slice) == Some(value) {
            return Ok(());
        }
        let entries = self.entries_mut(idx)?;
        let old = entries.insert(key.to_vec(), value.to_vec());
        let count = entries.len();

        let leaf = &mut self.leaves[idx];
        leaf.bytes += key.len() + value.len();
        if let Some(old) = old {
            leaf.bytes -= key.len() + old.len();
        }
        if key < leaf.first_key.as_slice() {
            leaf.first_key = key.to_vec();
        }
        if leaf.bytes > self.node_size && count > 1 {
            self.split(idx)?;
        }
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        if self.leaves.is_empty() {
            return Ok(false);
        }
        let idx = self.leaf_index(key);
        if !self.entries(idx)?.contains_key(key) {
            return Ok(false);
        }
        let entries = self.entries_mut(idx)?;
        let old = entries.remove(key);
        let first = entries.keys().next().cloned();

        let leaf = &mut self.leaves[idx];
        if let Some(old) = old {
            leaf.bytes -= key.len() + old.len();
        }
        match first {
            Some(first) => leaf.first_key = first,
            None => {
                self.leaves.remove(idx);
            }
        }
        Ok(true)
    }
}
