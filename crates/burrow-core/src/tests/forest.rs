use std::sync::Arc;

use burrow_storage::StorageBackend;
use burrow_types::error::BurrowError;

use crate::forest::{Forest, OrderedMap};
use crate::repo::repo_tree::{ForestState, RepositoryTree};
use crate::testutil::{test_fs, MemoryBackend};

fn k(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn node_count(storage: &MemoryBackend, dir: &str) -> usize {
    let prefix = format!("{dir}/nodes/");
    storage
        .keys()
        .iter()
        .filter(|key| key.starts_with(&prefix))
        .count()
}

#[test]
fn committed_trees_survive_reopen() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut forest = Forest::open(Arc::clone(&fs), "f", 4, 64).unwrap();
    let id = forest.new_tree(None).unwrap();
    let tree = forest.tree_mut(id).unwrap();
    for n in 0..20 {
        tree.insert(&k(n), b"value").unwrap();
    }
    assert!(tree.leaf_count() > 1);
    forest.commit().unwrap();

    let reopened = Forest::open(fs, "f", 4, 64).unwrap();
    assert_eq!(reopened.tree_ids(), vec![id]);
    let tree = reopened.tree(id).unwrap();
    assert_eq!(tree.len().unwrap(), 20);
    assert_eq!(tree.dirty_leaves(), 0);
    assert_eq!(tree.lookup(&k(7)).unwrap(), Some(b"value".to_vec()));
}

#[test]
fn clone_writes_only_touched_leaves() {
    let storage = MemoryBackend::new();
    let mut forest = Forest::open(test_fs(&storage), "f", 4, 64).unwrap();
    let first = forest.new_tree(None).unwrap();
    for n in 0..40 {
        forest.tree_mut(first).unwrap().insert(&k(n), b"value").unwrap();
    }
    forest.commit().unwrap();
    let before = node_count(&storage, "f");

    let second = forest.new_tree(Some(first)).unwrap();
    forest.tree_mut(second).unwrap().insert(&k(0), b"other").unwrap();
    forest.commit().unwrap();
    assert_eq!(node_count(&storage, "f"), before + 1);

    assert_eq!(forest.tree(first).unwrap().lookup(&k(0)).unwrap(), Some(b"value".to_vec()));
    assert_eq!(forest.tree(second).unwrap().lookup(&k(0)).unwrap(), Some(b"other".to_vec()));

    // Dropping the clone frees exactly the node only it used.
    assert!(forest.remove_tree(second));
    forest.commit().unwrap();
    assert_eq!(node_count(&storage, "f"), before);
}

#[test]
fn reopen_with_other_key_size_fails() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut forest = Forest::open(Arc::clone(&fs), "f", 4, 64).unwrap();
    let id = forest.new_tree(None).unwrap();
    forest.tree_mut(id).unwrap().insert(&k(1), b"x").unwrap();
    forest.commit().unwrap();

    let err = Forest::open(fs, "f", 8, 64).err().unwrap();
    assert!(matches!(
        err,
        BurrowError::KeySize {
            expected: 8,
            actual: 4
        }
    ));
}

#[test]
fn missing_node_is_reported_as_corrupt() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut forest = Forest::open(Arc::clone(&fs), "f", 4, 64).unwrap();
    let id = forest.new_tree(None).unwrap();
    forest.tree_mut(id).unwrap().insert(&k(1), b"x").unwrap();
    forest.commit().unwrap();

    for key in storage.keys() {
        if key.starts_with("f/nodes/") {
            storage.delete(&key).unwrap();
        }
    }
    // Opening reads only the root record; the gap shows on first lookup.
    let forest = Forest::open(fs, "f", 4, 64).unwrap();
    assert!(matches!(
        forest.tree(id).unwrap().lookup(&k(1)),
        Err(BurrowError::Corrupt(_))
    ));
}

#[test]
fn open_reads_only_what_a_lookup_needs() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut forest = Forest::open(Arc::clone(&fs), "f", 4, 64).unwrap();
    let mut ids = Vec::new();
    for generation in 0..5u32 {
        let id = forest.new_tree(forest.last_tree_id()).unwrap();
        for n in 0..40 {
            let tree = forest.tree_mut(id).unwrap();
            tree.insert(&k(generation * 100 + n), b"value").unwrap();
        }
        forest.commit().unwrap();
        ids.push(id);
    }
    assert!(node_count(&storage, "f") > 10);

    storage.reset_reads();
    let forest = Forest::open(fs, "f", 4, 64).unwrap();
    assert_eq!(storage.reads(), 1, "only the root record is read on open");

    let newest = forest.tree(ids[4]).unwrap();
    assert!(newest.leaf_count() > 1);
    assert_eq!(newest.lookup(&k(207)).unwrap(), Some(b"value".to_vec()));
    assert_eq!(storage.reads(), 2);
    assert_eq!(newest.loaded_leaves(), 1);

    // Leaves no generation has touched since are shared by node id, so
    // the oldest generation finds them already decoded.
    assert_eq!(newest.lookup(&k(7)).unwrap(), Some(b"value".to_vec()));
    assert_eq!(storage.reads(), 3);
    let oldest = forest.tree(ids[0]).unwrap();
    assert_eq!(oldest.lookup(&k(7)).unwrap(), Some(b"value".to_vec()));
    assert_eq!(storage.reads(), 3);
    assert_eq!(forest.store().cached(), 2);
}

#[test]
fn repository_tree_state_transitions() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut rt = RepositoryTree::new(Arc::clone(&fs), "t", 4, 64, true);
    assert!(matches!(rt.state(), ForestState::Closed));
    assert!(rt.view().unwrap().is_none());
    assert!(matches!(rt.state(), ForestState::ReadOnly(_)));

    rt.working_tree().unwrap().insert(&k(1), b"a").unwrap();
    assert!(matches!(
        rt.state(),
        ForestState::Open {
            current: Some(_),
            ..
        }
    ));
    rt.commit().unwrap();
    assert!(matches!(rt.state(), ForestState::ReadOnly(_)));

    rt.working_tree().unwrap().insert(&k(2), b"b").unwrap();
    rt.commit().unwrap();

    let mut again = RepositoryTree::new(fs, "t", 4, 64, true);
    again.init_forest().unwrap();
    assert_eq!(again.forest().unwrap().tree_ids().len(), 1);
    let tree = again.view().unwrap().unwrap();
    assert_eq!(tree.lookup(&k(1)).unwrap(), Some(b"a".to_vec()));
    assert_eq!(tree.lookup(&k(2)).unwrap(), Some(b"b".to_vec()));
}

#[test]
fn close_discards_uncommitted_changes() {
    let storage = MemoryBackend::new();
    let mut rt = RepositoryTree::new(test_fs(&storage), "t", 4, 64, false);
    rt.working_tree().unwrap().insert(&k(1), b"kept").unwrap();
    rt.commit().unwrap();

    rt.working_tree().unwrap().insert(&k(2), b"lost").unwrap();
    assert_eq!(rt.view().unwrap().unwrap().len().unwrap(), 2);
    rt.close();

    let tree = rt.view().unwrap().unwrap();
    assert_eq!(tree.len().unwrap(), 1);
    assert_eq!(tree.lookup(&k(2)).unwrap(), None);
}

#[test]
fn keeping_history_retains_every_tree() {
    let storage = MemoryBackend::new();
    let mut rt = RepositoryTree::new(test_fs(&storage), "t", 4, 64, false);
    for n in 0..3 {
        rt.working_tree().unwrap().insert(&k(n), b"v").unwrap();
        rt.commit().unwrap();
    }
    rt.close();
    rt.init_forest().unwrap();
    let forest = rt.forest().unwrap();
    let sizes: Vec<usize> = forest
        .trees()
        .map(|(_, tree)| tree.len().unwrap())
        .collect();
    assert_eq!(sizes, vec![1, 2, 3]);
}
