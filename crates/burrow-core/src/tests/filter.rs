use burrow_storage::StorageBackend;

use crate::config::CompressionAlgorithm;
use crate::repo::format::FORMAT_KEY;
use crate::repo::Repository;
use crate::testutil::{test_config, MemoryBackend, TaggingFilter};

const CLIENT: &str = "laptop";

fn open_tagged(storage: &MemoryBackend, filter: &TaggingFilter) -> Repository {
    Repository::open_with_filter(
        Box::new(storage.clone()),
        Box::new(filter.clone()),
        test_config(),
    )
    .unwrap()
}

fn chunk_keys(storage: &MemoryBackend) -> Vec<String> {
    storage
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("chunks/") && !k.ends_with("/lock"))
        .collect()
}

#[test]
fn toplevel_init_fires_once_per_fresh_toplevel() {
    let storage = MemoryBackend::new();
    let filter = TaggingFilter::new();
    let mut repo = open_tagged(&storage, &filter);

    repo.lock_client_list().unwrap();
    // Lock markers and the format marker do not count as writes.
    assert!(filter.inits().is_empty());
    let client_id = repo.add_client(CLIENT).unwrap();
    repo.commit_client_list().unwrap();
    assert_eq!(filter.inits(), vec!["clientlist".to_string()]);

    repo.lock_client(CLIENT).unwrap();
    repo.start_generation(CLIENT).unwrap();
    repo.create(CLIENT, "/a", b"meta").unwrap();
    repo.commit_client(CLIENT).unwrap();

    // A second commit to the same toplevel does not init again.
    repo.lock_client(CLIENT).unwrap();
    repo.start_generation(CLIENT).unwrap();
    repo.commit_client(CLIENT).unwrap();
    assert_eq!(
        filter.inits(),
        vec!["clientlist".to_string(), client_id.to_string()]
    );
}

#[test]
fn populated_toplevel_is_not_initialized_again() {
    let storage = MemoryBackend::new();
    let first = TaggingFilter::new();
    let mut repo = open_tagged(&storage, &first);
    repo.lock_client_list().unwrap();
    repo.add_client(CLIENT).unwrap();
    repo.commit_client_list().unwrap();

    let second = TaggingFilter::new();
    let mut other = open_tagged(&storage, &second);
    other.lock_client_list().unwrap();
    other.add_client("server").unwrap();
    other.commit_client_list().unwrap();
    assert!(second.inits().is_empty());
    assert_eq!(other.get_client_names().unwrap().len(), 2);
}

#[test]
fn writing_to_a_full_chunk_store_does_not_list_it() {
    let storage = MemoryBackend::new();
    let first = TaggingFilter::new();
    let mut repo = open_tagged(&storage, &first);
    for i in 0..50u32 {
        repo.put_chunk_only(&i.to_be_bytes()).unwrap();
    }
    assert_eq!(chunk_keys(&storage).len(), 50);

    let second = TaggingFilter::new();
    let mut other = open_tagged(&storage, &second);
    let lists = storage.lists();
    other.put_chunk_only(b"one more").unwrap();
    assert_eq!(storage.lists(), lists);
    assert!(second.inits().is_empty());
}

#[test]
fn markers_bypass_the_filter() {
    let storage = MemoryBackend::new();
    let filter = TaggingFilter::new();
    let mut repo = open_tagged(&storage, &filter);
    repo.lock_client_list().unwrap();
    repo.add_client(CLIENT).unwrap();

    assert_eq!(storage.get(FORMAT_KEY).unwrap().unwrap(), b"6\n");
    let marker = storage.get("lock").unwrap().unwrap();
    assert!(!marker.starts_with(TaggingFilter::TAG));
    repo.commit_client_list().unwrap();

    let stored = storage.get("clientlist/metadata").unwrap().unwrap();
    assert!(stored.starts_with(TaggingFilter::TAG));
}

#[test]
fn chunks_pass_through_the_filter() {
    let storage = MemoryBackend::new();
    let filter = TaggingFilter::new();
    let mut repo = open_tagged(&storage, &filter);
    let chunk_id = repo.put_chunk_only(b"payload").unwrap();

    let keys = chunk_keys(&storage);
    assert_eq!(keys.len(), 1);
    assert_eq!(
        storage.get(&keys[0]).unwrap().unwrap(),
        [TaggingFilter::TAG, &b"payload"[..]].concat()
    );
    assert_eq!(repo.get_chunk(chunk_id).unwrap(), b"payload");
    assert_eq!(filter.inits(), vec!["chunks".to_string()]);
}

#[test]
fn compressed_repository_round_trip() {
    for algorithm in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd] {
        let storage = MemoryBackend::new();
        let mut config = test_config();
        config.compression.algorithm = algorithm;

        let mut repo = Repository::open(Box::new(storage.clone()), config.clone()).unwrap();
        repo.lock_client_list().unwrap();
        repo.add_client(CLIENT).unwrap();
        repo.commit_client_list().unwrap();

        let content = vec![b'z'; 4096];
        repo.lock_chunk_indexes().unwrap();
        let chunk_id = repo.backup_chunk(CLIENT, &content).unwrap();
        repo.commit_chunk_indexes().unwrap();

        let keys = chunk_keys(&storage);
        let raw = storage.get(&keys[0]).unwrap().unwrap();
        assert!(raw.len() < content.len(), "{algorithm:?}");

        let mut reader = Repository::open(Box::new(storage.clone()), config).unwrap();
        assert_eq!(reader.get_client_names().unwrap(), vec![CLIENT.to_string()]);
        assert_eq!(reader.get_chunk(chunk_id).unwrap(), content);
        assert_eq!(reader.find_chunks_by_content(&content).unwrap(), vec![chunk_id]);
    }
}
