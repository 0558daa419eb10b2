use burrow_types::error::BurrowError;
use burrow_types::{ChunkId, GenerationId};

use crate::repo::client_tree::GenerationKey;
use crate::repo::Repository;
use crate::testutil::{open_repo, test_repo_with_client};

const CLIENT: &str = "laptop";

fn started() -> (crate::testutil::MemoryBackend, Repository, GenerationId) {
    let (storage, mut repo) = test_repo_with_client(CLIENT);
    repo.lock_client(CLIENT).unwrap();
    let generation = repo.start_generation(CLIENT).unwrap();
    (storage, repo, generation)
}

#[test]
fn mutations_need_the_client_lock() {
    let (_storage, mut repo) = test_repo_with_client(CLIENT);
    assert!(matches!(
        repo.start_generation(CLIENT),
        Err(BurrowError::NotLocked(_))
    ));
    assert!(matches!(
        repo.create(CLIENT, "/a", b"m"),
        Err(BurrowError::NotLocked(_))
    ));
}

#[test]
fn writes_need_an_open_generation() {
    let (_storage, mut repo) = test_repo_with_client(CLIENT);
    repo.lock_client(CLIENT).unwrap();
    assert!(matches!(
        repo.create(CLIENT, "/a", b"m"),
        Err(BurrowError::NoCurrentGeneration(_))
    ));
}

#[test]
fn only_one_generation_at_a_time() {
    let (_storage, mut repo, generation) = started();
    assert_eq!(repo.current_generation(CLIENT).unwrap(), Some(generation));
    assert!(matches!(
        repo.start_generation(CLIENT),
        Err(BurrowError::GenerationAlreadyStarted(_))
    ));
}

#[test]
fn metadata_round_trip() {
    let (_storage, mut repo, generation) = started();
    repo.create(CLIENT, "/etc/hostname", b"M1").unwrap();
    repo.commit_client(CLIENT).unwrap();

    assert_eq!(
        repo.get_metadata(CLIENT, generation, "/etc/hostname").unwrap(),
        b"M1"
    );
    assert!(repo.file_exists(CLIENT, generation, "/etc/hostname").unwrap());
    // The parent got an id and a directory entry, but no metadata.
    assert!(!repo.file_exists(CLIENT, generation, "/etc").unwrap());
    assert_eq!(
        repo.listdir(CLIENT, generation, "/etc").unwrap(),
        vec!["hostname".to_string()]
    );
}

#[test]
fn unknown_paths_are_not_found() {
    let (_storage, mut repo, generation) = started();
    let err = repo.get_metadata(CLIENT, generation, "/nope").unwrap_err();
    assert!(matches!(err, BurrowError::FileNotFound { .. }));
    assert!(repo.get_file_chunks(CLIENT, generation, "/nope").unwrap_err().is_not_found());
    assert!(matches!(
        repo.remove(CLIENT, "/nope"),
        Err(BurrowError::FileNotFound { .. })
    ));
    assert!(matches!(
        repo.set_file_chunks(CLIENT, "/nope", &[ChunkId(1)]),
        Err(BurrowError::FileNotFound { .. })
    ));
    assert!(repo.listdir(CLIENT, generation, "/nope").unwrap().is_empty());
}

#[test]
fn unknown_generation_is_not_found() {
    let (_storage, mut repo, _generation) = started();
    let err = repo
        .get_metadata(CLIENT, GenerationId(12345), "/")
        .unwrap_err();
    assert!(matches!(err, BurrowError::GenerationNotFound { .. }));
}

#[test]
fn new_generation_does_not_disturb_old_one() {
    let (_storage, mut repo, first) = started();
    repo.create(CLIENT, "/etc/hostname", b"M1").unwrap();
    repo.commit_client(CLIENT).unwrap();

    repo.lock_client(CLIENT).unwrap();
    let second = repo.start_generation(CLIENT).unwrap();
    assert_ne!(first, second);
    // The clone starts with the previous generation's files.
    assert_eq!(repo.get_metadata(CLIENT, second, "/etc/hostname").unwrap(), b"M1");

    repo.create(CLIENT, "/etc/hostname", b"M2").unwrap();
    repo.create(CLIENT, "/etc/motd", b"M3").unwrap();
    assert_eq!(repo.get_metadata(CLIENT, first, "/etc/hostname").unwrap(), b"M1");
    assert!(!repo.file_exists(CLIENT, first, "/etc/motd").unwrap());
    repo.commit_client(CLIENT).unwrap();

    assert_eq!(repo.list_generations(CLIENT).unwrap(), vec![first, second]);
    assert_eq!(repo.get_metadata(CLIENT, first, "/etc/hostname").unwrap(), b"M1");
    assert_eq!(repo.get_metadata(CLIENT, second, "/etc/hostname").unwrap(), b"M2");
}

#[test]
fn removing_a_directory_cascades() {
    let (_storage, mut repo, generation) = started();
    repo.create(CLIENT, "/", b"dir").unwrap();
    repo.create(CLIENT, "/home", b"dir").unwrap();
    repo.create(CLIENT, "/home/alice", b"dir").unwrap();
    repo.create(CLIENT, "/home/alice/notes.txt", b"file").unwrap();
    repo.create(CLIENT, "/home/bob.txt", b"file").unwrap();
    repo.create(CLIENT, "/srv", b"dir").unwrap();
    repo.set_file_chunks(CLIENT, "/home/alice/notes.txt", &[ChunkId(5)])
        .unwrap();

    let mut top = repo.listdir(CLIENT, generation, "/").unwrap();
    top.sort();
    assert_eq!(top, vec!["home".to_string(), "srv".to_string()]);

    repo.remove(CLIENT, "/home").unwrap();
    assert_eq!(repo.listdir(CLIENT, generation, "/").unwrap(), vec!["srv".to_string()]);
    assert!(repo.listdir(CLIENT, generation, "/home").unwrap().is_empty());
    assert!(repo.listdir(CLIENT, generation, "/home/alice").unwrap().is_empty());
    assert!(!repo.file_exists(CLIENT, generation, "/home/alice/notes.txt").unwrap());
    assert!(!repo.file_exists(CLIENT, generation, "/home/bob.txt").unwrap());
    assert!(!repo.chunk_in_use(CLIENT, generation, ChunkId(5)).unwrap());

    // A removed path can be created again.
    repo.create(CLIENT, "/home", b"dir2").unwrap();
    assert_eq!(repo.get_metadata(CLIENT, generation, "/home").unwrap(), b"dir2");
}

#[test]
fn chunk_lists_and_references() {
    let (_storage, mut repo, generation) = started();
    repo.create(CLIENT, "/a", b"f").unwrap();
    repo.create(CLIENT, "/b", b"f").unwrap();
    let ids: Vec<ChunkId> = (1..=20).map(ChunkId).collect();
    repo.set_file_chunks(CLIENT, "/a", &ids).unwrap();
    repo.set_file_chunks(CLIENT, "/b", &[ChunkId(3), ChunkId(99)]).unwrap();
    assert_eq!(repo.get_file_chunks(CLIENT, generation, "/a").unwrap(), ids);

    let refs = repo.get_generation_chunk_ids(CLIENT, generation).unwrap();
    assert_eq!(refs.len(), 21);

    // Same list again: the reference region does not change.
    repo.set_file_chunks(CLIENT, "/a", &ids).unwrap();
    assert_eq!(repo.get_generation_chunk_ids(CLIENT, generation).unwrap(), refs);

    // A shorter list drops references only /a held.
    repo.set_file_chunks(CLIENT, "/a", &[ChunkId(1), ChunkId(3)]).unwrap();
    assert!(repo.chunk_in_use(CLIENT, generation, ChunkId(1)).unwrap());
    assert!(!repo.chunk_in_use(CLIENT, generation, ChunkId(2)).unwrap());
    assert!(repo.chunk_in_use(CLIENT, generation, ChunkId(99)).unwrap());

    // /b still holds chunk 3 after /a lets go of it.
    repo.set_file_chunks(CLIENT, "/a", &[]).unwrap();
    assert!(repo.chunk_in_use(CLIENT, generation, ChunkId(3)).unwrap());
    assert!(repo.get_file_chunks(CLIENT, generation, "/a").unwrap().is_empty());
}

#[test]
fn append_extends_chunk_list() {
    let (_storage, mut repo, generation) = started();
    repo.create(CLIENT, "/big", b"f").unwrap();
    let first: Vec<ChunkId> = (0..10).map(ChunkId).collect();
    let second: Vec<ChunkId> = (10..25).map(ChunkId).collect();
    repo.append_file_chunks(CLIENT, "/big", &first).unwrap();
    repo.append_file_chunks(CLIENT, "/big", &second).unwrap();
    repo.commit_client(CLIENT).unwrap();

    let all: Vec<ChunkId> = (0..25).map(ChunkId).collect();
    assert_eq!(repo.get_file_chunks(CLIENT, generation, "/big").unwrap(), all);
    assert!(repo.chunk_in_use(CLIENT, generation, ChunkId(24)).unwrap());
}

#[test]
fn generation_times_and_checkpoints() {
    let (_storage, mut repo, generation) = started();
    let (start, end) = repo.get_generation_times(CLIENT, generation).unwrap();
    assert!(start.is_some());
    assert!(end.is_none());

    repo.set_is_checkpoint(CLIENT, true).unwrap();
    repo.set_generation_key(CLIENT, GenerationKey::FileCount, Some(3))
        .unwrap();
    repo.commit_client(CLIENT).unwrap();

    let (start, end) = repo.get_generation_times(CLIENT, generation).unwrap();
    assert!(end.unwrap() >= start.unwrap());
    assert!(repo.get_is_checkpoint(CLIENT, generation).unwrap());
    assert_eq!(
        repo.get_generation_key(CLIENT, generation, GenerationKey::FileCount)
            .unwrap(),
        Some(3)
    );

    // The next generation inherits files but not bookkeeping.
    repo.lock_client(CLIENT).unwrap();
    let next = repo.start_generation(CLIENT).unwrap();
    assert!(!repo.get_is_checkpoint(CLIENT, next).unwrap());
    assert_eq!(
        repo.get_generation_key(CLIENT, next, GenerationKey::FileCount)
            .unwrap(),
        None
    );
    assert_eq!(repo.get_generation_times(CLIENT, next).unwrap().1, None);
}

#[test]
fn generation_spec_resolution() {
    let (storage, mut repo) = test_repo_with_client(CLIENT);
    assert!(matches!(
        repo.interpret_generation_spec(CLIENT, "latest"),
        Err(BurrowError::ClientHasNoGenerations(_))
    ));

    let mut generations = Vec::new();
    for _ in 0..2 {
        repo.lock_client(CLIENT).unwrap();
        generations.push(repo.start_generation(CLIENT).unwrap());
        repo.commit_client(CLIENT).unwrap();
    }

    let mut reader = open_repo(&storage);
    assert_eq!(
        reader.interpret_generation_spec(CLIENT, "latest").unwrap(),
        generations[1]
    );
    assert_eq!(
        reader
            .interpret_generation_spec(CLIENT, &generations[0].to_string())
            .unwrap(),
        generations[0]
    );
    assert!(reader
        .interpret_generation_spec(CLIENT, "not-a-number")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn unlock_discards_the_open_generation() {
    let (_storage, mut repo, generation) = started();
    repo.create(CLIENT, "/a", b"m").unwrap();
    repo.unlock_client(CLIENT).unwrap();

    assert!(repo.list_generations(CLIENT).unwrap().is_empty());
    assert!(repo
        .get_metadata(CLIENT, generation, "/a")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn client_lock_is_exclusive_across_handles() {
    let (storage, mut repo) = test_repo_with_client(CLIENT);
    let mut other = open_repo(&storage);

    repo.lock_client(CLIENT).unwrap();
    assert!(other.client_is_locked(CLIENT).unwrap());
    let err = other.lock_client(CLIENT).unwrap_err();
    assert!(err.is_lock_error());
    assert!(err.to_string().contains("client 'laptop'"), "{err}");
    assert!(matches!(
        repo.lock_client(CLIENT),
        Err(BurrowError::AlreadyLocked(_))
    ));

    repo.commit_client(CLIENT).unwrap();
    other.lock_client(CLIENT).unwrap();
    assert!(other.got_client_lock(CLIENT).unwrap());
    assert!(!repo.got_client_lock(CLIENT).unwrap());
}

#[test]
fn removing_the_open_generation() {
    let (_storage, mut repo, first) = started();
    repo.commit_client(CLIENT).unwrap();
    repo.lock_client(CLIENT).unwrap();
    repo.lock_chunk_indexes().unwrap();
    let second = repo.start_generation(CLIENT).unwrap();
    repo.remove_generation(CLIENT, second).unwrap();
    assert_eq!(repo.current_generation(CLIENT).unwrap(), None);
    // A new one can be started in its place.
    let third = repo.start_generation(CLIENT).unwrap();
    repo.commit_client(CLIENT).unwrap();
    repo.commit_chunk_indexes().unwrap();
    assert_eq!(repo.list_generations(CLIENT).unwrap(), vec![first, third]);
}
