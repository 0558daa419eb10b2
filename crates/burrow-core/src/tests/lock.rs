use std::sync::Arc;
use std::time::Duration;

use burrow_storage::StorageBackend;
use burrow_types::error::{BurrowError, LockFailure};

use crate::repo::fs::RepositoryFs;
use crate::repo::lock::{lock_key, LockManager};
use crate::testutil::{test_fs, MemoryBackend};

fn manager(fs: &Arc<RepositoryFs>) -> LockManager {
    LockManager::new(Arc::clone(fs), Duration::ZERO, Duration::from_millis(1))
}

#[test]
fn root_lock_lives_at_top() {
    assert_eq!(lock_key("."), "lock");
    assert_eq!(lock_key(""), "lock");
    assert_eq!(lock_key("chunklist"), "chunklist/lock");
    assert_eq!(lock_key("1234/"), "1234/lock");
}

#[test]
fn acquire_and_release_lock() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut locks = manager(&fs);

    locks.lock(&["a", "b"]).unwrap();
    assert!(storage.exists("a/lock").unwrap());
    assert!(storage.exists("b/lock").unwrap());
    assert!(locks.got_lock("a"));
    assert!(locks.is_locked("b").unwrap());

    locks.unlock(&["b", "a"]).unwrap();
    assert!(!storage.exists("a/lock").unwrap());
    assert!(!locks.got_lock("a"));
}

#[test]
fn second_holder_times_out() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut first = manager(&fs);
    let mut second = manager(&fs);

    first.lock(&["a"]).unwrap();
    let err = second.lock(&["a"]).unwrap_err();
    assert!(matches!(
        err,
        BurrowError::LockFailed {
            reason: LockFailure::Timeout,
            ..
        }
    ));
    assert!(second.is_locked("a").unwrap());
    assert!(!second.got_lock("a"));

    first.unlock(&["a"]).unwrap();
    second.lock(&["a"]).unwrap();
}

#[test]
fn relocking_own_lock_is_rejected() {
    let storage = MemoryBackend::new();
    let mut locks = manager(&test_fs(&storage));
    locks.lock(&["a"]).unwrap();
    assert!(matches!(
        locks.lock(&["a"]),
        Err(BurrowError::AlreadyLocked(_))
    ));
}

#[test]
fn failed_lock_releases_partial_set() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut other = manager(&fs);
    let mut locks = manager(&fs);

    other.lock(&["b"]).unwrap();
    let err = locks.lock(&["c", "b", "a"]).unwrap_err();
    assert!(err.is_lock_error());

    // "a" sorts first and was taken before "b" failed; it must be gone.
    assert!(!storage.exists("a/lock").unwrap());
    assert!(!storage.exists("c/lock").unwrap());
    assert!(!locks.got_lock("a"));
    assert!(storage.exists("b/lock").unwrap());
}

#[test]
fn unlock_of_vanished_marker_fails() {
    let storage = MemoryBackend::new();
    let mut locks = manager(&test_fs(&storage));
    locks.lock(&["a"]).unwrap();
    storage.delete("a/lock").unwrap();

    assert!(matches!(
        locks.unlock(&["a"]),
        Err(BurrowError::LockMarkerMissing(_))
    ));
    assert!(!locks.got_lock("a"));
}

#[test]
fn force_breaks_foreign_lock() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut holder = manager(&fs);
    let mut admin = manager(&fs);

    holder.lock(&["a"]).unwrap();
    admin.force(&["a", "missing"]).unwrap();
    assert!(!storage.exists("a/lock").unwrap());
    admin.lock(&["a"]).unwrap();
}

#[test]
fn lock_marker_names_holder() {
    let storage = MemoryBackend::new();
    let mut locks = manager(&test_fs(&storage));
    assert!(locks.lock_holder("a").unwrap().is_none());
    locks.lock(&["a"]).unwrap();
    let entry = locks.lock_holder("a").unwrap().unwrap();
    assert_eq!(entry.pid, std::process::id());
    assert!(!entry.hostname.is_empty());
}

#[test]
fn verify_notices_forced_marker() {
    let storage = MemoryBackend::new();
    let fs = test_fs(&storage);
    let mut holder = manager(&fs);
    let mut admin = manager(&fs);

    holder.lock(&["a", "b"]).unwrap();
    holder.verify(&["b", "a"]).unwrap();
    assert!(matches!(
        holder.verify(&["c"]),
        Err(BurrowError::LockMarkerMissing(_))
    ));

    admin.force(&["b"]).unwrap();
    assert!(matches!(
        holder.verify(&["a", "b"]),
        Err(BurrowError::LockMarkerMissing(key)) if key == "b/lock"
    ));
    holder.verify(&["a"]).unwrap();
}
