use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use burrow_types::error::{BurrowError, LockFailure, Result};

use super::fs::{RepositoryFs, LOCK_FILE};

/// Content of a lock marker. Informational only: holding a lock means the
/// marker exists, whoever wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub hostname: String,
    pub pid: u32,
    pub time: String,
}

/// Storage key of the lock marker for a directory. `"."` is the
/// repository root.
pub fn lock_key(dirname: &str) -> String {
    let dirname = dirname.trim_end_matches('/');
    if dirname.is_empty() || dirname == "." {
        LOCK_FILE.to_string()
    } else {
        format!("{dirname}/{LOCK_FILE}")
    }
}

/// Canonical acquisition order: bytewise, duplicates dropped.
fn sorted(dirnames: &[&str]) -> Vec<String> {
    let set: BTreeSet<String> = dirnames.iter().map(|d| d.to_string()).collect();
    set.into_iter().collect()
}

/// Locks sets of directories at once, all or nothing.
pub struct LockManager {
    fs: Arc<RepositoryFs>,
    timeout: Duration,
    retry_interval: Duration,
    held: BTreeSet<String>,
}

impl LockManager {
    pub fn new(fs: Arc<RepositoryFs>, timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            fs,
            timeout,
            retry_interval,
            held: BTreeSet::new(),
        }
    }

    /// Lock every directory, in canonical order. If any of them fails, the
    /// ones locked so far by this call are released before returning.
    pub fn lock(&mut self, dirnames: &[&str]) -> Result<()> {
        let mut acquired: Vec<String> = Vec::new();
        for dirname in sorted(dirnames) {
            if let Err(err) = self.lock_one(&dirname) {
                for done in acquired.iter().rev() {
                    if let Err(e) = self.unlock_one(done) {
                        warn!(dir = %done, error = %e, "failed to release partial lock");
                    }
                }
                return Err(err);
            }
            acquired.push(dirname);
        }
        Ok(())
    }

    fn lock_one(&mut self, dirname: &str) -> Result<()> {
        if self.held.contains(dirname) {
            return Err(BurrowError::AlreadyLocked(dirname.to_string()));
        }
        let key = lock_key(dirname);
        let entry = LockEntry {
            hostname: crate::platform::hostname(),
            pid: std::process::id(),
            time: Utc::now().to_rfc3339(),
        };
        let data = serde_json::to_vec(&entry)
            .map_err(|e| BurrowError::Other(format!("lock serialize: {e}")))?;

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fs.storage().put_new(&key, &data) {
                Ok(()) => {
                    debug!(dir = dirname, attempt, "lock acquired");
                    self.held.insert(dirname.to_string());
                    return Ok(());
                }
                Err(BurrowError::AlreadyExists(_)) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.timeout {
                        return Err(BurrowError::LockFailed {
                            resource: dirname.to_string(),
                            reason: LockFailure::Timeout,
                        });
                    }
                    debug!(dir = dirname, attempt, "lock held elsewhere, retrying");
                    std::thread::sleep(self.retry_interval.min(self.timeout - elapsed));
                }
                Err(BurrowError::Io(e)) => {
                    return Err(BurrowError::LockFailed {
                        resource: dirname.to_string(),
                        reason: LockFailure::Conflict(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release locks this process holds. A missing marker means someone
    /// forced the lock behind our back and is reported as an error.
    pub fn unlock(&mut self, dirnames: &[&str]) -> Result<()> {
        let mut first_err = None;
        for dirname in sorted(dirnames) {
            if let Err(e) = self.unlock_one(&dirname) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn unlock_one(&mut self, dirname: &str) -> Result<()> {
        self.held.remove(dirname);
        let key = lock_key(dirname);
        if !self.fs.storage().exists(&key)? {
            return Err(BurrowError::LockMarkerMissing(key));
        }
        self.fs.storage().delete(&key)?;
        debug!(dir = dirname, "lock released");
        Ok(())
    }

    /// Remove lock markers no matter who holds them.
    pub fn force(&mut self, dirnames: &[&str]) -> Result<()> {
        for dirname in sorted(dirnames) {
            self.held.remove(&dirname);
            let key = lock_key(&dirname);
            if self.fs.storage().exists(&key)? {
                warn!(dir = %dirname, "forcing lock open");
                self.fs.storage().delete(&key)?;
            }
        }
        Ok(())
    }

    /// Check that the markers of held locks are still in place. A forced
    /// lock shows up here before a commit writes anything.
    pub fn verify(&self, dirnames: &[&str]) -> Result<()> {
        for dirname in sorted(dirnames) {
            let key = lock_key(&dirname);
            if !self.held.contains(&dirname) || !self.fs.storage().exists(&key)? {
                return Err(BurrowError::LockMarkerMissing(key));
            }
        }
        Ok(())
    }

    /// Whether anyone holds the lock. Racy by nature.
    pub fn is_locked(&self, dirname: &str) -> Result<bool> {
        self.fs.storage().exists(&lock_key(dirname))
    }

    /// Whether this manager holds the lock.
    pub fn got_lock(&self, dirname: &str) -> bool {
        self.held.contains(dirname)
    }

    /// Who wrote the current lock marker, if there is one.
    pub fn lock_holder(&self, dirname: &str) -> Result<Option<LockEntry>> {
        let Some(data) = self.fs.storage().get(&lock_key(dirname))? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&data).ok())
    }
}
