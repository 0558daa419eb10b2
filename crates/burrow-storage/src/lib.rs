pub mod local_backend;

pub use local_backend::LocalBackend;

use burrow_types::error::{BurrowError, Result};

/// Byte-oriented storage underneath a repository.
///
/// Keys are `/`-separated paths relative to the repository root. All
/// repository state (forest nodes, chunks, lock markers, the format marker)
/// is reached through this trait.
pub trait StorageBackend: Send + Sync {
    /// Read an object. Returns `None` if it does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, atomically replacing any previous content.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Create an object that must not exist yet.
    ///
    /// Fails with [`BurrowError::AlreadyExists`] if the key is taken. This is
    /// what lock markers and fresh chunk ids rely on.
    fn put_new(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// List all object keys below `prefix`, recursively.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether anything other than `except` exists below `prefix`.
    /// Backends that can stop at the first hit should override this.
    fn has_keys_besides(&self, prefix: &str, except: &str) -> Result<bool> {
        Ok(self.list(prefix)?.iter().any(|key| key != except))
    }

    /// Create a directory marker (no-op for flat object stores).
    fn create_dir(&self, key: &str) -> Result<()>;

    /// Move an object to a new key.
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let data = self.get(from)?.ok_or_else(|| {
            BurrowError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("rename source '{from}' does not exist"),
            ))
        })?;
        self.put(to, &data)?;
        self.delete(from)
    }

    /// Delete everything below `prefix`.
    fn delete_dir(&self, prefix: &str) -> Result<()> {
        for key in self.list(prefix)? {
            self.delete(&key)?;
        }
        Ok(())
    }
}

/// Open a storage backend for a local repository directory.
pub fn backend_from_path(path: &str) -> Result<Box<dyn StorageBackend>> {
    Ok(Box::new(LocalBackend::new(path)?))
}
