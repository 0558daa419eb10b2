use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use burrow_types::error::{BurrowError, Result};
use tracing::debug;

use crate::StorageBackend;

/// Storage backend for a local directory using `std::fs` directly.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize existing roots so strip_prefix works through symlinks.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject storage keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        let problem = if key.is_empty() {
            Some("empty key")
        } else if key.starts_with('/') || key.starts_with('\\') {
            Some("absolute path")
        } else if key.contains('\\') {
            Some("backslash")
        } else if Path::new(key).components().any(|c| c == Component::ParentDir) {
            Some("parent traversal")
        } else {
            None
        };
        match problem {
            Some(problem) => Err(BurrowError::InvalidKey(format!("{problem} in '{key}'"))),
            None => Ok(()),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Stage `data` in a temp file next to `path`. Readers never observe a
    /// partially written object once it is persisted.
    fn stage(&self, path: &Path, data: &[u8]) -> Result<tempfile::NamedTempFile> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = match tempfile::NamedTempFile::new_in(dir) {
            Ok(tmp) => tmp,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                tempfile::NamedTempFile::new_in(dir)?
            }
            Err(e) => return Err(e.into()),
        };
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }

    fn any_file_except(&self, dir: &Path, except: &Path) -> Result<bool> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if self.any_file_except(&entry.path(), except)? {
                    return Ok(true);
                }
            } else if file_type.is_file() && entry.path() != except {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `NotFound` becomes `None`; other I/O errors propagate.
fn absent_ok<T>(result: std::io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        absent_ok(fs::read(self.resolve(key)?))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let tmp = self.stage(&path, data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn put_new(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let tmp = self.stage(&path, data)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(key, "refusing to overwrite existing object");
                Err(BurrowError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        absent_ok(fs::remove_file(self.resolve(key)?))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let meta = absent_ok(fs::metadata(self.resolve(key)?))?;
        Ok(meta.is_some_and(|m| m.is_file()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        let mut keys = Vec::new();
        if absent_ok(fs::metadata(&dir))?.is_some_and(|m| m.is_dir()) {
            self.list_recursive(&dir, &mut keys)?;
        }
        Ok(keys)
    }

    fn has_keys_besides(&self, prefix: &str, except: &str) -> Result<bool> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        if !absent_ok(fs::metadata(&dir))?.is_some_and(|m| m.is_dir()) {
            return Ok(false);
        }
        self.any_file_except(&dir, &self.resolve(except)?)
    }

    fn create_dir(&self, key: &str) -> Result<()> {
        let path = self.resolve(key.trim_end_matches('/'))?;
        fs::create_dir_all(&path)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }

    fn delete_dir(&self, prefix: &str) -> Result<()> {
        let path = self.resolve(prefix.trim_end_matches('/'))?;
        absent_ok(fs::remove_dir_all(path))?;
        debug!(prefix, "directory removed");
        Ok(())
    }
}
