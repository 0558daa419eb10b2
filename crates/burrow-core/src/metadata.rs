use std::path::Path;

use serde::{Deserialize, Serialize};

use burrow_types::error::Result;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// What the repository records about a file, stored as the opaque metadata
/// blob of its file record. Every field is optional so that entries written
/// by a client that could not read some attribute still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub st_mode: Option<u32>,
    #[serde(default)]
    pub st_mtime_sec: Option<i64>,
    #[serde(default)]
    pub st_mtime_nsec: Option<i64>,
    #[serde(default)]
    pub st_atime_sec: Option<i64>,
    #[serde(default)]
    pub st_atime_nsec: Option<i64>,
    #[serde(default)]
    pub st_nlink: Option<u64>,
    #[serde(default)]
    pub st_size: Option<u64>,
    #[serde(default)]
    pub st_blocks: Option<u64>,
    #[serde(default)]
    pub st_dev: Option<u64>,
    #[serde(default)]
    pub st_ino: Option<u64>,
    #[serde(default)]
    pub st_uid: Option<u32>,
    #[serde(default)]
    pub st_gid: Option<u32>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub groupname: Option<String>,
    /// Symlink target.
    #[serde(default)]
    pub target: Option<String>,
    /// Extended attributes, already encoded by the caller.
    #[serde(default)]
    pub xattr: Option<Vec<u8>>,
    #[serde(default)]
    pub md5: Option<Vec<u8>>,
}

impl FileMetadata {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(blob)?)
    }

    fn file_type(&self) -> Option<u32> {
        self.st_mode.map(|mode| mode & S_IFMT)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(S_IFDIR)
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(S_IFLNK)
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == Some(S_IFREG)
    }

    /// Read a live file's metadata without following a final symlink.
    #[cfg(unix)]
    pub fn from_path(path: &Path) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;

        use crate::platform::{group_name, user_name};

        let meta = std::fs::symlink_metadata(path)?;
        let target = if meta.file_type().is_symlink() {
            Some(std::fs::read_link(path)?.to_string_lossy().into_owned())
        } else {
            None
        };
        Ok(Self {
            st_mode: Some(meta.mode()),
            st_mtime_sec: Some(meta.mtime()),
            st_mtime_nsec: Some(meta.mtime_nsec()),
            st_atime_sec: Some(meta.atime()),
            st_atime_nsec: Some(meta.atime_nsec()),
            st_nlink: Some(meta.nlink()),
            st_size: Some(meta.size()),
            st_blocks: Some(meta.blocks()),
            st_dev: Some(meta.dev()),
            st_ino: Some(meta.ino()),
            st_uid: Some(meta.uid()),
            st_gid: Some(meta.gid()),
            username: user_name(meta.uid()),
            groupname: group_name(meta.gid()),
            target,
            xattr: None,
            md5: None,
        })
    }

    #[cfg(not(unix))]
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        let mode = if meta.is_dir() {
            S_IFDIR | 0o755
        } else if meta.file_type().is_symlink() {
            S_IFLNK | 0o777
        } else {
            S_IFREG | 0o644
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok());
        Ok(Self {
            st_mode: Some(mode),
            st_mtime_sec: mtime.map(|d| d.as_secs() as i64),
            st_mtime_nsec: mtime.map(|d| i64::from(d.subsec_nanos())),
            st_size: Some(meta.len()),
            ..Self::default()
        })
    }
}
