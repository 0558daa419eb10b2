use burrow_storage::StorageBackend;
use burrow_types::error::{BurrowError, Result};
use tracing::info;

/// On-disk format implemented by this crate.
pub const FORMAT_VERSION: u32 = 6;

/// Plain-text format marker. Never passed through the filter.
pub const FORMAT_KEY: &str = "metadata/format";

pub fn read_format(storage: &dyn StorageBackend) -> Result<Option<String>> {
    Ok(storage
        .get(FORMAT_KEY)?
        .map(|data| String::from_utf8_lossy(&data).trim().to_string()))
}

/// A missing marker means an empty repository; any other version is fatal.
pub fn check_format(storage: &dyn StorageBackend) -> Result<()> {
    match read_format(storage)? {
        None => Ok(()),
        Some(found) if found.parse::<u32>() == Ok(FORMAT_VERSION) => Ok(()),
        Some(found) => Err(BurrowError::BadFormat {
            found,
            expected: FORMAT_VERSION,
        }),
    }
}

/// Write the marker if the repository does not have one yet.
pub fn ensure_format(storage: &dyn StorageBackend) -> Result<()> {
    if storage.exists(FORMAT_KEY)? {
        return check_format(storage);
    }
    info!(version = FORMAT_VERSION, "writing repository format marker");
    storage.put(FORMAT_KEY, format!("{FORMAT_VERSION}\n").as_bytes())
}
