//! Read/write hooks applied to every blob stored under a toplevel directory.

use burrow_storage::StorageBackend;
use burrow_types::error::Result;

use crate::compress::{self, Compression};
use crate::config::{CompressionAlgorithm, CompressionConfig};

/// Transformation applied to blobs on their way to and from storage.
///
/// Filters see the toplevel name so they can keep per-toplevel state (for
/// example a key written by [`RepositoryFilter::toplevel_init`]). Anything a
/// filter writes itself goes to raw storage and is never filtered again.
pub trait RepositoryFilter: Send + Sync {
    fn filter_read(&self, toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>>;

    fn filter_write(&self, toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Called once before the first blob is written to a fresh toplevel.
    fn toplevel_init(&self, _storage: &dyn StorageBackend, _toplevel: &str) -> Result<()> {
        Ok(())
    }
}

/// Stores blobs unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl RepositoryFilter for Passthrough {
    fn filter_read(&self, _toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    fn filter_write(&self, _toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}

/// Compresses every blob with a tagged codec.
#[derive(Debug, Clone, Copy)]
pub struct CompressionFilter {
    compression: Compression,
}

impl CompressionFilter {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }
}

impl RepositoryFilter for CompressionFilter {
    fn filter_read(&self, _toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        compress::decompress(&data)
    }

    fn filter_write(&self, _toplevel: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        compress::compress(self.compression, &data)
    }
}

/// Build the filter selected by the compression settings.
pub fn filter_from_config(config: &CompressionConfig) -> Box<dyn RepositoryFilter> {
    match config.algorithm {
        CompressionAlgorithm::None => Box::new(Passthrough),
        _ => Box::new(CompressionFilter::new(Compression::from_config(config))),
    }
}
