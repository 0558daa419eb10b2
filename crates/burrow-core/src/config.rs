use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use burrow_types::error::{BurrowError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// How long to keep retrying a held lock before giving up.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
    /// Target size of a forest leaf node, in bytes.
    #[serde(default = "default_node_size")]
    pub node_size: usize,
    #[serde(default)]
    pub idpath: IdPathConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default = "default_max_bag_blobs")]
    pub max_bag_blobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdPathConfig {
    #[serde(default = "default_idpath_depth")]
    pub depth: u32,
    #[serde(default = "default_idpath_bits")]
    pub bits: u32,
    #[serde(default = "default_idpath_skip")]
    pub skip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn default_lock_retry_ms() -> u64 {
    1000
}

fn default_node_size() -> usize {
    256 * 1024
}

fn default_idpath_depth() -> u32 {
    3
}

fn default_idpath_bits() -> u32 {
    12
}

fn default_idpath_skip() -> u32 {
    13
}

fn default_zstd_level() -> i32 {
    3
}

fn default_max_bag_blobs() -> usize {
    1024
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_retry_ms: default_lock_retry_ms(),
            node_size: default_node_size(),
            idpath: IdPathConfig::default(),
            compression: CompressionConfig::default(),
            max_bag_blobs: default_max_bag_blobs(),
        }
    }
}

impl Default for IdPathConfig {
    fn default() -> Self {
        Self {
            depth: default_idpath_depth(),
            bits: default_idpath_bits(),
            skip: default_idpath_skip(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::default(),
            zstd_level: default_zstd_level(),
        }
    }
}

impl RepositoryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_size < 64 {
            return Err(BurrowError::Config(format!(
                "node_size must be at least 64 bytes, got {}",
                self.node_size
            )));
        }
        if self.idpath.bits == 0 || self.idpath.bits > 32 {
            return Err(BurrowError::Config(format!(
                "idpath.bits must be between 1 and 32, got {}",
                self.idpath.bits
            )));
        }
        let used = u64::from(self.idpath.skip)
            + u64::from(self.idpath.depth) * u64::from(self.idpath.bits);
        if used > 64 {
            return Err(BurrowError::Config(format!(
                "idpath uses {used} bits of a 64-bit id"
            )));
        }
        if self.max_bag_blobs == 0 {
            return Err(BurrowError::Config("max_bag_blobs must be positive".into()));
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(BurrowError::Config(format!(
                "compression.zstd_level must be between 1 and 22, got {}",
                self.compression.zstd_level
            )));
        }
        Ok(())
    }
}

/// Parse a YAML repository config.
pub fn parse_config(yaml: &str) -> Result<RepositoryConfig> {
    let config: RepositoryConfig =
        serde_yaml::from_str(yaml).map_err(|e| BurrowError::Config(format!("yaml: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Load a YAML repository config from disk.
pub fn load_config(path: &Path) -> Result<RepositoryConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        BurrowError::Config(format!("cannot read '{}': {e}", path.display()))
    })?;
    parse_config(&contents)
}
