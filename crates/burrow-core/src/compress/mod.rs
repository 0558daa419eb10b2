use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::config::{CompressionAlgorithm, CompressionConfig};
use burrow_types::error::{BurrowError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Upper bound on decompressed output. Forest nodes and chunks are far
/// smaller; anything larger is treated as corrupt input.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn from_config(config: &CompressionConfig) -> Self {
        match config.algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd {
                level: config.zstd_level,
            },
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let (tag, body) = match compression {
        Compression::None => (TAG_NONE, data.to_vec()),
        Compression::Lz4 => (TAG_LZ4, lz4_flex::compress_prepend_size(data)),
        Compression::Zstd { level } => {
            let body = zstd::bulk::compress(data, level)
                .map_err(|e| BurrowError::Other(format!("zstd compress: {e}")))?;
            (TAG_ZSTD, body)
        }
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(BurrowError::Decompression("empty data".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            let Some(size_prefix) = payload.get(..4) else {
                return Err(BurrowError::Decompression("lz4: payload too short".into()));
            };
            let mut size = [0u8; 4];
            size.copy_from_slice(size_prefix);
            let uncompressed_size = u64::from(u32::from_le_bytes(size));
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(BurrowError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| BurrowError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| BurrowError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| BurrowError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(BurrowError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(BurrowError::UnknownCompressionTag(tag)),
    }
}
