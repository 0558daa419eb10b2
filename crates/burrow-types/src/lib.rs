pub mod checksum;
pub mod error;
pub mod ids;

pub use checksum::Checksum;
pub use ids::{ChunkId, ClientId, FileId, GenerationId, MAX_ID};
