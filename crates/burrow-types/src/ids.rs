use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Largest value a numeric identifier may take.
pub const MAX_ID: u64 = u64::MAX;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// Draw an identifier uniformly from the whole id space.
            pub fn random() -> Self {
                $name(rand::random::<u64>())
            }

            pub fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
                $name(u64::from_be_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map($name)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a stored chunk; also names its file in the chunk store.
    ChunkId
);
numeric_id!(
    /// Stable identifier of a client. Used as the client's directory name.
    ClientId
);
numeric_id!(
    /// Identifier of a generation, unique within one client.
    GenerationId
);
numeric_id!(
    /// Identifier of a file within a client's generation lineage.
    FileId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_decimal() {
        assert_eq!(ClientId(1234).to_string(), "1234");
        assert_eq!(format!("{:?}", ChunkId(7)), "ChunkId(7)");
    }

    #[test]
    fn parse_from_display() {
        let id = GenerationId(u64::MAX);
        let parsed: GenerationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("latest".parse::<GenerationId>().is_err());
    }

    #[test]
    fn big_endian_bytes_sort_like_numbers() {
        let small = FileId(255).to_be_bytes();
        let large = FileId(256).to_be_bytes();
        assert!(small < large);
        assert_eq!(FileId::from_be_bytes(large), FileId(256));
    }
}
