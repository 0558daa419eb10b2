/// Maps numeric ids to bucketed file names below a directory.
///
/// Each of the `depth` directory levels takes `bits` bits of the id,
/// starting `skip` bits from the least significant end. Consecutive ids
/// thus land in the same bucket until the skipped bits roll over.
#[derive(Debug, Clone)]
pub struct IdPath {
    dirname: String,
    depth: u32,
    bits: u32,
    skip: u32,
}

impl IdPath {
    pub fn new(dirname: &str, depth: u32, bits: u32, skip: u32) -> Self {
        Self {
            dirname: dirname.trim_end_matches('/').to_string(),
            depth,
            bits,
            skip,
        }
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    fn digits(&self) -> usize {
        self.bits.div_ceil(4) as usize
    }

    pub fn convert(&self, id: u64) -> String {
        let mask = if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        };
        let mut path = self.dirname.clone();
        for level in 0..self.depth {
            let shift = self.skip + level * self.bits;
            let part = id.checked_shr(shift).unwrap_or(0) & mask;
            path.push_str(&format!("/{part:0width$x}", width = self.digits()));
        }
        path.push_str(&format!("/{id:x}"));
        path
    }

    /// Recover the id from a file name produced by [`IdPath::convert`].
    pub fn parse(&self, key: &str) -> Option<u64> {
        let basename = key.rsplit('/').next()?;
        let id = u64::from_str_radix(basename, 16).ok()?;
        (self.convert(id) == key).then_some(id)
    }
}
