//! Candidate bucket sequence for a key
//!
//! ```text
//!   h0 = xxh3(key)            index0 = h0 & mask
//!   h1 = h2h(h0)              index1 = h1 & mask   (+1 if == index0)
//!   h2 = h2h(h1)              index2 = h2 & mask   (+1 if == index1)
//! ```

/// Re-hash a hash (splitmix64 finalizer)
pub(crate) fn h2h(hash: u64) -> u64 {
    let mut z = hash.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Iterator over a key's candidate bucket indices
#[derive(Debug, Clone)]
pub struct SmallHashes {
    hash: u64,
    mask: u64,
    remaining: usize,
    prev: Option<u64>,
}

impl SmallHashes {
    pub fn new(hash: u64, bucket_po2: u8, generations: usize) -> Self {
        Self {
            hash,
            mask: (1u64 << bucket_po2) - 1,
            remaining: generations.max(1),
            prev: None,
        }
    }

    /// Candidates with repeats removed, first occurrence kept
    pub fn distinct(self) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::with_capacity(self.remaining);
        for index in self {
            if !out.contains(&index) {
                out.push(index);
            }
        }
        out
    }
}

impl Iterator for SmallHashes {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        let mut index = self.hash & self.mask;
        if self.prev == Some(index) {
            index = (index + 1) & self.mask;
        }
        self.prev = Some(index);
        self.hash = h2h(self.hash);
        self.remaining -= 1;
        Some(index)
    }
}
