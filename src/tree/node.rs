//! Tree node encoding
//!
//! ```text
//! ┌───────────────┬──────────┬───────────┐
//! │ value_index+1 │ left + 1 │ right + 1 │   each a negotiated-width field
//! └───────────────┴──────────┴───────────┘
//! ```
//! Indices are stored shifted by one so "none" (-1) encodes as zero and a
//! small tree stays at one byte per field.

use bytes::BytesMut;

use crate::codec::{get_var, put_var, IoValue, NumberSize, ValueStorage};
use crate::error::{IoCollError, Result};

/// Sentinel for "no index"
pub const NONE: i64 = -1;

/// One node of the tree: indices into the value and node arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    pub value_index: i64,
    pub left: i64,
    pub right: i64,
}

impl TreeNode {
    /// Tombstone of a recycled node slot
    pub const EMPTY: TreeNode = TreeNode {
        value_index: NONE,
        left: NONE,
        right: NONE,
    };

    pub fn leaf(value_index: u64) -> Self {
        Self {
            value_index: value_index as i64,
            left: NONE,
            right: NONE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value_index == NONE
    }

    pub fn left(&self) -> Option<u64> {
        index(self.left)
    }

    pub fn right(&self) -> Option<u64> {
        index(self.right)
    }

    pub fn value(&self) -> Option<u64> {
        index(self.value_index)
    }

    fn fields(&self) -> [i64; 3] {
        [self.value_index, self.left, self.right]
    }

    fn from_fields(fields: [u64; 3]) -> Result<Self> {
        let mut out = [NONE; 3];
        for (slot, raw) in out.iter_mut().zip(fields) {
            *slot = i64::try_from(raw)
                .map(|v| v - 1)
                .map_err(|_| IoCollError::Corruption(format!("tree node index {} out of range", raw)))?;
        }
        Ok(Self {
            value_index: out[0],
            left: out[1],
            right: out[2],
        })
    }
}

fn index(raw: i64) -> Option<u64> {
    u64::try_from(raw).ok()
}

fn shifted(raw: i64) -> u64 {
    (raw + 1) as u64
}

impl IoValue for TreeNode {
    fn storage() -> ValueStorage {
        ValueStorage::Varying { fields: 3, fixed: 0 }
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        for field in self.fields() {
            put_var(out, shifted(field));
        }
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        Self::from_fields([get_var(input)?, get_var(input)?, get_var(input)?])
    }

    fn required_widths(&self, widths: &mut [NumberSize]) {
        for (width, field) in widths.iter_mut().zip(self.fields()) {
            *width = (*width).max(NumberSize::fitting(shifted(field)));
        }
    }

    fn encode_element(&self, widths: &[NumberSize], out: &mut BytesMut) -> Result<()> {
        for (width, field) in widths.iter().zip(self.fields()) {
            width.write(shifted(field), out)?;
        }
        Ok(())
    }

    fn decode_element(widths: &[NumberSize], input: &mut &[u8]) -> Result<Self> {
        Self::from_fields([
            widths[0].read(input)?,
            widths[1].read(input)?,
            widths[2].read(input)?,
        ])
    }
}
