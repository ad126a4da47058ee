//! Trie node encoding
//!
//! Nodes are variable-size, so the node array stores each one by reference:
//! ```text
//! ┌──────────────┬──────────┬──────────────┬──────────────┬─────┐
//! │ Fragment     │ Terminal │ Child count  │ Child index  │ ... │
//! │ (len + utf8) │ (1)      │ (tagged int) │ (tagged int) │     │
//! └──────────────┴──────────┴──────────────┴──────────────┴─────┘
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{ensure_remaining, get_var, put_var, IoValue, ValueStorage};
use crate::error::{IoCollError, Result};

/// One radix-tree node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrieNode {
    pub fragment: String,
    pub children: Vec<u64>,
    pub terminal: bool,
}

impl TrieNode {
    pub fn leaf(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            children: Vec::new(),
            terminal: true,
        }
    }

    pub fn first_char(&self) -> Option<char> {
        self.fragment.chars().next()
    }
}

impl IoValue for TrieNode {
    fn storage() -> ValueStorage {
        ValueStorage::Reference
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        put_var(out, self.fragment.len() as u64);
        out.put_slice(self.fragment.as_bytes());
        out.put_u8(self.terminal as u8);
        put_var(out, self.children.len() as u64);
        for child in &self.children {
            put_var(out, *child);
        }
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        let len = get_var(input)? as usize;
        ensure_remaining(input, len)?;
        let fragment = String::from_utf8(input[..len].to_vec())
            .map_err(|e| IoCollError::Corruption(format!("trie fragment is not utf-8: {}", e)))?;
        input.advance(len);

        ensure_remaining(input, 1)?;
        let terminal = input.get_u8() != 0;
        let count = get_var(input)? as usize;
        // Each child takes at least one byte
        ensure_remaining(input, count)?;
        let children = (0..count)
            .map(|_| get_var(input))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fragment,
            children,
            terminal,
        })
    }
}

/// Byte length of the longest common prefix, on char boundaries
pub fn common_prefix(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}
