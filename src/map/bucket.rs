//! Resident bucket chains
//!
//! A bucket is a single head pointer in the bucket array. The map reads the
//! whole chain behind it into a `ResidentBucket`, which is also what the hot
//! bucket cache keeps.

use crate::cell::Cell;
use crate::codec::IoValue;
use crate::error::{IoCollError, Result};
use crate::storage::{ChunkPtr, Storage};

/// Upper bound on a chain walk, so a pointer cycle fails instead of spinning
const MAX_CHAIN: usize = 1 << 20;

/// One cell of a bucket chain
#[derive(Debug, Clone)]
pub(crate) struct ResidentCell<K, V> {
    pub ptr: ChunkPtr,
    pub next: ChunkPtr,
    pub entry: Option<(K, V)>,
}

/// In-memory copy of a bucket chain
#[derive(Debug, Clone)]
pub(crate) struct ResidentBucket<K, V> {
    pub head: ChunkPtr,
    pub cells: Vec<ResidentCell<K, V>>,
}

impl<K: IoValue + PartialEq, V: IoValue> ResidentBucket<K, V> {
    /// Read the chain starting at `head`
    pub fn load(storage: &Storage, head: ChunkPtr) -> Result<Self> {
        let mut cells = Vec::new();
        let mut next = head;
        while let Some(ptr) = next.non_null() {
            if cells.len() >= MAX_CHAIN {
                return Err(IoCollError::Corruption(format!(
                    "bucket chain from {} exceeds {} cells",
                    head, MAX_CHAIN
                )));
            }
            let contents = Cell::<(K, V)>::open(storage, ptr).load()?;
            next = contents.next;
            cells.push(ResidentCell {
                ptr,
                next: contents.next,
                entry: contents.value,
            });
        }
        Ok(Self { head, cells })
    }

    /// Position of the cell holding `key`
    pub fn find(&self, key: &K) -> Option<usize> {
        self.cells.iter().position(|cell| match &cell.entry {
            Some((k, _)) => k == key,
            None => false,
        })
    }

    /// The last cell, if it is empty and can take a new entry
    pub fn empty_tail(&self) -> Option<&ResidentCell<K, V>> {
        self.cells.last().filter(|cell| cell.entry.is_none())
    }

    pub fn live(&self) -> impl Iterator<Item = &(K, V)> {
        self.cells.iter().filter_map(|cell| cell.entry.as_ref())
    }

    pub fn live_count(&self) -> u64 {
        self.live().count() as u64
    }
}

impl<K, V> ResidentBucket<K, V> {
    /// Same cells, links and occupancy as `other`; values are not compared
    pub fn same_chain(&self, other: &Self) -> bool {
        self.head == other.head
            && self.cells.len() == other.cells.len()
            && self.cells.iter().zip(&other.cells).all(|(a, b)| {
                a.ptr == b.ptr && a.next == b.next && a.entry.is_some() == b.entry.is_some()
            })
    }
}
