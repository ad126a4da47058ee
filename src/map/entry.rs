//! Modifiable entry handles
//!
//! A handle remembers the cell and bucket its entry was found in, plus the
//! map's dataset id at that moment. Writing through a current handle touches
//! only that cell; a handle that predates a reflow or removal re-resolves
//! through a full `put` instead.

use crate::cell::Cell;
use crate::codec::IoValue;
use crate::error::Result;
use crate::storage::ChunkPtr;

use super::HashIoMap;

/// Handle to one map entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRef<K, V> {
    key: K,
    value: V,
    cell: ChunkPtr,
    bucket: u64,
    dataset_id: u64,
}

impl<K, V> EntryRef<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    /// Bucket the entry lived in when the handle was resolved
    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    pub fn dataset_id(&self) -> u64 {
        self.dataset_id
    }
}

impl<K: IoValue + PartialEq, V: IoValue> HashIoMap<K, V> {
    /// Look up a key and return a handle for in-place updates
    pub fn entry(&mut self, key: &K) -> Result<Option<EntryRef<K, V>>> {
        self.finish_reflow()?;
        for index in self.candidates(key, self.po2) {
            let bucket = self.load_bucket(index)?;
            let Some(pos) = bucket.find(key) else {
                continue;
            };
            let cell = &bucket.cells[pos];
            if let Some((key, value)) = cell.entry.clone() {
                return Ok(Some(EntryRef {
                    key,
                    value,
                    cell: cell.ptr,
                    bucket: index,
                    dataset_id: self.dataset_id,
                }));
            }
        }
        Ok(None)
    }

    /// Whether writes through `entry` still hit the right cell
    pub fn is_current(&self, entry: &EntryRef<K, V>) -> bool {
        entry.dataset_id == self.dataset_id
    }

    /// Write a new value through a handle
    pub fn set_entry_value(&mut self, entry: &mut EntryRef<K, V>, value: V) -> Result<()> {
        if self.is_current(entry) {
            let pair = (entry.key.clone(), value);
            Cell::<(K, V)>::open(&self.storage, entry.cell).set_value(Some(&pair))?;
            self.cache.remove(&entry.bucket);
            entry.value = pair.1;
            return Ok(());
        }

        tracing::trace!(
            "map {} entry handle from dataset {} is stale (now {})",
            self.ptr,
            entry.dataset_id,
            self.dataset_id
        );
        self.put(entry.key.clone(), value)?;
        if let Some(fresh) = self.entry(&entry.key)? {
            *entry = fresh;
        }
        Ok(())
    }
}
