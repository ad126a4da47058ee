//! Reflow: doubling the bucket array
//!
//! ```text
//!   size == 2^po2
//!        │
//!        ├── size < reflow_rewire_limit ──► Rewire: read every chain, relink
//!        │                                  all cells, build the new array
//!        │                                  from the final heads, switch
//!        │                                  (one transaction)
//!        │
//!        └── otherwise ───────────────────► Stream:
//!              1. allocate the target array, record it in the header
//!              2. per window of `reflow_window` old buckets: group cells by
//!                 destination, relink them into the target, null the old
//!                 heads, add to the moved count (one transaction each)
//!              3. count check ─► header switch ─► old array freed
//!
//!   then: cache cleared, dataset_id + 1
//! ```
//! Cells are never copied, only relinked. Empty trailing cells are dropped.
//!
//! Between stream windows every entry is reachable from exactly one of the
//! two arrays, and both are named by the header. A reflow cut short by a
//! failure or a crash is finished by the next operation on the map (or by
//! `open`); windows already moved hold only null heads and are skipped.

use std::collections::BTreeMap;

use crate::array::ContiguousArray;
use crate::cell::Cell;
use crate::codec::IoValue;
use crate::error::{IoCollError, Result};
use crate::storage::ChunkPtr;

use super::bucket::ResidentBucket;
use super::HashIoMap;

/// How a reflow moved the cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflowPath {
    Rewire,
    Stream,
}

impl<K: IoValue + PartialEq, V: IoValue> HashIoMap<K, V> {
    /// Double the bucket array and move every entry into it
    pub(crate) fn reflow(&mut self) -> Result<()> {
        let old_po2 = self.po2;
        let new_po2 = old_po2 + 1;
        let path = if self.reflow_target.is_none() && self.size < self.config.reflow_rewire_limit
        {
            ReflowPath::Rewire
        } else {
            ReflowPath::Stream
        };
        tracing::debug!(
            "map {} reflow start: po2 {} -> {}, {} entries, {:?}",
            self.ptr,
            old_po2,
            new_po2,
            self.size,
            path
        );

        // Chains change from here on, whether or not the reflow completes
        self.cache.clear();
        self.dataset_id += 1;

        match path {
            ReflowPath::Rewire => self.mutate(|map| map.rewire(new_po2))?,
            ReflowPath::Stream => self.stream(new_po2)?,
        }

        self.cache.clear();
        self.dataset_id += 1;
        self.reflows += 1;
        self.last_reflow = Some(path);
        tracing::debug!(
            "map {} reflow done: {} buckets, dataset {}",
            self.ptr,
            self.bucket_count(),
            self.dataset_id
        );
        Ok(())
    }

    /// Complete a streaming reflow left unfinished by an earlier failure
    pub(crate) fn finish_reflow(&mut self) -> Result<()> {
        if self.reflow_target.is_none() {
            return Ok(());
        }
        tracing::debug!(
            "map {} resuming reflow: {} of {} entries already moved",
            self.ptr,
            self.reflow_moved,
            self.size
        );
        self.reflow()
    }

    /// Relink everything in memory, then write the new array in one go
    fn rewire(&mut self, new_po2: u8) -> Result<()> {
        let mut heads = vec![ChunkPtr::NULL; 1usize << new_po2];
        let mut moved = 0u64;

        for index in 0..self.bucket_count() {
            let bucket = ResidentBucket::<K, V>::load(&self.storage, self.buckets.get(index)?)?;
            for cell in bucket.cells {
                let Some((key, _)) = &cell.entry else {
                    self.storage.free(cell.ptr)?;
                    continue;
                };
                let dest = self.destination(key, new_po2, |i| Ok(heads[i as usize].is_null()))?;
                Cell::<(K, V)>::open(&self.storage, cell.ptr).set_next(heads[dest as usize])?;
                heads[dest as usize] = cell.ptr;
                moved += 1;
            }
        }

        self.check_moved(moved)?;
        let buckets = ContiguousArray::from_values(&self.storage, &self.config, heads)?;
        self.switch_buckets(buckets, new_po2)
    }

    /// Move `reflow_window` old buckets per transaction into a target array
    fn stream(&mut self, new_po2: u8) -> Result<()> {
        if self.reflow_target.is_none() {
            self.mutate(|map| {
                let target = Self::empty_buckets(&map.storage, &map.config, new_po2)?;
                map.reflow_target = Some(target);
                map.reflow_moved = 0;
                map.write_header()
            })?;
        }

        let window = self.config.reflow_window.max(1) as u64;
        let old_count = self.bucket_count();
        let mut start = 0u64;
        while start < old_count {
            let stop = (start + window).min(old_count);
            self.mutate(|map| map.move_window(start, stop, new_po2))?;
            start = stop;
        }

        self.mutate(|map| {
            map.check_moved(map.reflow_moved)?;
            let target = map.reflow_target.take().ok_or_else(|| map.lost_target())?;
            map.switch_buckets(target, new_po2)
        })
    }

    /// Relink the cells of old buckets `[start, stop)` into the target array
    fn move_window(&mut self, start: u64, stop: u64, new_po2: u8) -> Result<()> {
        let heads = self.buckets.get_many(start..stop)?;
        if heads.iter().all(|head| head.is_null()) {
            return Ok(());
        }
        let mut target = self.reflow_target.take().ok_or_else(|| self.lost_target())?;
        let result = self.relink_window(&mut target, start, &heads, new_po2);
        self.reflow_target = Some(target);
        let moved = result?;

        for (offset, head) in heads.iter().enumerate() {
            if !head.is_null() {
                self.buckets.set(start + offset as u64, ChunkPtr::NULL)?;
            }
        }
        self.reflow_moved += moved;
        self.write_moved(self.reflow_moved)
    }

    fn relink_window(
        &self,
        target: &mut ContiguousArray<ChunkPtr>,
        start: u64,
        heads: &[ChunkPtr],
        new_po2: u8,
    ) -> Result<u64> {
        // Group this window's cells by destination
        let mut groups: BTreeMap<u64, Vec<ChunkPtr>> = BTreeMap::new();
        for head in heads {
            let bucket = ResidentBucket::<K, V>::load(&self.storage, *head)?;
            for cell in bucket.cells {
                let Some((key, _)) = &cell.entry else {
                    self.storage.free(cell.ptr)?;
                    continue;
                };
                let dest = self.destination(key, new_po2, |i| {
                    Ok(!groups.contains_key(&i) && target.get(i)?.is_null())
                })?;
                groups.entry(dest).or_default().push(cell.ptr);
            }
        }

        let mut moved = 0u64;
        for (dest, cells) in groups {
            let mut head = target.get(dest)?;
            for ptr in cells {
                Cell::<(K, V)>::open(&self.storage, ptr).set_next(head)?;
                head = ptr;
                moved += 1;
            }
            target.set(dest, head)?;
        }
        tracing::trace!(
            "map {} reflow window [{}, {}) moved {} entries",
            self.ptr,
            start,
            start + heads.len() as u64,
            moved
        );
        Ok(moved)
    }

    /// Point the header at `buckets` and free the old array
    ///
    /// Runs only after the count check passed.
    fn switch_buckets(&mut self, buckets: ContiguousArray<ChunkPtr>, new_po2: u8) -> Result<()> {
        let old = std::mem::replace(&mut self.buckets, buckets);
        self.po2 = new_po2;
        self.reflow_target = None;
        self.reflow_moved = 0;
        self.write_header()?;
        // Heads only; the cells now hang off the new array
        self.storage.free(old.ptr())
    }

    fn check_moved(&self, moved: u64) -> Result<()> {
        if moved != self.size {
            return Err(IoCollError::Corruption(format!(
                "map {} reflow moved {} entries, expected {}",
                self.ptr, moved, self.size
            )));
        }
        Ok(())
    }

    fn lost_target(&self) -> IoCollError {
        IoCollError::Corruption(format!("map {} lost its reflow target", self.ptr))
    }

    /// First candidate whose new bucket is still empty, else the first candidate
    fn destination(
        &self,
        key: &K,
        new_po2: u8,
        mut is_empty: impl FnMut(u64) -> Result<bool>,
    ) -> Result<u64> {
        let candidates = self.candidates(key, new_po2);
        for &index in &candidates {
            if is_empty(index)? {
                return Ok(index);
            }
        }
        Ok(candidates[0])
    }
}
