//! Hash Map
//!
//! Chained-bucket hash map whose buckets and entries live in storage.
//!
//! ## Layout
//! ```text
//! header:   ┌──────────┬─────────┬──────────────────┬─────────────────┬───────────┐
//!           │ Size (8) │ PO2 (1) │ Bucket array (8) │ Reflow target(8)│ Moved (8) │
//!           └──────────┴─────────┴────────┬─────────┴─────────────────┴───────────┘
//!                                         ▼
//! buckets:  ContiguousArray<ChunkPtr>  [head 0][head 1] ... [head 2^po2 - 1]
//!                                         │
//!                                         ▼
//! chains:                         [cell (k, v)] ──► [cell (k, v)] ──► [empty cell]
//! ```
//! The reflow target and moved count are only set while a streaming reflow
//! is under way (see `reflow.rs`).
//!
//! ## Placement
//! Each key has a few candidate buckets (`SmallHashes`). A put overwrites the
//! key where it already lives; otherwise it takes the first candidate with an
//! empty head or an empty trailing cell, and only then appends to the first
//! candidate's chain. Lookups check every candidate.
//!
//! ## Growth
//! When `size` reaches the bucket count the map reflows into twice as many
//! buckets (see `reflow.rs`).

mod bucket;
mod entry;
mod probe;
mod reflow;

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};

use crate::array::ContiguousArray;
use crate::cache::AgedCache;
use crate::cell::Cell;
use crate::codec::{hash_value, IoValue, NumberSize};
use crate::config::Config;
use crate::error::{IoCollError, Result};
use crate::storage::{ChunkPtr, Storage};

use bucket::ResidentBucket;

pub use entry::EntryRef;
pub use probe::SmallHashes;
pub use reflow::ReflowPath;

/// Header size: Size (8) + PO2 (1) + Bucket array (8) + Reflow target (8) + Moved (8)
const HEADER_SIZE: u64 = 33;

/// Offset of the moved count inside the header
const MOVED_OFFSET: u64 = 25;

/// Largest bucket power the map grows to
const MAX_BUCKET_PO2: u8 = 48;

/// Counters describing a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapStats {
    pub len: u64,
    pub bucket_po2: u8,
    pub bucket_count: u64,
    pub dataset_id: u64,
    pub reflows: u64,
    pub last_reflow: Option<ReflowPath>,
    pub cached_buckets: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Decoded header
struct MapHeader {
    size: u64,
    po2: u8,
    buckets: ContiguousArray<ChunkPtr>,
    reflow_target: Option<ContiguousArray<ChunkPtr>>,
    reflow_moved: u64,
}

/// Persistent hash map
pub struct HashIoMap<K, V> {
    storage: Storage,
    ptr: ChunkPtr,
    config: Config,

    size: u64,
    po2: u8,
    buckets: ContiguousArray<ChunkPtr>,

    /// Array a streaming reflow is filling, and the entries moved into it
    reflow_target: Option<ContiguousArray<ChunkPtr>>,
    reflow_moved: u64,

    /// Hot buckets; advisory copies of chains on storage
    cache: AgedCache<u64, ResidentBucket<K, V>>,

    /// Bumped whenever cells may have moved or been freed
    dataset_id: u64,

    reflows: u64,
    last_reflow: Option<ReflowPath>,
}

impl<K: IoValue + PartialEq, V: IoValue> HashIoMap<K, V> {
    pub fn create(storage: &Storage, config: &Config) -> Result<Self> {
        let po2 = config.initial_bucket_po2.min(MAX_BUCKET_PO2);
        let ptr = storage.allocate(HEADER_SIZE, None)?;
        let buckets = Self::empty_buckets(storage, config, po2)?;
        let map = Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            size: 0,
            po2,
            buckets,
            reflow_target: None,
            reflow_moved: 0,
            cache: AgedCache::new(config.bucket_cache_capacity),
            dataset_id: 0,
            reflows: 0,
            last_reflow: None,
        };
        map.write_header()?;
        Ok(map)
    }

    /// Open an existing map, finishing a reflow a crash interrupted
    pub fn open(storage: &Storage, ptr: ChunkPtr, config: &Config) -> Result<Self> {
        let header = Self::read_header(storage, ptr, config)?;
        let mut map = Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            size: header.size,
            po2: header.po2,
            buckets: header.buckets,
            reflow_target: header.reflow_target,
            reflow_moved: header.reflow_moved,
            cache: AgedCache::new(config.bucket_cache_capacity),
            dataset_id: 0,
            reflows: 0,
            last_reflow: None,
        };
        map.finish_reflow()?;
        Ok(map)
    }

    // =========================================================================
    // Shape
    // =========================================================================

    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bucket_po2(&self) -> u8 {
        self.po2
    }

    pub fn bucket_count(&self) -> u64 {
        1u64 << self.po2
    }

    /// Changes whenever outstanding entry handles may be stale
    pub fn dataset_id(&self) -> u64 {
        self.dataset_id
    }

    pub fn stats(&self) -> MapStats {
        let (cache_hits, cache_misses) = self.cache.hit_stats();
        MapStats {
            len: self.size,
            bucket_po2: self.po2,
            bucket_count: self.bucket_count(),
            dataset_id: self.dataset_id,
            reflows: self.reflows,
            last_reflow: self.last_reflow,
            cached_buckets: self.cache.len(),
            cache_hits,
            cache_misses,
        }
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        self.finish_reflow()?;
        for index in self.candidates(key, self.po2) {
            let bucket = self.load_bucket(index)?;
            if let Some(pos) = bucket.find(key) {
                return Ok(bucket.cells[pos].entry.clone().map(|(_, v)| v));
            }
        }
        Ok(None)
    }

    pub fn contains_key(&mut self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or overwrite; returns the previous value
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.finish_reflow()?;
        let candidates = self.candidates(&key, self.po2);

        for &index in &candidates {
            let bucket = self.load_bucket(index)?;
            if let Some(pos) = bucket.find(&key) {
                let cell = &bucket.cells[pos];
                let old = cell.entry.clone().map(|(_, v)| v);
                Cell::<(K, V)>::open(&self.storage, cell.ptr).set_value(Some(&(key, value)))?;
                self.cache.remove(&index);
                return Ok(old);
            }
        }

        self.mutate(|map| {
            map.place(&candidates, (key, value))?;
            map.write_size(map.size + 1)
        })?;
        self.size += 1;

        if self.size >= self.bucket_count() && self.po2 < MAX_BUCKET_PO2 {
            self.reflow()?;
        }
        if self.config.validate {
            self.validate()?;
        }
        Ok(None)
    }

    /// Remove a key; returns its value
    ///
    /// A tail cell is emptied in place and kept for the next insert into
    /// its bucket; any other cell is unlinked and freed.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        self.finish_reflow()?;
        for index in self.candidates(key, self.po2) {
            let bucket = self.load_bucket(index)?;
            let Some(pos) = bucket.find(key) else {
                continue;
            };
            let cell = &bucket.cells[pos];
            let old = cell.entry.clone().map(|(_, v)| v);

            let storage = self.storage.clone();
            self.mutate(|map| {
                if cell.next.is_null() {
                    Cell::<(K, V)>::open(&storage, cell.ptr).set_value(None)?;
                } else {
                    if pos == 0 {
                        map.buckets.set(index, cell.next)?;
                    } else {
                        Cell::<(K, V)>::open(&storage, bucket.cells[pos - 1].ptr)
                            .set_next(cell.next)?;
                    }
                    storage.free(cell.ptr)?;
                }
                map.write_size(map.size - 1)
            })?;

            self.size -= 1;
            self.cache.remove(&index);
            self.dataset_id += 1;
            if self.config.validate {
                self.validate()?;
            }
            return Ok(old);
        }
        Ok(None)
    }

    // =========================================================================
    // Whole-map Operations
    // =========================================================================

    /// Entries bucket by bucket; an unfinished reflow's target array is
    /// walked after the old one
    pub fn iter(&self) -> MapIter<'_, K, V> {
        MapIter {
            map: self,
            arrays: std::iter::once(&self.buckets)
                .chain(self.reflow_target.as_ref())
                .collect(),
            next_bucket: 0,
            heads: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = Result<K>> + '_ {
        self.iter().map(|item| item.map(|(k, _)| k))
    }

    /// Remove every entry and shrink back to the initial bucket power
    pub fn clear(&mut self) -> Result<()> {
        self.finish_reflow()?;
        let po2 = self.config.initial_bucket_po2.min(MAX_BUCKET_PO2);
        let storage = self.storage.clone();
        let result = self.mutate(|map| {
            map.free_cells()?;
            let fresh = Self::empty_buckets(&storage, &map.config, po2)?;
            let old = std::mem::replace(&mut map.buckets, fresh);
            old.free()?;
            map.size = 0;
            map.po2 = po2;
            map.write_header()
        });
        self.cache.clear();
        self.dataset_id += 1;
        result
    }

    /// Release the header, the bucket array and every cell
    pub fn free(mut self) -> Result<()> {
        self.finish_reflow()?;
        let storage = self.storage.clone();
        storage.transaction(|| {
            self.free_cells()?;
            storage.free(self.ptr)
        })?;
        self.buckets.free()
    }

    /// Check size, reachability and cache coherence from scratch
    pub fn validate(&self) -> Result<()> {
        if let Some(target) = &self.reflow_target {
            return Err(IoCollError::Corruption(format!(
                "map {} has an unfinished reflow into {} ({} of {} entries moved)",
                self.ptr,
                target.ptr(),
                self.reflow_moved,
                self.size
            )));
        }
        let mut live = 0u64;
        for index in 0..self.bucket_count() {
            let bucket = ResidentBucket::<K, V>::load(&self.storage, self.buckets.get(index)?)?;
            for (pos, cell) in bucket.cells.iter().enumerate() {
                match &cell.entry {
                    Some((key, _)) => {
                        live += 1;
                        if !self.candidates(key, self.po2).contains(&index) {
                            return Err(IoCollError::Corruption(format!(
                                "map {} holds a key in bucket {} outside its probe sequence",
                                self.ptr, index
                            )));
                        }
                    }
                    None if pos + 1 != bucket.cells.len() => {
                        return Err(IoCollError::Corruption(format!(
                            "map {} bucket {} has an empty cell mid-chain",
                            self.ptr, index
                        )));
                    }
                    None => {}
                }
            }
            if let Some(cached) = self.cache.peek(&index) {
                if !cached.same_chain(&bucket) {
                    return Err(IoCollError::Corruption(format!(
                        "map {} cached bucket {} differs from storage",
                        self.ptr, index
                    )));
                }
            }
        }
        if live != self.size {
            return Err(IoCollError::Corruption(format!(
                "map {} stores size {} but holds {} entries",
                self.ptr, self.size, live
            )));
        }
        if self.size > self.bucket_count() {
            return Err(IoCollError::Corruption(format!(
                "map {} holds {} entries in {} buckets",
                self.ptr,
                self.size,
                self.bucket_count()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn empty_buckets(
        storage: &Storage,
        config: &Config,
        po2: u8,
    ) -> Result<ContiguousArray<ChunkPtr>> {
        let mut buckets = ContiguousArray::create(storage, config)?;
        buckets.add_many(1u64 << po2, |_| ChunkPtr::NULL)?;
        Ok(buckets)
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
        buf.put_u64_le(self.size);
        buf.put_u8(self.po2);
        buf.put_u64_le(self.buckets.ptr().get());
        buf.put_u64_le(self.reflow_target.as_ref().map_or(0, |t| t.ptr().get()));
        buf.put_u64_le(self.reflow_moved);
        self.storage.write(self.ptr, 0, &buf)
    }

    fn write_size(&self, size: u64) -> Result<()> {
        self.storage.write(self.ptr, 0, &size.to_le_bytes())
    }

    fn write_moved(&self, moved: u64) -> Result<()> {
        self.storage.write(self.ptr, MOVED_OFFSET, &moved.to_le_bytes())
    }

    fn read_header(storage: &Storage, ptr: ChunkPtr, config: &Config) -> Result<MapHeader> {
        let mut header = [0u8; HEADER_SIZE as usize];
        storage.read_exact(ptr, 0, &mut header)?;
        let size = NumberSize::Long.read_slice(&header[..8])?;
        let po2 = header[8];
        let buckets_ptr = ChunkPtr::new(NumberSize::Long.read_slice(&header[9..17])?);
        let target_ptr = ChunkPtr::new(NumberSize::Long.read_slice(&header[17..25])?);
        let moved = NumberSize::Long.read_slice(&header[25..])?;

        let buckets = ContiguousArray::open(storage, buckets_ptr, config)?;
        if po2 > MAX_BUCKET_PO2 || buckets.len() != 1u64 << po2 {
            return Err(IoCollError::Corruption(format!(
                "map {} has bucket power {} but {} buckets",
                ptr,
                po2,
                buckets.len()
            )));
        }
        let target = match target_ptr.non_null() {
            Some(target_ptr) => {
                let target = ContiguousArray::open(storage, target_ptr, config)?;
                if target.len() != 2u64 << po2 {
                    return Err(IoCollError::Corruption(format!(
                        "map {} reflows from {} buckets into {}",
                        ptr,
                        buckets.len(),
                        target.len()
                    )));
                }
                Some(target)
            }
            None => None,
        };
        Ok(MapHeader {
            size,
            po2,
            buckets,
            reflow_target: target,
            reflow_moved: moved,
        })
    }

    /// Run `f` in a transaction; after an outermost rollback everything
    /// cached is reloaded from the header
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let storage = self.storage.clone();
        let result = storage.transaction(|| f(self));
        if result.is_err() && storage.transaction_depth() == 0 {
            let header = Self::read_header(&self.storage, self.ptr, &self.config)?;
            self.size = header.size;
            self.po2 = header.po2;
            self.buckets = header.buckets;
            self.reflow_target = header.reflow_target;
            self.reflow_moved = header.reflow_moved;
            self.cache.clear();
            self.dataset_id += 1;
        }
        result
    }

    fn candidates(&self, key: &K, po2: u8) -> Vec<u64> {
        SmallHashes::new(hash_value(key), po2, self.config.probe_generations).distinct()
    }

    /// Bucket chain, from the cache when resident
    fn load_bucket(&mut self, index: u64) -> Result<ResidentBucket<K, V>> {
        if let Some(bucket) = self.cache.get(&index) {
            return Ok(bucket);
        }
        let bucket = ResidentBucket::load(&self.storage, self.buckets.get(index)?)?;
        self.cache.insert(index, bucket.clone());
        Ok(bucket)
    }

    /// Put a new entry into one of its candidate buckets
    fn place(&mut self, candidates: &[u64], entry: (K, V)) -> Result<()> {
        for &index in candidates {
            let bucket = self.load_bucket(index)?;
            if bucket.head.is_null() {
                let cell = Cell::alloc(&self.storage, Some(&entry), ChunkPtr::NULL, Some(self.ptr))?;
                self.buckets.set(index, cell.ptr())?;
                self.cache.remove(&index);
                return Ok(());
            }
            if let Some(tail) = bucket.empty_tail() {
                Cell::<(K, V)>::open(&self.storage, tail.ptr).set_value(Some(&entry))?;
                self.cache.remove(&index);
                return Ok(());
            }
        }

        let index = candidates[0];
        let bucket = self.load_bucket(index)?;
        let tail = bucket.cells.last().map(|cell| cell.ptr).ok_or_else(|| {
            IoCollError::Corruption(format!("map {} bucket {} lost its chain", self.ptr, index))
        })?;
        let cell = Cell::alloc(&self.storage, Some(&entry), ChunkPtr::NULL, Some(tail))?;
        Cell::<(K, V)>::open(&self.storage, tail).set_next(cell.ptr())?;
        self.cache.remove(&index);
        Ok(())
    }

    /// Free every cell of every bucket
    fn free_cells(&mut self) -> Result<()> {
        for index in 0..self.bucket_count() {
            let mut next = self.buckets.get(index)?;
            while let Some(ptr) = next.non_null() {
                next = Cell::<(K, V)>::open(&self.storage, ptr).next()?;
                self.storage.free(ptr)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Iterator over live entries, bucket by bucket
pub struct MapIter<'a, K, V> {
    map: &'a HashIoMap<K, V>,
    arrays: VecDeque<&'a ContiguousArray<ChunkPtr>>,
    next_bucket: u64,
    heads: VecDeque<ChunkPtr>,
    pending: VecDeque<(K, V)>,
}

impl<'a, K: IoValue + PartialEq, V: IoValue> MapIter<'a, K, V> {
    fn refill(&mut self) -> Result<bool> {
        while self.pending.is_empty() {
            if self.heads.is_empty() {
                let Some(array) = self.arrays.front() else {
                    return Ok(false);
                };
                let count = array.len();
                if self.next_bucket >= count {
                    self.arrays.pop_front();
                    self.next_bucket = 0;
                    continue;
                }
                let stop = (self.next_bucket + self.map.config.reflow_window.max(1) as u64).min(count);
                self.heads.extend(array.get_many(self.next_bucket..stop)?);
                self.next_bucket = stop;
            }
            if let Some(head) = self.heads.pop_front() {
                let bucket = ResidentBucket::<K, V>::load(&self.map.storage, head)?;
                self.pending
                    .extend(bucket.cells.into_iter().filter_map(|cell| cell.entry));
            }
        }
        Ok(true)
    }
}

impl<'a, K: IoValue + PartialEq, V: IoValue> Iterator for MapIter<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.refill() {
            Ok(true) => self.pending.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => {
                self.arrays.clear();
                self.heads.clear();
                Some(Err(e))
            }
        }
    }
}
