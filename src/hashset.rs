//! Hash Set
//!
//! Open-hash set: one probe (`hash mod width`) into a bucket array of cell
//! chains. No incremental reflow; an overfull set grows stop-the-world.
//!
//! ## Layout
//! ```text
//! header:  ┌──────────┬──────────────────────┐
//!          │ Size (8) │ Bucket array ptr (8) │
//!          └──────────┴──────────┬───────────┘
//!                                ▼
//!          ContiguousArray<ChunkPtr>  [head 0] ... [head width-1]
//!                                        │
//!                                        ▼
//!                                     [cell v] ──► [cell v] ──► null
//! ```

use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};

use crate::array::ContiguousArray;
use crate::cell::Cell;
use crate::codec::{hash_value, IoValue, NumberSize};
use crate::config::Config;
use crate::error::{IoCollError, Result};
use crate::storage::{ChunkPtr, Storage};

/// Header size: Size (8) + Bucket array ptr (8)
const HEADER_SIZE: u64 = 16;

/// Persistent hash set
pub struct IoHashSet<T> {
    storage: Storage,
    ptr: ChunkPtr,
    config: Config,
    size: u64,
    buckets: ContiguousArray<ChunkPtr>,
    grows: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: IoValue + PartialEq> IoHashSet<T> {
    pub fn create(storage: &Storage, config: &Config) -> Result<Self> {
        let ptr = storage.allocate(HEADER_SIZE, None)?;
        let width = 1u64 << config.initial_bucket_po2.min(48);
        let mut buckets = ContiguousArray::create(storage, config)?;
        buckets.add_many(width, |_| ChunkPtr::NULL)?;
        let set = Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            size: 0,
            buckets,
            grows: 0,
            _marker: PhantomData,
        };
        set.write_header()?;
        Ok(set)
    }

    pub fn open(storage: &Storage, ptr: ChunkPtr, config: &Config) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        storage.read_exact(ptr, 0, &mut header)?;
        let size = NumberSize::Long.read_slice(&header[..8])?;
        let buckets_ptr = ChunkPtr::new(NumberSize::Long.read_slice(&header[8..])?);
        let buckets = ContiguousArray::open(storage, buckets_ptr, config)?;
        if buckets.is_empty() {
            return Err(IoCollError::Corruption(format!(
                "hash set {} has no buckets",
                ptr
            )));
        }
        Ok(Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            size,
            buckets,
            grows: 0,
            _marker: PhantomData,
        })
    }

    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of buckets
    pub fn width(&self) -> u64 {
        self.buckets.len()
    }

    /// Stop-the-world grows since this handle was opened
    pub fn grows(&self) -> u64 {
        self.grows
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn contains(&self, value: &T) -> Result<bool> {
        let head = self.buckets.get(self.index_of(value, self.width()))?;
        Ok(self.find(head, value)?.is_some())
    }

    /// Insert; false if the value was already present
    pub fn insert(&mut self, value: T) -> Result<bool> {
        let index = self.index_of(&value, self.width());
        let head = self.buckets.get(index)?;
        if self.find(head, &value)?.is_some() {
            return Ok(false);
        }

        let storage = self.storage.clone();
        storage.transaction(|| {
            let hint = head.non_null().unwrap_or(self.ptr);
            let cell = Cell::alloc(&storage, Some(&value), head, Some(hint))?;
            self.buckets.set(index, cell.ptr())?;
            self.write_header_fields(self.size + 1, self.buckets.ptr())
        })?;
        self.size += 1;

        if self.size > self.width() {
            self.grow()?;
        }
        if self.config.validate {
            self.validate()?;
        }
        Ok(true)
    }

    /// Remove; false if the value was absent
    pub fn remove(&mut self, value: &T) -> Result<bool> {
        let index = self.index_of(value, self.width());
        let head = self.buckets.get(index)?;
        let Some((prev, ptr, next)) = self.find(head, value)? else {
            return Ok(false);
        };

        let storage = self.storage.clone();
        storage.transaction(|| {
            match prev {
                Some(prev) => Cell::<T>::open(&storage, prev).set_next(next)?,
                None => self.buckets.set(index, next)?,
            }
            storage.free(ptr)?;
            self.write_header_fields(self.size - 1, self.buckets.ptr())
        })?;
        self.size -= 1;
        Ok(true)
    }

    // =========================================================================
    // Whole-set Operations
    // =========================================================================

    pub fn iter(&self) -> SetIter<'_, T> {
        SetIter {
            set: self,
            next_bucket: 0,
            chain: ChunkPtr::NULL,
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        let storage = self.storage.clone();
        storage.transaction(|| {
            for index in 0..self.width() {
                let head = self.buckets.get(index)?;
                if head.is_null() {
                    continue;
                }
                self.free_chain(head)?;
                self.buckets.set(index, ChunkPtr::NULL)?;
            }
            self.write_header_fields(0, self.buckets.ptr())
        })?;
        self.size = 0;
        Ok(())
    }

    pub fn free(mut self) -> Result<()> {
        self.clear()?;
        self.storage.free(self.ptr)?;
        self.buckets.free()
    }

    /// Check the size and that every value sits in its own bucket
    pub fn validate(&self) -> Result<()> {
        let width = self.width();
        let mut count = 0u64;
        for index in 0..width {
            let mut next = self.buckets.get(index)?;
            while let Some(ptr) = next.non_null() {
                let contents = Cell::<T>::open(&self.storage, ptr).load()?;
                let value = contents.value.ok_or_else(|| {
                    IoCollError::Corruption(format!("hash set {} has empty cell {}", self.ptr, ptr))
                })?;
                if self.index_of(&value, width) != index {
                    return Err(IoCollError::Corruption(format!(
                        "hash set {} holds a value in bucket {} it does not hash to",
                        self.ptr, index
                    )));
                }
                count += 1;
                next = contents.next;
            }
        }
        if count != self.size {
            return Err(IoCollError::Corruption(format!(
                "hash set {} stores size {} but holds {} values",
                self.ptr, self.size, count
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn write_header(&self) -> Result<()> {
        self.write_header_fields(self.size, self.buckets.ptr())
    }

    fn write_header_fields(&self, size: u64, buckets: ChunkPtr) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
        buf.put_u64_le(size);
        buf.put_u64_le(buckets.get());
        self.storage.write(self.ptr, 0, &buf)
    }

    fn index_of(&self, value: &T, width: u64) -> u64 {
        hash_value(value) % width
    }

    /// (previous cell, cell, next) for `value` in the chain at `head`
    fn find(&self, head: ChunkPtr, value: &T) -> Result<Option<(Option<ChunkPtr>, ChunkPtr, ChunkPtr)>> {
        let mut prev = None;
        let mut next = head;
        while let Some(ptr) = next.non_null() {
            let contents = Cell::<T>::open(&self.storage, ptr).load()?;
            if contents.value.as_ref() == Some(value) {
                return Ok(Some((prev, ptr, contents.next)));
            }
            prev = Some(ptr);
            next = contents.next;
        }
        Ok(None)
    }

    fn free_chain(&self, head: ChunkPtr) -> Result<()> {
        let mut next = head;
        while let Some(ptr) = next.non_null() {
            next = Cell::<T>::open(&self.storage, ptr).next()?;
            self.storage.free(ptr)?;
        }
        Ok(())
    }

    /// Relink every cell into a bucket array twice the size of the contents
    fn grow(&mut self) -> Result<()> {
        let old_width = self.width();
        let new_width = 2 * self.size.max(old_width);
        tracing::debug!(
            "hash set {} grow: {} -> {} buckets, {} values",
            self.ptr,
            old_width,
            new_width,
            self.size
        );

        let storage = self.storage.clone();
        let buckets = storage.transaction(|| {
            let mut heads = vec![ChunkPtr::NULL; new_width as usize];
            for index in 0..old_width {
                let mut next = self.buckets.get(index)?;
                while let Some(ptr) = next.non_null() {
                    let mut cell: Cell<T> = Cell::open(&storage, ptr);
                    let contents = cell.load()?;
                    next = contents.next;
                    let value = contents.value.ok_or_else(|| {
                        IoCollError::Corruption(format!("hash set {} has empty cell {}", self.ptr, ptr))
                    })?;
                    let dest = self.index_of(&value, new_width) as usize;
                    cell.set_next(heads[dest])?;
                    heads[dest] = ptr;
                }
            }
            let buckets = ContiguousArray::from_values(&storage, &self.config, heads)?;
            self.write_header_fields(self.size, buckets.ptr())?;
            storage.free(self.buckets.ptr())?;
            Ok(buckets)
        })?;
        self.buckets = buckets;
        self.grows += 1;
        Ok(())
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Iterator over the set's values, bucket by bucket
pub struct SetIter<'a, T> {
    set: &'a IoHashSet<T>,
    next_bucket: u64,
    chain: ChunkPtr,
}

impl<'a, T: IoValue + PartialEq> Iterator for SetIter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ptr) = self.chain.non_null() {
                return match Cell::<T>::open(&self.set.storage, ptr).load() {
                    Ok(contents) => {
                        self.chain = contents.next;
                        match contents.value {
                            Some(value) => Some(Ok(value)),
                            None => continue,
                        }
                    }
                    Err(e) => {
                        self.chain = ChunkPtr::NULL;
                        self.next_bucket = self.set.width();
                        Some(Err(e))
                    }
                };
            }
            if self.next_bucket >= self.set.width() {
                return None;
            }
            match self.set.buckets.get(self.next_bucket) {
                Ok(head) => {
                    self.chain = head;
                    self.next_bucket += 1;
                }
                Err(e) => {
                    self.next_bucket = self.set.width();
                    return Some(Err(e));
                }
            }
        }
    }
}
