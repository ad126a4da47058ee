//! Linked List
//!
//! Sequence built purely from cells.
//!
//! ## Chunk Layout
//! ```text
//! header:  ┌──────────┬──────────┐
//!          │ Size (8) │ Head (8) │
//!          └──────────┴────┬─────┘
//!                          ▼
//!                       [cell 0] ──► [cell 1] ──► ... ──► [cell n-1] ──► null
//! ```
//!
//! Indexed access walks the chain; a cursor remembers the last position
//! reached so forward scans do not restart from the head each time.

use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};

use crate::cell::Cell;
use crate::codec::{IoValue, NumberSize};
use crate::config::Config;
use crate::error::{IoCollError, Result};
use crate::storage::{ChunkPtr, Storage};

/// Header size: Size (8) + Head (8)
const HEADER_SIZE: u64 = 16;

/// Singly linked list of cells
pub struct LinkedIoList<T> {
    storage: Storage,
    ptr: ChunkPtr,
    size: u64,
    head: ChunkPtr,

    /// Last (index, cell) reached by a walk
    cursor: Option<(u64, ChunkPtr)>,

    _marker: PhantomData<fn() -> T>,
}

impl<T: IoValue> LinkedIoList<T> {
    pub fn create(storage: &Storage, _config: &Config) -> Result<Self> {
        let ptr = storage.allocate(HEADER_SIZE, None)?;
        let list = Self {
            storage: storage.clone(),
            ptr,
            size: 0,
            head: ChunkPtr::NULL,
            cursor: None,
            _marker: PhantomData,
        };
        list.write_header()?;
        Ok(list)
    }

    /// Open an existing list; a never-written header opens as empty
    pub fn open(storage: &Storage, ptr: ChunkPtr, _config: &Config) -> Result<Self> {
        let mut list = Self {
            storage: storage.clone(),
            ptr,
            size: 0,
            head: ChunkPtr::NULL,
            cursor: None,
            _marker: PhantomData,
        };
        if storage.size(ptr)? == 0 {
            list.write_header()?;
            return Ok(list);
        }
        list.reload_header()?;
        Ok(list)
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

    // =========================================================================
    // Head Operations
    // =========================================================================

    pub fn push_front(&mut self, value: T) -> Result<()> {
        let storage = self.storage.clone();
        self.mutate(|list| {
            let cell = Cell::alloc(&storage, Some(&value), list.head, Some(list.ptr))?;
            list.head = cell.ptr();
            list.size += 1;
            list.write_header()
        })?;
        self.cursor = self.cursor.map(|(index, cell)| (index + 1, cell));
        Ok(())
    }

    pub fn pop_front(&mut self) -> Result<Option<T>> {
        if self.size == 0 {
            return Ok(None);
        }
        let head: Cell<T> = Cell::open(&self.storage, self.head);
        let contents = head.load()?;
        let value = contents.value.ok_or_else(|| self.empty_cell(head.ptr()))?;

        let storage = self.storage.clone();
        self.mutate(|list| {
            list.head = contents.next;
            list.size -= 1;
            list.write_header()?;
            storage.free(head.ptr())
        })?;
        self.cursor = match self.cursor {
            Some((index, cell)) if index > 0 => Some((index - 1, cell)),
            _ => None,
        };
        Ok(Some(value))
    }

    // =========================================================================
    // Indexed Operations
    // =========================================================================

    /// Append at the tail
    pub fn add(&mut self, value: T) -> Result<()> {
        if self.size == 0 {
            return self.push_front(value);
        }
        let tail = self.locate(self.size - 1)?;
        let storage = self.storage.clone();
        self.mutate(|list| {
            let cell = Cell::alloc(&storage, Some(&value), ChunkPtr::NULL, Some(tail))?;
            Cell::<T>::open(&storage, tail).set_next(cell.ptr())?;
            list.size += 1;
            list.write_header()
        })
    }

    pub fn insert(&mut self, index: u64, value: T) -> Result<()> {
        if index > self.size {
            return Err(IoCollError::IndexOutOfBounds {
                index,
                len: self.size,
            });
        }
        if index == 0 {
            return self.push_front(value);
        }
        let prev = self.locate(index - 1)?;
        let storage = self.storage.clone();
        self.mutate(|list| {
            let mut prev_cell: Cell<T> = Cell::open(&storage, prev);
            let cell = Cell::alloc(&storage, Some(&value), prev_cell.next()?, Some(prev))?;
            prev_cell.set_next(cell.ptr())?;
            list.size += 1;
            list.write_header()
        })?;
        self.cursor = Some((index - 1, prev));
        Ok(())
    }

    pub fn get(&mut self, index: u64) -> Result<T> {
        self.check_index(index)?;
        let ptr = self.locate(index)?;
        let cell: Cell<T> = Cell::open(&self.storage, ptr);
        cell.value()?.ok_or_else(|| self.empty_cell(ptr))
    }

    /// Replace the value at `index`, returning the old one
    pub fn set(&mut self, index: u64, value: T) -> Result<T> {
        self.check_index(index)?;
        let ptr = self.locate(index)?;
        let mut cell: Cell<T> = Cell::open(&self.storage, ptr);
        let old = cell.value()?.ok_or_else(|| self.empty_cell(ptr))?;
        cell.set_value(Some(&value))?;
        Ok(old)
    }

    pub fn remove(&mut self, index: u64) -> Result<T> {
        self.check_index(index)?;
        if index == 0 {
            return self
                .pop_front()?
                .ok_or_else(|| self.empty_cell(self.head));
        }
        let prev = self.locate(index - 1)?;
        let mut prev_cell: Cell<T> = Cell::open(&self.storage, prev);
        let target = prev_cell.next()?;
        let contents = Cell::<T>::open(&self.storage, target).load()?;
        let value = contents.value.ok_or_else(|| self.empty_cell(target))?;

        let storage = self.storage.clone();
        self.mutate(|list| {
            prev_cell.set_next(contents.next)?;
            list.size -= 1;
            list.write_header()?;
            storage.free(target)
        })?;
        self.cursor = Some((index - 1, prev));
        Ok(value)
    }

    /// Append many values at once
    ///
    /// The new chain is built tail to head and linked in with a single
    /// pointer write, so each cell is allocated knowing its successor.
    pub fn add_many(&mut self, values: Vec<T>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let count = values.len() as u64;
        let tail = match self.size {
            0 => None,
            n => Some(self.locate(n - 1)?),
        };
        let hint = tail.unwrap_or(self.ptr);

        let storage = self.storage.clone();
        self.mutate(|list| {
            let mut next = ChunkPtr::NULL;
            for value in values.iter().rev() {
                next = Cell::alloc(&storage, Some(value), next, Some(hint))?.ptr();
            }
            match tail {
                Some(tail) => Cell::<T>::open(&storage, tail).set_next(next)?,
                None => list.head = next,
            }
            list.size += count;
            list.write_header()
        })
    }

    // =========================================================================
    // Whole-list Operations
    // =========================================================================

    pub fn contains(&self, value: &T) -> Result<bool>
    where
        T: PartialEq,
    {
        for item in self.iter() {
            if item? == *value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn iter(&self) -> ListIter<T> {
        ListIter {
            storage: self.storage.clone(),
            next: self.head,
            remaining: self.size,
            _marker: PhantomData,
        }
    }

    /// Free every cell
    pub fn clear(&mut self) -> Result<()> {
        let storage = self.storage.clone();
        self.mutate(|list| {
            let mut next = list.head;
            while let Some(ptr) = next.non_null() {
                next = Cell::<T>::open(&storage, ptr).next()?;
                storage.free(ptr)?;
            }
            list.head = ChunkPtr::NULL;
            list.size = 0;
            list.write_header()
        })?;
        self.cursor = None;
        Ok(())
    }

    pub fn free(mut self) -> Result<()> {
        self.clear()?;
        self.storage.free(self.ptr)
    }

    /// Check the chain length against the stored size
    pub fn validate(&self) -> Result<()> {
        let mut count = 0u64;
        let mut next = self.head;
        while let Some(ptr) = next.non_null() {
            count += 1;
            if count > self.size {
                break;
            }
            next = Cell::<T>::open(&self.storage, ptr).next()?;
        }
        if count != self.size {
            return Err(IoCollError::Corruption(format!(
                "list {} stores size {} but its chain has {}{} cells",
                self.ptr,
                self.size,
                if count > self.size { "more than " } else { "" },
                count.min(self.size + 1)
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn write_header(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.head.get());
        self.storage.write(self.ptr, 0, &buf)
    }

    fn reload_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        self.storage.read_exact(self.ptr, 0, &mut header)?;
        self.size = NumberSize::Long.read_slice(&header[..8])?;
        self.head = ChunkPtr::new(NumberSize::Long.read_slice(&header[8..])?);
        Ok(())
    }

    /// Run `f` in a transaction; after an outermost rollback the cached
    /// header is reloaded and the cursor dropped
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let storage = self.storage.clone();
        let result = storage.transaction(|| f(self));
        if result.is_err() && storage.transaction_depth() == 0 {
            self.cursor = None;
            self.reload_header()?;
        }
        result
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.size {
            return Err(IoCollError::IndexOutOfBounds {
                index,
                len: self.size,
            });
        }
        Ok(())
    }

    /// Cell at `index`, walking from the cursor when it is not past it
    fn locate(&mut self, index: u64) -> Result<ChunkPtr> {
        let (mut at, mut ptr) = match self.cursor {
            Some((at, ptr)) if at <= index => (at, ptr),
            _ => (0, self.head),
        };
        while at < index {
            ptr = Cell::<T>::open(&self.storage, ptr).next()?;
            if ptr.is_null() {
                return Err(IoCollError::Corruption(format!(
                    "list {} chain ends at {} of {}",
                    self.ptr, at, self.size
                )));
            }
            at += 1;
        }
        self.cursor = Some((index, ptr));
        Ok(ptr)
    }

    fn empty_cell(&self, cell: ChunkPtr) -> IoCollError {
        IoCollError::Corruption(format!("list {} reached empty cell {}", self.ptr, cell))
    }
}

/// Head-to-tail iterator
pub struct ListIter<T> {
    storage: Storage,
    next: ChunkPtr,
    remaining: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: IoValue> Iterator for ListIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.next.is_null() {
            return None;
        }
        let ptr = self.next;
        let contents = match Cell::<T>::open(&self.storage, ptr).load() {
            Ok(contents) => contents,
            Err(e) => {
                self.remaining = 0;
                return Some(Err(e));
            }
        };
        self.next = contents.next;
        self.remaining -= 1;
        Some(contents.value.ok_or_else(|| {
            IoCollError::Corruption(format!("list iteration reached empty cell {}", ptr))
        }))
    }
}
