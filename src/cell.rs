//! Cell
//!
//! One link of a singly linked chain. Lists, hash map buckets and hash set
//! buckets are all chains of cells.
//!
//! ## Chunk Layout
//! ```text
//! ┌───────────┬──────────────────────┬─────────────────────────┐
//! │ Width (1) │ Next (width bytes)   │ Value (inline, optional)│
//! └───────────┴──────────────────────┴─────────────────────────┘
//! ```
//! An empty value area means the cell holds no value. The width only ever
//! grows: widening shifts the value right inside the same chunk, so a cell is
//! never relocated and pointers to it stay valid.

use std::cell::OnceCell;
use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};

use crate::codec::{from_inline, to_inline, IoValue, NumberSize};
use crate::error::{IoCollError, Result};
use crate::storage::{ChunkPtr, Storage};

/// Width flag size
const FLAG_SIZE: u64 = 1;

/// Everything stored in one cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellContents<T> {
    pub next: ChunkPtr,
    pub value: Option<T>,
}

/// Handle to a cell chunk
pub struct Cell<T> {
    storage: Storage,
    ptr: ChunkPtr,

    /// Cached width flag, read on first use
    width: OnceCell<NumberSize>,

    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            ptr: self.ptr,
            width: self.width.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("ptr", &self.ptr)
            .field("width", &self.width.get())
            .finish()
    }
}

impl<T: IoValue> Cell<T> {
    /// Allocate a cell holding `value` and linking to `next`
    ///
    /// The pointer width fits both `next` and the cell's own address, so
    /// linking to neighbours allocated later rarely forces a widen.
    pub fn alloc(
        storage: &Storage,
        value: Option<&T>,
        next: ChunkPtr,
        position_hint: Option<ChunkPtr>,
    ) -> Result<Self> {
        let payload = value.map(to_inline).unwrap_or_default();
        let guess = NumberSize::fitting(next.get()).max(NumberSize::Int);
        let ptr = storage.allocate(
            FLAG_SIZE + guess.bytes() as u64 + payload.len() as u64,
            position_hint,
        )?;

        let width = NumberSize::fitting(next.get().max(ptr.get()));
        let mut buf = BytesMut::with_capacity(FLAG_SIZE as usize + width.bytes() + payload.len());
        buf.put_u8(width.tag());
        width.write(next.get(), &mut buf)?;
        buf.extend_from_slice(&payload);
        storage.write(ptr, 0, &buf)?;

        Ok(Self {
            storage: storage.clone(),
            ptr,
            width: OnceCell::from(width),
            _marker: PhantomData,
        })
    }

    /// Handle to an existing cell (no I/O)
    pub fn open(storage: &Storage, ptr: ChunkPtr) -> Self {
        Self {
            storage: storage.clone(),
            ptr,
            width: OnceCell::new(),
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    /// Width of the next field; a never-written cell reads as `Void`
    pub fn width(&self) -> Result<NumberSize> {
        if let Some(width) = self.width.get() {
            return Ok(*width);
        }
        let mut flag = [0u8; 1];
        let width = match self.storage.read(self.ptr, 0, &mut flag)? {
            0 => NumberSize::Void,
            _ => NumberSize::from_tag(flag[0])?,
        };
        let _ = self.width.set(width);
        Ok(width)
    }

    /// Next cell in the chain, null at the end
    pub fn next(&self) -> Result<ChunkPtr> {
        let width = self.width()?;
        if width == NumberSize::Void {
            return Ok(ChunkPtr::NULL);
        }
        let mut buf = [0u8; 8];
        let field = &mut buf[..width.bytes()];
        match self.storage.read(self.ptr, FLAG_SIZE, field)? {
            0 => Ok(ChunkPtr::NULL),
            n if n == field.len() => Ok(ChunkPtr::new(width.read_slice(field)?)),
            n => Err(IoCollError::Corruption(format!(
                "cell {} next field cut after {} of {} bytes",
                self.ptr,
                n,
                width.bytes()
            ))),
        }
    }

    pub fn value(&self) -> Result<Option<T>> {
        let start = FLAG_SIZE + self.width()?.bytes() as u64;
        let bytes = self.storage.read_from(self.ptr, start)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        from_inline(&bytes).map(Some)
    }

    /// Next pointer and value with a single read
    pub fn load(&self) -> Result<CellContents<T>> {
        let bytes = self.storage.read_from(self.ptr, 0)?;
        if bytes.is_empty() {
            return Ok(CellContents {
                next: ChunkPtr::NULL,
                value: None,
            });
        }
        let width = NumberSize::from_tag(bytes[0])?;
        let _ = self.width.set(width);

        let mut input = &bytes[FLAG_SIZE as usize..];
        let next = ChunkPtr::new(width.read(&mut input)?);
        let value = if input.is_empty() {
            None
        } else {
            Some(T::decode_inline(&mut input)?)
        };
        Ok(CellContents { next, value })
    }

    /// Replace the value; `None` leaves the cell empty
    pub fn set_value(&mut self, value: Option<&T>) -> Result<()> {
        let start = FLAG_SIZE + self.width()?.bytes() as u64;
        let payload = value.map(to_inline).unwrap_or_default();
        let storage = &self.storage;
        let ptr = self.ptr;
        storage.transaction(|| {
            if !payload.is_empty() {
                storage.write(ptr, start, &payload)?;
            }
            storage.set_size(ptr, start + payload.len() as u64)
        })
    }

    /// Link to `next`, widening the pointer field in place if needed
    pub fn set_next(&mut self, next: ChunkPtr) -> Result<()> {
        let width = self.width()?;
        if width.can_hold(next.get()) {
            if width == NumberSize::Void {
                return Ok(());
            }
            let mut buf = BytesMut::with_capacity(width.bytes());
            width.write(next.get(), &mut buf)?;
            return self.storage.write(self.ptr, FLAG_SIZE, &buf);
        }

        let wider = NumberSize::fitting(next.get());
        let payload = self
            .storage
            .read_from(self.ptr, FLAG_SIZE + width.bytes() as u64)?;

        let mut buf = BytesMut::with_capacity(FLAG_SIZE as usize + wider.bytes() + payload.len());
        buf.put_u8(wider.tag());
        wider.write(next.get(), &mut buf)?;
        buf.extend_from_slice(&payload);

        let storage = &self.storage;
        let ptr = self.ptr;
        storage.transaction(|| {
            storage.ensure_capacity(ptr, buf.len() as u64)?;
            storage.write(ptr, 0, &buf)?;
            storage.set_size(ptr, buf.len() as u64)
        })?;

        tracing::trace!("cell {} next width {:?} -> {:?}", self.ptr, width, wider);
        self.width = OnceCell::from(wider);
        Ok(())
    }

    /// Release the chunk; the owner must have unlinked the cell already
    pub fn free(self) -> Result<()> {
        self.storage.free(self.ptr)
    }
}
