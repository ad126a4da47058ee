//! Contiguous Array
//!
//! Flat, randomly indexable sequence stored in a single chunk.
//!
//! ## Chunk Layout
//! ```text
//! ┌─────────────┬──────────────────────────┬──────────┬──────────┬─────┐
//! │ Count (8)   │ Width tag per field (1)  │ elem 0   │ elem 1   │ ... │
//! └─────────────┴──────────────────────────┴──────────┴──────────┴─────┘
//!   offset(i) = 8 + fields + i * element_width
//! ```
//!
//! ## Element Widths
//! Every element has the same width. Variable-width fields (integers, chunk
//! pointers to reference payloads) start at the narrowest size that fits what
//! has been written. A value that does not fit triggers a whole-array
//! migration to wider fields (see `batch.rs`); the caller never sees the
//! overflow.

mod batch;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Range;

use bytes::{BufMut, BytesMut};

use crate::codec::{from_inline, to_inline, IoValue, NumberSize, ValueStorage};
use crate::config::Config;
use crate::error::{IoCollError, Result};
use crate::storage::{ChunkPtr, Storage};

/// Count field size
const COUNT_SIZE: u64 = 8;

/// An element ready to be encoded
///
/// Reference payloads are written to their own chunk before the element is
/// encoded, so only the pointer has to fit the negotiated width.
pub(crate) enum Staged<T> {
    Value(T),
    Pointer(ChunkPtr),
}

/// Growable array of `T` in one chunk
pub struct ContiguousArray<T> {
    storage: Storage,
    ptr: ChunkPtr,
    layout: ValueStorage,
    widths: Vec<NumberSize>,
    len: u64,

    staging_bytes: usize,
    defrag_chain_limit: usize,
    defrag_step_budget: usize,

    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for ContiguousArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContiguousArray")
            .field("ptr", &self.ptr)
            .field("layout", &self.layout)
            .field("widths", &self.widths)
            .field("len", &self.len)
            .finish()
    }
}

impl<T: IoValue> ContiguousArray<T> {
    /// Create an empty array with the narrowest widths
    pub fn create(storage: &Storage, config: &Config) -> Result<Self> {
        let widths = vec![NumberSize::Void; T::storage().field_count()];
        Self::with_widths(storage, config, widths)
    }

    /// Create an empty array with preset field widths
    pub fn with_widths(storage: &Storage, config: &Config, widths: Vec<NumberSize>) -> Result<Self> {
        let layout = T::storage();
        if widths.len() != layout.field_count() {
            return Err(IoCollError::Config(format!(
                "{:?} needs {} field widths, got {}",
                layout,
                layout.field_count(),
                widths.len()
            )));
        }
        let ptr = storage.allocate(COUNT_SIZE + widths.len() as u64, None)?;
        let mut array = Self {
            storage: storage.clone(),
            ptr,
            layout,
            widths,
            len: 0,
            staging_bytes: config.staging_buffer_bytes.max(1),
            defrag_chain_limit: config.defrag_chain_limit,
            defrag_step_budget: config.defrag_step_budget,
            _marker: PhantomData,
        };
        array.write_header()?;
        Ok(array)
    }

    /// Create an array holding `values`, with widths negotiated over all of
    /// them up front so no migration happens while filling it
    ///
    /// One transaction covers the header, any reference payloads and the
    /// elements, so a failure leaves nothing allocated.
    pub fn from_values(storage: &Storage, config: &Config, values: Vec<T>) -> Result<Self> {
        storage.transaction(|| {
            let mut array = Self::create(storage, config)?;
            let staged = values
                .into_iter()
                .map(|value| array.stage(value))
                .collect::<Result<Vec<_>>>()?;

            let mut widths = array.widths.clone();
            for item in &staged {
                array.raise_widths(item, &mut widths);
            }
            array.widths = widths;
            array.write_header()?;

            let count = staged.len() as u64;
            let mut staged = staged.into_iter();
            array.append_with(count, |_, _| {
                staged
                    .next()
                    .ok_or_else(|| IoCollError::Storage("staged values ran out".to_string()))
            })?;
            Ok(array)
        })
    }

    /// Open an existing array; a never-written chunk opens as empty
    pub fn open(storage: &Storage, ptr: ChunkPtr, config: &Config) -> Result<Self> {
        let layout = T::storage();
        let fields = layout.field_count();
        let mut array = Self {
            storage: storage.clone(),
            ptr,
            layout,
            widths: vec![NumberSize::Void; fields],
            len: 0,
            staging_bytes: config.staging_buffer_bytes.max(1),
            defrag_chain_limit: config.defrag_chain_limit,
            defrag_step_budget: config.defrag_step_budget,
            _marker: PhantomData,
        };

        if storage.size(ptr)? == 0 {
            array.write_header()?;
            return Ok(array);
        }

        array.reload_header()?;

        let needed = array.offset(array.len);
        if storage.size(ptr)? < needed {
            return Err(IoCollError::Corruption(format!(
                "array {} claims {} elements but holds {} bytes",
                ptr,
                array.len,
                storage.size(ptr)?
            )));
        }
        Ok(array)
    }

    // =========================================================================
    // Shape
    // =========================================================================

    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Negotiated widths of the variable fields
    pub fn widths(&self) -> &[NumberSize] {
        &self.widths
    }

    pub fn layout(&self) -> ValueStorage {
        self.layout
    }

    /// Bytes per element with the current widths
    pub fn element_width(&self) -> usize {
        self.layout.element_width(&self.widths)
    }

    /// Capacity in elements without further growth
    pub fn capacity(&self) -> Result<u64> {
        let cap = self.storage.capacity(self.ptr)?;
        let width = self.element_width().max(1) as u64;
        Ok(cap.saturating_sub(self.header_size()) / width)
    }

    // =========================================================================
    // Element Access
    // =========================================================================

    pub fn get(&self, index: u64) -> Result<T> {
        self.check_index(index)?;
        let mut buf = vec![0u8; self.element_width()];
        self.storage.read_exact(self.ptr, self.offset(index), &mut buf)?;
        let mut input = &buf[..];
        self.decode(&mut input)
    }

    /// Elements in `range`, read with one storage call
    pub fn get_many(&self, range: Range<u64>) -> Result<Vec<T>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        if range.end > self.len {
            return Err(IoCollError::IndexOutOfBounds {
                index: range.end - 1,
                len: self.len,
            });
        }
        let width = self.element_width();
        let count = (range.end - range.start) as usize;
        let mut buf = vec![0u8; count * width];
        self.storage
            .read_exact(self.ptr, self.offset(range.start), &mut buf)?;

        let mut input = &buf[..];
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.decode(&mut input)?);
        }
        Ok(values)
    }

    pub fn last(&self) -> Result<Option<T>> {
        if self.len == 0 {
            return Ok(None);
        }
        self.get(self.len - 1).map(Some)
    }

    /// Overwrite the element at `index`
    pub fn set(&mut self, index: u64, value: T) -> Result<()> {
        self.check_index(index)?;
        let storage = self.storage.clone();
        self.mutate(|array| {
            let old = array.payload_at(index)?;
            let staged = array.stage(value)?;
            array.write_staged(index, &staged)?;
            if let Some(old) = old {
                storage.free(old)?;
            }
            Ok(())
        })
    }

    /// Append; returns the new element's index
    pub fn add(&mut self, value: T) -> Result<u64> {
        let index = self.mutate(|array| {
            let staged = array.stage(value)?;
            let index = array.len;
            array.write_staged(index, &staged)?;
            array.len += 1;
            array.write_count()?;
            Ok(index)
        })?;
        self.maybe_defrag()?;
        Ok(index)
    }

    /// Insert at `index`, shifting later elements up
    pub fn insert(&mut self, index: u64, value: T) -> Result<()> {
        if index > self.len {
            return Err(IoCollError::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        self.mutate(|array| {
            let staged = array.stage(value)?;
            array.forward_dup(index)?;
            array.len += 1;
            array.write_count()?;
            array.write_staged(index, &staged)
        })?;
        self.maybe_defrag()
    }

    /// Remove at `index`, shifting later elements down
    pub fn remove(&mut self, index: u64) -> Result<T> {
        let value = self.get(index)?;
        let storage = self.storage.clone();
        self.mutate(|array| {
            let payload = array.payload_at(index)?;
            array.squash(index)?;
            array.len -= 1;
            array.write_count()?;
            storage.set_size(array.ptr, array.offset(array.len))?;
            if let Some(payload) = payload {
                storage.free(payload)?;
            }
            Ok(())
        })?;
        Ok(value)
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        if self.len == 0 {
            return Ok(None);
        }
        self.remove(self.len - 1).map(Some)
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Make room for `count` elements without reallocating
    pub fn request_capacity(&mut self, count: u64) -> Result<()> {
        let bytes = self.offset(count);
        self.storage.ensure_capacity(self.ptr, bytes)
    }

    /// Release capacity beyond the current elements
    pub fn trim(&mut self) -> Result<()> {
        let bytes = self.offset(self.len);
        self.storage.set_capacity(self.ptr, bytes)
    }

    /// Drop every element (and reference payload)
    pub fn clear(&mut self) -> Result<()> {
        let storage = self.storage.clone();
        self.mutate(|array| {
            for payload in array.payloads()? {
                storage.free(payload)?;
            }
            array.len = 0;
            array.write_count()?;
            storage.set_size(array.ptr, array.header_size())
        })
    }

    /// Release the array chunk and every payload it owns
    pub fn free(self) -> Result<()> {
        let storage = self.storage.clone();
        storage.transaction(|| {
            for payload in self.payloads()? {
                storage.free(payload)?;
            }
            storage.free(self.ptr)
        })
    }

    pub fn iter(&self) -> ArrayIter<'_, T> {
        ArrayIter {
            array: self,
            next: 0,
            end: self.len,
            buffer: VecDeque::new(),
        }
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn header_size(&self) -> u64 {
        COUNT_SIZE + self.widths.len() as u64
    }

    fn offset(&self, index: u64) -> u64 {
        self.header_size() + index * self.element_width() as u64
    }

    /// Elements per staging window
    fn window(&self) -> u64 {
        (self.staging_bytes / self.element_width().max(1)).max(1) as u64
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.len {
            return Err(IoCollError::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.header_size() as usize);
        buf.put_u64_le(self.len);
        for width in &self.widths {
            buf.put_u8(width.tag());
        }
        self.storage.write(self.ptr, 0, &buf)
    }

    fn write_count(&mut self) -> Result<()> {
        self.storage.write(self.ptr, 0, &self.len.to_le_bytes())
    }

    fn reload_header(&mut self) -> Result<()> {
        let mut header = vec![0u8; self.header_size() as usize];
        self.storage.read_exact(self.ptr, 0, &mut header)?;
        self.len = NumberSize::Long.read_slice(&header[..COUNT_SIZE as usize])?;
        for (width, tag) in self.widths.iter_mut().zip(&header[COUNT_SIZE as usize..]) {
            *width = NumberSize::from_tag(*tag)?;
        }
        Ok(())
    }

    /// Run `f` in a transaction. Once an outermost transaction has rolled
    /// back, the cached count and widths are reloaded from the store.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let storage = self.storage.clone();
        let result = storage.transaction(|| f(self));
        if result.is_err() && storage.transaction_depth() == 0 {
            self.reload_header()?;
        }
        result
    }

    pub(crate) fn stage(&self, value: T) -> Result<Staged<T>> {
        if !matches!(self.layout, ValueStorage::Reference) {
            return Ok(Staged::Value(value));
        }
        if value.is_null() {
            return Ok(Staged::Pointer(ChunkPtr::NULL));
        }
        let payload = to_inline(&value);
        let ptr = self
            .storage
            .allocate(payload.len() as u64, Some(self.ptr))?;
        self.storage.write(ptr, 0, &payload)?;
        Ok(Staged::Pointer(ptr))
    }

    pub(crate) fn encode_staged(
        &self,
        staged: &Staged<T>,
        widths: &[NumberSize],
        out: &mut BytesMut,
    ) -> Result<()> {
        match staged {
            Staged::Value(value) => value.encode_element(widths, out),
            Staged::Pointer(ptr) => widths[0].write(ptr.get(), out),
        }
    }

    pub(crate) fn raise_widths(&self, staged: &Staged<T>, widths: &mut [NumberSize]) {
        match staged {
            Staged::Value(value) => value.required_widths(widths),
            Staged::Pointer(ptr) => widths[0] = widths[0].max(NumberSize::fitting(ptr.get())),
        }
    }

    fn decode(&self, input: &mut &[u8]) -> Result<T> {
        match self.layout {
            ValueStorage::Reference => {
                let ptr = ChunkPtr::new(self.widths[0].read(input)?);
                if ptr.is_null() {
                    return T::null().ok_or_else(|| {
                        IoCollError::Corruption(format!(
                            "array {} holds a null reference for a non-nullable type",
                            self.ptr
                        ))
                    });
                }
                from_inline(&self.storage.read_from(ptr, 0)?)
            }
            _ => T::decode_element(&self.widths, input),
        }
    }

    /// Encode and write one element, migrating to wider fields if it does not fit
    fn write_staged(&mut self, index: u64, staged: &Staged<T>) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.element_width());
        if let Err(e) = self.encode_staged(staged, &self.widths, &mut buf) {
            if !e.is_width_overflow() {
                return Err(e);
            }
            let mut target = self.widths.clone();
            self.raise_widths(staged, &mut target);
            self.migrate(target)?;
            buf.clear();
            self.encode_staged(staged, &self.widths, &mut buf)
                .map_err(no_wider_size)?;
        }
        self.storage.write(self.ptr, self.offset(index), &buf)
    }

    /// Payload chunk owned by the element at `index` (reference layout only)
    fn payload_at(&self, index: u64) -> Result<Option<ChunkPtr>> {
        if !matches!(self.layout, ValueStorage::Reference) {
            return Ok(None);
        }
        let mut buf = [0u8; 8];
        let field = &mut buf[..self.widths[0].bytes()];
        self.storage.read_exact(self.ptr, self.offset(index), field)?;
        Ok(ChunkPtr::new(self.widths[0].read_slice(field)?).non_null())
    }

    /// Every payload chunk owned by the array
    fn payloads(&self) -> Result<Vec<ChunkPtr>> {
        if !matches!(self.layout, ValueStorage::Reference) || self.len == 0 {
            return Ok(Vec::new());
        }
        let width = self.widths[0];
        let mut payloads = Vec::new();
        let mut start = 0;
        while start < self.len {
            let end = (start + self.window()).min(self.len);
            let mut buf = vec![0u8; (end - start) as usize * width.bytes()];
            self.storage.read_exact(self.ptr, self.offset(start), &mut buf)?;
            for raw in buf.chunks(width.bytes().max(1)) {
                if let Some(ptr) = ChunkPtr::new(width.read_slice(raw)?).non_null() {
                    payloads.push(ptr);
                }
            }
            start = end;
        }
        Ok(payloads)
    }
}

/// A width overflow that survives a migration means no wider size exists
fn no_wider_size(e: IoCollError) -> IoCollError {
    match e {
        IoCollError::WidthOverflow { required, .. } => {
            IoCollError::NoWiderSize(required.max_value())
        }
        other => other,
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Front-to-back iterator reading one staging window at a time
pub struct ArrayIter<'a, T> {
    array: &'a ContiguousArray<T>,
    next: u64,
    end: u64,
    buffer: VecDeque<T>,
}

impl<'a, T: IoValue> Iterator for ArrayIter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && self.next < self.end {
            let stop = (self.next + self.array.window()).min(self.end);
            match self.array.get_many(self.next..stop) {
                Ok(values) => {
                    self.buffer.extend(values);
                    self.next = stop;
                }
                Err(e) => {
                    self.next = self.end;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
