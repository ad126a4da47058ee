//! Storage Module
//!
//! The block-oriented backing store every collection lives in.
//!
//! ## Responsibilities
//! - Allocate and free chunks (byte ranges addressed by a `ChunkPtr`)
//! - Random-access reads and writes inside a chunk, growing it on demand
//! - Chain extra fragments onto a chunk when it cannot grow in place
//! - Group writes into transactions that apply all-or-nothing
//!
//! ## Chunk Layout
//! ```text
//!   ChunkPtr ──► ┌────────────────┐     ┌────────────┐     ┌────────────┐
//!                │ head fragment  │ ──► │ fragment 1 │ ──► │ fragment 2 │
//!                │ (logical size) │     └────────────┘     └────────────┘
//!                └────────────────┘
//!   logical bytes:  [0 ............ cap0)[cap0 ..... cap0+cap1)[ ... )
//! ```
//! Callers only ever see one contiguous logical byte range per chunk; the
//! fragment chain is the store's business, apart from `merge_fragments`
//! which lets owners defragment long chains.

mod arena;
mod file;
mod image;

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{IoCollError, Result};

pub use arena::{Block, DirtySet, MemoryStore};
pub use file::FileStore;
pub use image::{CheckpointImage, IMAGE_MAGIC, IMAGE_VERSION};

// =============================================================================
// ChunkPtr
// =============================================================================

/// Opaque address of a chunk inside a store (`0` is null)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ChunkPtr(u64);

impl ChunkPtr {
    pub const NULL: ChunkPtr = ChunkPtr(0);

    pub const fn new(raw: u64) -> Self {
        ChunkPtr(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for the null pointer
    pub fn non_null(self) -> Option<ChunkPtr> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for ChunkPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

// =============================================================================
// Storage Provider Contract
// =============================================================================

/// Counters describing a store's current shape
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Live chunks (head fragments)
    pub chunks: u64,
    /// Live fragments, heads included
    pub fragments: u64,
    /// Bytes held by live fragments
    pub allocated_bytes: u64,
    /// Bytes in free extents below the end of the address space
    pub free_bytes: u64,
    /// End of the used address space
    pub end: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
}

/// The storage provider every collection is written against
///
/// Implementations own allocation, fragment chaining and durability. Reads past
/// a chunk's logical size are short (end-of-data), never an error.
pub trait ChunkStore: Send {
    /// Allocate a chunk with at least `size_hint` bytes of capacity, near
    /// `position_hint` when possible
    fn allocate(&mut self, size_hint: u64, position_hint: Option<ChunkPtr>) -> Result<ChunkPtr>;

    /// Release a chunk and every fragment chained to it
    fn free(&mut self, ptr: ChunkPtr) -> Result<()>;

    /// Read from `offset`; returns the bytes read (short at end-of-data)
    fn read(&self, ptr: ChunkPtr, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write at `offset`, growing capacity and logical size as needed
    fn write(&mut self, ptr: ChunkPtr, offset: u64, data: &[u8]) -> Result<()>;

    /// Logical size (highest byte written)
    fn size(&self, ptr: ChunkPtr) -> Result<u64>;

    /// Set the logical size; bytes past a shrunk size read back as zero later
    fn set_size(&mut self, ptr: ChunkPtr, size: u64) -> Result<()>;

    /// Total capacity over all fragments
    fn capacity(&self, ptr: ChunkPtr) -> Result<u64>;

    fn ensure_capacity(&mut self, ptr: ChunkPtr, capacity: u64) -> Result<()>;

    /// Grow or shrink capacity, releasing trailing fragments on shrink
    fn set_capacity(&mut self, ptr: ChunkPtr, capacity: u64) -> Result<()>;

    /// Capacity of each fragment, head first
    fn fragment_capacities(&self, ptr: ChunkPtr) -> Result<Vec<u64>>;

    /// Replace `count` fragments starting at index `first` (never the head)
    /// with one fragment holding the same bytes
    fn merge_fragments(&mut self, ptr: ChunkPtr, first: usize, count: usize) -> Result<()>;

    /// Named root pointer, persisted with the store
    fn root(&self, name: &str) -> Option<ChunkPtr>;

    fn set_root(&mut self, name: &str, ptr: ChunkPtr) -> Result<()>;

    /// Open a (possibly nested) transaction scope
    fn begin_transaction(&mut self);

    /// Close a scope; the outermost commit makes the group durable
    fn commit_transaction(&mut self) -> Result<()>;

    /// Close a scope after a failure; the outermost abort rolls the group back
    fn abort_transaction(&mut self) -> Result<()>;

    fn transaction_depth(&self) -> usize;

    fn stats(&self) -> StorageStats;

    /// Push everything to durable media (no-op for volatile stores)
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Shared Handle
// =============================================================================

/// Cloneable handle to a store, shared by every collection built on it
///
/// ## Concurrency:
/// - The store sits behind a parking_lot Mutex, locked per call
/// - Collections assume a single logical writer; the lock only keeps the
///   store itself consistent
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Mutex<Box<dyn ChunkStore>>>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("stats", &self.stats()).finish()
    }
}

impl Storage {
    /// Wrap any store implementation
    pub fn new(store: impl ChunkStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    /// Volatile in-memory store
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Durable store under `config.data_dir`
    pub fn file(config: &Config) -> Result<Self> {
        Ok(Self::new(FileStore::open(config)?))
    }

    pub fn allocate(&self, size_hint: u64, position_hint: Option<ChunkPtr>) -> Result<ChunkPtr> {
        self.inner.lock().allocate(size_hint, position_hint)
    }

    pub fn free(&self, ptr: ChunkPtr) -> Result<()> {
        self.inner.lock().free(ptr)
    }

    pub fn read(&self, ptr: ChunkPtr, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().read(ptr, offset, buf)
    }

    /// Read exactly `buf.len()` bytes; a short read means corruption
    pub fn read_exact(&self, ptr: ChunkPtr, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read(ptr, offset, buf)?;
        if n < buf.len() {
            return Err(IoCollError::Corruption(format!(
                "chunk {} ends at {} (wanted {} bytes at {})",
                ptr,
                offset + n as u64,
                buf.len(),
                offset
            )));
        }
        Ok(())
    }

    /// Everything from `offset` to the logical end
    pub fn read_from(&self, ptr: ChunkPtr, offset: u64) -> Result<Vec<u8>> {
        let store = self.inner.lock();
        let size = store.size(ptr)?;
        let mut buf = vec![0u8; size.saturating_sub(offset) as usize];
        let n = store.read(ptr, offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, ptr: ChunkPtr, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.lock().write(ptr, offset, data)
    }

    pub fn size(&self, ptr: ChunkPtr) -> Result<u64> {
        self.inner.lock().size(ptr)
    }

    pub fn set_size(&self, ptr: ChunkPtr, size: u64) -> Result<()> {
        self.inner.lock().set_size(ptr, size)
    }

    pub fn capacity(&self, ptr: ChunkPtr) -> Result<u64> {
        self.inner.lock().capacity(ptr)
    }

    pub fn ensure_capacity(&self, ptr: ChunkPtr, capacity: u64) -> Result<()> {
        self.inner.lock().ensure_capacity(ptr, capacity)
    }

    pub fn set_capacity(&self, ptr: ChunkPtr, capacity: u64) -> Result<()> {
        self.inner.lock().set_capacity(ptr, capacity)
    }

    pub fn fragment_capacities(&self, ptr: ChunkPtr) -> Result<Vec<u64>> {
        self.inner.lock().fragment_capacities(ptr)
    }

    pub fn fragment_count(&self, ptr: ChunkPtr) -> Result<usize> {
        Ok(self.fragment_capacities(ptr)?.len())
    }

    pub fn merge_fragments(&self, ptr: ChunkPtr, first: usize, count: usize) -> Result<()> {
        self.inner.lock().merge_fragments(ptr, first, count)
    }

    pub fn root(&self, name: &str) -> Option<ChunkPtr> {
        self.inner.lock().root(name)
    }

    pub fn set_root(&self, name: &str, ptr: ChunkPtr) -> Result<()> {
        self.inner.lock().set_root(name, ptr)
    }

    pub fn stats(&self) -> StorageStats {
        self.inner.lock().stats()
    }

    pub fn transaction_depth(&self) -> usize {
        self.inner.lock().transaction_depth()
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    /// Run `f` inside a transaction scope
    ///
    /// Nested calls join the outermost scope. The outermost scope commits when
    /// `f` returns `Ok` and rolls every write of the group back on `Err`.
    pub fn transaction<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.inner.lock().begin_transaction();
        match f() {
            Ok(value) => {
                self.inner.lock().commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                self.inner.lock().abort_transaction()?;
                Err(e)
            }
        }
    }

    /// Random-access view over one chunk
    pub fn open(&self, ptr: ChunkPtr) -> ChunkIo {
        ChunkIo {
            storage: self.clone(),
            ptr,
            pos: 0,
        }
    }
}

// =============================================================================
// Random Access View
// =============================================================================

/// Cursor over a single chunk implementing `Read`, `Write` and `Seek`
pub struct ChunkIo {
    storage: Storage,
    ptr: ChunkPtr,
    pos: u64,
}

impl ChunkIo {
    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Read at the cursor, advancing it by the bytes read
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.storage.read(self.ptr, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes at the cursor
    pub fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.storage.read_exact(self.ptr, self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Everything from the cursor to the logical end
    pub fn read_rest(&mut self) -> Result<Vec<u8>> {
        let bytes = self.storage.read_from(self.ptr, self.pos)?;
        self.pos += bytes.len() as u64;
        Ok(bytes)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.storage.write(self.ptr, self.pos, data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        self.storage.size(self.ptr)
    }

    /// Cut the logical size at the cursor
    pub fn truncate_here(&mut self) -> Result<()> {
        self.storage.set_size(self.ptr, self.pos)
    }

    pub fn ensure_capacity(&mut self, capacity: u64) -> Result<()> {
        self.storage.ensure_capacity(self.ptr, capacity)
    }

    pub fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        self.storage.set_capacity(self.ptr, capacity)
    }
}

fn to_io_error(e: IoCollError) -> io::Error {
    match e {
        IoCollError::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl Read for ChunkIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(to_io_error)
    }
}

impl Write for ChunkIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ChunkIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self
                .size()
                .map_err(to_io_error)?
                .checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of chunk",
            )),
        }
    }
}
