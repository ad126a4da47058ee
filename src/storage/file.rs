//! Durable chunk store
//!
//! A `MemoryStore` made crash-safe:
//!
//! ```text
//!   write / commit ──► MemoryStore ──► dirty blocks ──► WAL record (fsync per strategy)
//!                                                          │
//!                 checkpoint (threshold / close) ◄─────────┘
//!                      │
//!                      ▼
//!                 store.img  (then the WAL is truncated)
//! ```
//!
//! Writes outside a transaction are logged one by one; inside a transaction
//! nothing is logged until the outermost scope commits, so a crash mid-group
//! leaves no trace of it.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;
use crate::wal::{WalRecord, WalRecovery, WalWriter};

use super::{ChunkPtr, ChunkStore, CheckpointImage, MemoryStore, StorageStats};

/// Chunk store persisted under a data directory
pub struct FileStore {
    data_dir: PathBuf,
    image_path: PathBuf,
    arena: MemoryStore,
    wal: WalWriter,
    checkpoint_threshold: u64,
}

impl FileStore {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const IMAGE_FILENAME: &'static str = "store.img";
    const WAL_FILENAME: &'static str = "wal.log";

    /// Open or create a store with the given config
    ///
    /// On startup:
    /// 1. Create the data directory if needed
    /// 2. Load the last checkpoint image, if any
    /// 3. Replay WAL entries newer than the image
    /// 4. Fold recovered entries into a fresh checkpoint
    pub fn open(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let image_path = config.data_dir.join(Self::IMAGE_FILENAME);
        let wal_path = config.data_dir.join(Self::WAL_FILENAME);

        let image = if image_path.exists() {
            CheckpointImage::read(&image_path)?
        } else {
            CheckpointImage::default()
        };
        let image_lsn = image.last_lsn;
        let mut arena = image.into_store();

        let (entries, recovery) = WalRecovery::recover(&wal_path)?;
        let mut replayed = 0u64;
        for entry in entries {
            if entry.lsn > image_lsn {
                arena.apply(entry.record.into());
                replayed += 1;
            }
        }
        if recovery.entries_recovered > 0 || recovery.entries_corrupted > 0 {
            tracing::debug!(
                "WAL recovery: {} entries recovered ({} replayed), {} corrupted, last_lsn={}",
                recovery.entries_recovered,
                replayed,
                recovery.entries_corrupted,
                recovery.last_lsn
            );
        }

        let mut wal = WalWriter::open(&wal_path, config.wal_sync_strategy)?;
        wal.advance_lsn_to(image_lsn + 1);

        let mut store = Self {
            data_dir: config.data_dir.clone(),
            image_path,
            arena,
            wal,
            checkpoint_threshold: config.checkpoint_threshold,
        };

        // Recovered state goes into an image right away; the WAL starts empty
        if replayed > 0 {
            store.checkpoint()?;
        }
        Ok(store)
    }

    /// Write a full image and truncate the WAL
    pub fn checkpoint(&mut self) -> Result<()> {
        self.log_dirty()?;
        self.wal.sync()?;
        let last_lsn = self.wal.current_lsn() - 1;
        let image = CheckpointImage::capture(&self.arena, last_lsn);
        image.write(&self.image_path)?;
        self.wal.truncate()?;
        tracing::debug!(
            "checkpoint written: {} blocks, last_lsn={}",
            image.blocks.len(),
            last_lsn
        );
        Ok(())
    }

    /// Checkpoint and release the files
    pub fn close(mut self) -> Result<()> {
        self.checkpoint()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Bytes currently in the WAL
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes()
    }

    /// Log every block touched since the last record
    fn log_dirty(&mut self) -> Result<()> {
        let dirty = self.arena.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        self.wal.append(WalRecord::from(dirty))?;
        Ok(())
    }

    /// Called after every mutation
    fn after_write(&mut self) -> Result<()> {
        if self.arena.transaction_depth() > 0 {
            return Ok(());
        }
        self.log_dirty()?;
        if self.wal.size_bytes() >= self.checkpoint_threshold {
            self.checkpoint()?;
        }
        Ok(())
    }
}

impl ChunkStore for FileStore {
    fn allocate(&mut self, size_hint: u64, position_hint: Option<ChunkPtr>) -> Result<ChunkPtr> {
        let ptr = self.arena.allocate(size_hint, position_hint)?;
        self.after_write()?;
        Ok(ptr)
    }

    fn free(&mut self, ptr: ChunkPtr) -> Result<()> {
        self.arena.free(ptr)?;
        self.after_write()
    }

    fn read(&self, ptr: ChunkPtr, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.arena.read(ptr, offset, buf)
    }

    fn write(&mut self, ptr: ChunkPtr, offset: u64, data: &[u8]) -> Result<()> {
        self.arena.write(ptr, offset, data)?;
        self.after_write()
    }

    fn size(&self, ptr: ChunkPtr) -> Result<u64> {
        self.arena.size(ptr)
    }

    fn set_size(&mut self, ptr: ChunkPtr, size: u64) -> Result<()> {
        self.arena.set_size(ptr, size)?;
        self.after_write()
    }

    fn capacity(&self, ptr: ChunkPtr) -> Result<u64> {
        self.arena.capacity(ptr)
    }

    fn ensure_capacity(&mut self, ptr: ChunkPtr, capacity: u64) -> Result<()> {
        self.arena.ensure_capacity(ptr, capacity)?;
        self.after_write()
    }

    fn set_capacity(&mut self, ptr: ChunkPtr, capacity: u64) -> Result<()> {
        self.arena.set_capacity(ptr, capacity)?;
        self.after_write()
    }

    fn fragment_capacities(&self, ptr: ChunkPtr) -> Result<Vec<u64>> {
        self.arena.fragment_capacities(ptr)
    }

    fn merge_fragments(&mut self, ptr: ChunkPtr, first: usize, count: usize) -> Result<()> {
        self.arena.merge_fragments(ptr, first, count)?;
        self.after_write()
    }

    fn root(&self, name: &str) -> Option<ChunkPtr> {
        self.arena.root(name)
    }

    fn set_root(&mut self, name: &str, ptr: ChunkPtr) -> Result<()> {
        self.arena.set_root(name, ptr)?;
        self.after_write()
    }

    fn begin_transaction(&mut self) {
        self.arena.begin_transaction();
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.arena.commit_transaction()?;
        self.after_write()
    }

    fn abort_transaction(&mut self) -> Result<()> {
        self.arena.abort_transaction()?;
        if self.arena.transaction_depth() == 0 {
            // Rolled-back blocks match what is already durable
            self.arena.take_dirty();
        }
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.arena.transaction_depth()
    }

    fn stats(&self) -> StorageStats {
        self.arena.stats()
    }

    fn flush(&mut self) -> Result<()> {
        self.checkpoint()
    }
}
