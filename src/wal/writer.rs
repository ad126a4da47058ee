//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::Result;

use super::{WalEntry, WalReader, WalRecord};

/// Writes entries to the WAL file
pub struct WalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    /// LSN the next append receives
    current_lsn: u64,
    sync_strategy: WalSyncStrategy,
    /// Entries appended since the last fsync
    unsynced: usize,
    size_bytes: u64,
}

impl WalWriter {
    /// Open or create a WAL file
    ///
    /// Existing entries are scanned so LSNs continue where the file left off.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let mut last_lsn = 0;
        if path.exists() {
            for entry in WalReader::open(path)?.entries() {
                match entry {
                    Ok(entry) => last_lsn = entry.lsn,
                    Err(_) => break,
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let size_bytes = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            current_lsn: last_lsn + 1,
            sync_strategy,
            unsynced: 0,
            size_bytes,
        })
    }

    /// Append a record; returns the LSN it was logged under
    pub fn append(&mut self, record: WalRecord) -> Result<u64> {
        let lsn = self.current_lsn;
        let bytes = WalEntry::new(lsn, record).serialize()?;

        self.writer.write_all(&bytes)?;
        self.size_bytes += bytes.len() as u64;
        self.current_lsn += 1;
        self.unsynced += 1;

        match self.sync_strategy {
            WalSyncStrategy::EveryWrite => self.sync()?,
            WalSyncStrategy::EveryNEntries { count } => {
                if self.unsynced >= count {
                    self.sync()?;
                }
            }
        }
        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Drop every entry (after a checkpoint); LSNs keep counting up
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        self.size_bytes = 0;
        self.unsynced = 0;
        Ok(())
    }

    /// Never hand out an LSN below `lsn` (a checkpoint may be ahead of the log)
    pub fn advance_lsn_to(&mut self, lsn: u64) {
        self.current_lsn = self.current_lsn.max(lsn);
    }

    /// Get the LSN the next append receives
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }

    /// Bytes currently in the log
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::warn!("WAL sync on drop failed: {}", e);
        }
    }
}
