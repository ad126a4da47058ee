//! WAL Reader
//!
//! Handles reading entries from the WAL file.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{IoCollError, Result};

use super::{WalEntry, HEADER_SIZE};

/// Reads entries from the WAL file
pub struct WalReader {
    reader: BufReader<File>,
    /// Offset of the next unread entry
    position: u64,
    file_len: u64,
    /// Set when the last error was an incomplete frame rather than a bad checksum
    torn: bool,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            file_len,
            torn: false,
        })
    }

    /// Read the next entry from the WAL
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: a complete, checksummed entry
    /// - `Ok(None)`: clean end of file
    /// - `Err(WalCorruption)`: torn tail or checksum mismatch
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if self.position == self.file_len {
            return Ok(None);
        }
        if self.position + HEADER_SIZE as u64 > self.file_len {
            self.torn = true;
            return Err(IoCollError::WalCorruption(format!(
                "partial header at offset {}",
                self.position
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header)?;
        let (lsn, crc, len) = WalEntry::parse_header(&header);

        let end = self.position + HEADER_SIZE as u64 + len as u64;
        if end > self.file_len {
            self.torn = true;
            return Err(IoCollError::WalCorruption(format!(
                "partial entry at offset {}: needs {} bytes, file has {}",
                self.position,
                end - self.position,
                self.file_len - self.position
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        let entry = WalEntry::decode_payload(lsn, crc, &payload)?;
        self.position = end;
        Ok(Some(entry))
    }

    /// Offset just past the last entry read successfully
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Whether reading stopped at a partially written frame
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    /// Iterate over entries until the end or the first bad entry
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
