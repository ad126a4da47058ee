//! WAL Recovery
//!
//! Handles crash recovery by replaying the WAL.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::{IoCollError, Result};

use super::{WalEntry, WalReader};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries skipped
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the WAL was truncated (partial writes removed)
    pub was_truncated: bool,
}

struct Scan {
    entries: Vec<WalEntry>,
    result: RecoveryResult,
    valid_len: u64,
    file_len: u64,
}

impl WalRecovery {
    /// Recover entries from a WAL file
    ///
    /// This will:
    /// 1. Read all valid entries
    /// 2. Stop at the first torn or corrupted entry (nothing after it can be
    ///    framed reliably); only checksum failures count as corrupted
    /// 3. Truncate the file to the last valid entry
    /// 4. Return all valid entries in order
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        if !path.exists() {
            return Ok((Vec::new(), RecoveryResult::default()));
        }
        let mut scan = Self::scan(path)?;

        if scan.valid_len < scan.file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
            scan.result.was_truncated = true;
            tracing::warn!(
                "WAL truncated from {} to {} bytes ({} corrupted entries dropped)",
                scan.file_len,
                scan.valid_len,
                scan.result.entries_corrupted
            );
        }
        Ok((scan.entries, scan.result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        if !path.exists() {
            return Ok(RecoveryResult::default());
        }
        let scan = Self::scan(path)?;
        let mut result = scan.result;
        // Reports whether `recover` would truncate
        result.was_truncated = scan.valid_len < scan.file_len;
        Ok(result)
    }

    fn scan(path: &Path) -> Result<Scan> {
        let mut reader = WalReader::open(path)?;
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    result.entries_recovered += 1;
                    result.last_lsn = entry.lsn;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(IoCollError::WalCorruption(reason)) => {
                    tracing::debug!("WAL scan stopped: {}", reason);
                    if !reader.is_torn() {
                        result.entries_corrupted += 1;
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Scan {
            entries,
            result,
            valid_len: reader.position(),
            file_len: reader.file_len(),
        })
    }
}
