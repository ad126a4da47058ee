//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{IoCollError, Result};
use crate::storage::{Block, DirtySet};

/// Entry header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// The blocks one transaction left behind
    pub record: WalRecord,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Block images written by one committed transaction
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WalRecord {
    /// End of the address space after the commit
    pub end: u64,
    /// Full images of blocks that exist after the commit
    pub blocks: Vec<(u64, Block)>,
    /// Blocks that were released
    pub freed: Vec<u64>,
    /// Root table, when it changed
    pub roots: Option<BTreeMap<String, u64>>,
}

impl From<DirtySet> for WalRecord {
    fn from(set: DirtySet) -> Self {
        Self {
            end: set.end,
            blocks: set.blocks,
            freed: set.freed,
            roots: set.roots,
        }
    }
}

impl From<WalRecord> for DirtySet {
    fn from(record: WalRecord) -> Self {
        Self {
            end: record.end,
            blocks: record.blocks,
            freed: record.freed,
            roots: record.roots,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    timestamp: u64,
    record: WalRecord,
}

impl WalEntry {
    /// Create an entry stamped with the current time
    pub fn new(lsn: u64, record: WalRecord) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            lsn,
            record,
            timestamp,
        }
    }

    /// Frame the entry: header followed by the bincode payload
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&Payload {
            timestamp: self.timestamp,
            record: self.record.clone(),
        })?;
        if payload.len() > u32::MAX as usize {
            return Err(IoCollError::Serialization(format!(
                "WAL record too large: {} bytes",
                payload.len()
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&Self::compute_crc(&payload).to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Parse one framed entry; returns the entry and the bytes consumed
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < HEADER_SIZE {
            return Err(IoCollError::WalCorruption(format!(
                "incomplete header: {} bytes",
                bytes.len()
            )));
        }
        let (lsn, crc, len) = Self::parse_header(&bytes[..HEADER_SIZE]);
        let total = HEADER_SIZE + len as usize;
        if bytes.len() < total {
            return Err(IoCollError::WalCorruption(format!(
                "incomplete payload: expected {} bytes, got {}",
                len,
                bytes.len() - HEADER_SIZE
            )));
        }
        let entry = Self::decode_payload(lsn, crc, &bytes[HEADER_SIZE..total])?;
        Ok((entry, total))
    }

    /// Split a header into (lsn, crc, payload length)
    pub(crate) fn parse_header(header: &[u8]) -> (u64, u32, u32) {
        let mut lsn = [0u8; 8];
        let mut crc = [0u8; 4];
        let mut len = [0u8; 4];
        lsn.copy_from_slice(&header[0..8]);
        crc.copy_from_slice(&header[8..12]);
        len.copy_from_slice(&header[12..16]);
        (
            u64::from_le_bytes(lsn),
            u32::from_le_bytes(crc),
            u32::from_le_bytes(len),
        )
    }

    /// Verify the checksum and decode the payload
    pub(crate) fn decode_payload(lsn: u64, crc: u32, payload: &[u8]) -> Result<Self> {
        let actual = Self::compute_crc(payload);
        if actual != crc {
            return Err(IoCollError::WalCorruption(format!(
                "CRC mismatch at LSN {}: stored {:08x}, computed {:08x}",
                lsn, crc, actual
            )));
        }
        let payload: Payload = bincode::deserialize(payload)
            .map_err(|e| IoCollError::WalCorruption(format!("bad payload at LSN {}: {}", lsn, e)))?;
        Ok(Self {
            lsn,
            record: payload.record,
            timestamp: payload.timestamp,
        })
    }

    pub fn compute_crc(payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }
}
