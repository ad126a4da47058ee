//! Checkpoint Image
//!
//! Full snapshot of a store's blocks, written when the WAL is folded in.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (30 bytes)                                            │
//! │   Magic: "IOCL" (4) | Version: u16 (2) | LastLsn: u64 (8)    │
//! │   End: u64 (8) | BlockCount: u64 (8)                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Body (variable)                                              │
//! │   bincode { roots, blocks: [(offset, Block)] }               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Footer (12 bytes)                                            │
//! │   BodyLen: u64 (8) | BodyCRC: u32 (4)                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoCollError, Result};

use super::{Block, MemoryStore};

/// Magic bytes identifying a checkpoint image
pub const IMAGE_MAGIC: &[u8; 4] = b"IOCL";

/// Current image format version
pub const IMAGE_VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + LastLsn (8) + End (8) + BlockCount (8)
const HEADER_SIZE: usize = 30;

/// Footer size: BodyLen (8) + CRC (4)
const FOOTER_SIZE: usize = 12;

#[derive(Serialize, Deserialize)]
struct Body {
    roots: BTreeMap<String, u64>,
    blocks: Vec<(u64, Block)>,
}

/// In-memory form of a checkpoint
#[derive(Debug, Clone, Default)]
pub struct CheckpointImage {
    /// Every WAL entry up to this LSN is contained in the image
    pub last_lsn: u64,
    pub end: u64,
    pub roots: BTreeMap<String, u64>,
    pub blocks: Vec<(u64, Block)>,
}

impl CheckpointImage {
    /// Snapshot a store
    pub fn capture(store: &MemoryStore, last_lsn: u64) -> Self {
        Self {
            last_lsn,
            end: store.end(),
            roots: store.roots().clone(),
            blocks: store
                .blocks()
                .map(|(offset, block)| (*offset, block.clone()))
                .collect(),
        }
    }

    /// Rebuild the store the image was captured from
    pub fn into_store(self) -> MemoryStore {
        MemoryStore::from_blocks(self.blocks, self.end, self.roots)
    }

    /// Write the image atomically (temp file, fsync, rename)
    pub fn write(&self, path: &Path) -> Result<()> {
        let body = bincode::serialize(&Body {
            roots: self.roots.clone(),
            blocks: self.blocks.clone(),
        })?;

        let tmp_path = path.with_extension("img.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(IMAGE_MAGIC)?;
            writer.write_all(&IMAGE_VERSION.to_le_bytes())?;
            writer.write_all(&self.last_lsn.to_le_bytes())?;
            writer.write_all(&self.end.to_le_bytes())?;
            writer.write_all(&(self.blocks.len() as u64).to_le_bytes())?;

            writer.write_all(&body)?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&body);
            writer.write_all(&(body.len() as u64).to_le_bytes())?;
            writer.write_all(&hasher.finalize().to_le_bytes())?;

            let file = writer
                .into_inner()
                .map_err(|e| IoCollError::Storage(format!("Failed to flush image: {}", e)))?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Read and validate an image
    pub fn read(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(IoCollError::Corruption(format!(
                "checkpoint image too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != IMAGE_MAGIC {
            return Err(IoCollError::Corruption(format!(
                "Invalid image magic: expected IOCL, got {:?}",
                &bytes[0..4]
            )));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != IMAGE_VERSION {
            return Err(IoCollError::Corruption(format!(
                "Unsupported image version: {}",
                version
            )));
        }
        let last_lsn = u64_at(6);
        let end = u64_at(14);
        let block_count = u64_at(22);

        let footer = bytes.len() - FOOTER_SIZE;
        let body_len = u64_at(footer) as usize;
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[footer + 8..footer + 12]);
        let stored_crc = u32::from_le_bytes(crc);

        if HEADER_SIZE + body_len != footer {
            return Err(IoCollError::Corruption(format!(
                "image body length {} does not match file size {}",
                body_len,
                bytes.len()
            )));
        }
        let body = &bytes[HEADER_SIZE..footer];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(IoCollError::Corruption("image CRC mismatch".to_string()));
        }

        let body: Body = bincode::deserialize(body)?;
        if body.blocks.len() as u64 != block_count {
            return Err(IoCollError::Corruption(format!(
                "image lists {} blocks, header says {}",
                body.blocks.len(),
                block_count
            )));
        }

        Ok(Self {
            last_lsn,
            end,
            roots: body.roots,
            blocks: body.blocks,
        })
    }
}
