//! In-memory chunk store
//!
//! Blocks live in an ordered map keyed by their offset in a flat address
//! space. Free extents are coalesced and reused first-fit, preferring space at
//! or after the caller's position hint; otherwise the address space grows at
//! its end. A chunk that cannot grow in place gets a new fragment linked onto
//! its chain, so interleaved allocations fragment chunks the way a real file
//! would.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{IoCollError, Result};

use super::{ChunkPtr, ChunkStore, StorageStats};

/// Offsets below this are never handed out, so `0` stays null
pub(crate) const FIRST_OFFSET: u64 = 64;

/// Smallest fragment ever allocated
const MIN_FRAGMENT: u64 = 16;

/// One fragment of a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Fragment bytes; the length is the fragment's capacity
    pub data: Vec<u8>,
    /// Offset of the next fragment in the chain
    pub next: Option<u64>,
    /// Whether this is the first fragment (the one a `ChunkPtr` names)
    pub head: bool,
    /// Logical size of the whole chunk (meaningful on heads only)
    pub size: u64,
}

impl Block {
    fn new(capacity: u64, head: bool) -> Self {
        Self {
            data: vec![0u8; capacity as usize],
            next: None,
            head,
            size: 0,
        }
    }

    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Blocks changed since the last `take_dirty`
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    pub end: u64,
    /// Current images of touched blocks
    pub blocks: Vec<(u64, Block)>,
    /// Offsets of touched blocks that no longer exist
    pub freed: Vec<u64>,
    /// Root table, when it changed
    pub roots: Option<BTreeMap<String, u64>>,
}

impl DirtySet {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.freed.is_empty() && self.roots.is_none()
    }
}

/// Prior state captured when the outermost transaction opened
struct Journal {
    blocks: BTreeMap<u64, Option<Block>>,
    free: BTreeMap<u64, u64>,
    end: u64,
    roots: BTreeMap<String, u64>,
}

/// Volatile chunk store
pub struct MemoryStore {
    blocks: BTreeMap<u64, Block>,
    /// Free extents: offset → length
    free: BTreeMap<u64, u64>,
    end: u64,
    roots: BTreeMap<String, u64>,
    depth: usize,
    journal: Option<Journal>,
    dirty: BTreeSet<u64>,
    dirty_roots: bool,
    committed: u64,
    aborted: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            free: BTreeMap::new(),
            end: FIRST_OFFSET,
            roots: BTreeMap::new(),
            depth: 0,
            journal: None,
            dirty: BTreeSet::new(),
            dirty_roots: false,
            committed: 0,
            aborted: 0,
        }
    }

    /// Rebuild a store from persisted blocks; free extents are the gaps
    pub fn from_blocks(
        blocks: impl IntoIterator<Item = (u64, Block)>,
        end: u64,
        roots: BTreeMap<String, u64>,
    ) -> Self {
        let mut store = Self::new();
        store.blocks = blocks.into_iter().collect();
        store.end = end.max(FIRST_OFFSET);
        store.roots = roots;
        store.rebuild_free_list();
        store
    }

    /// Every live block, for checkpointing
    pub fn blocks(&self) -> impl Iterator<Item = (&u64, &Block)> {
        self.blocks.iter()
    }

    pub fn roots(&self) -> &BTreeMap<String, u64> {
        &self.roots
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Drain the set of blocks touched since the last call
    pub fn take_dirty(&mut self) -> DirtySet {
        let mut set = DirtySet {
            end: self.end,
            ..DirtySet::default()
        };
        for offset in std::mem::take(&mut self.dirty) {
            match self.blocks.get(&offset) {
                Some(block) => set.blocks.push((offset, block.clone())),
                None => set.freed.push(offset),
            }
        }
        if std::mem::take(&mut self.dirty_roots) {
            set.roots = Some(self.roots.clone());
        }
        set
    }

    /// Replay a dirty set captured by `take_dirty` (WAL recovery)
    pub fn apply(&mut self, set: DirtySet) {
        for offset in set.freed {
            self.blocks.remove(&offset);
        }
        for (offset, block) in set.blocks {
            self.blocks.insert(offset, block);
        }
        if let Some(roots) = set.roots {
            self.roots = roots;
        }
        self.end = set.end.max(FIRST_OFFSET);
        self.rebuild_free_list();
    }

    fn rebuild_free_list(&mut self) {
        self.free.clear();
        let mut cursor = FIRST_OFFSET;
        let spans: Vec<(u64, u64)> = self
            .blocks
            .iter()
            .map(|(off, b)| (*off, b.capacity()))
            .collect();
        for (offset, capacity) in spans {
            if offset > cursor {
                self.free.insert(cursor, offset - cursor);
            }
            cursor = cursor.max(offset + capacity);
        }
        if cursor < self.end {
            self.free.insert(cursor, self.end - cursor);
        }
        self.end = self.end.max(cursor);
        self.trim_end();
    }

    // =========================================================================
    // Extent Management
    // =========================================================================

    /// Reserve `len` bytes, first-fit at or after `hint`, else anywhere, else
    /// at the end of the address space
    fn alloc_extent(&mut self, len: u64, hint: Option<u64>) -> u64 {
        let fits = |(_, l): &(&u64, &u64)| **l >= len;
        let found = hint
            .and_then(|h| self.free.range(h..).find(fits).map(|(o, l)| (*o, *l)))
            .or_else(|| self.free.iter().find(fits).map(|(o, l)| (*o, *l)));

        match found {
            Some((offset, extent)) => {
                self.free.remove(&offset);
                if extent > len {
                    self.free.insert(offset + len, extent - len);
                }
                offset
            }
            None => {
                let offset = self.end;
                self.end += len;
                offset
            }
        }
    }

    /// Return an extent to the free list, coalescing with neighbours
    fn release_extent(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = offset;
        let mut length = len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                length += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            length += next_len;
        }
        self.free.insert(start, length);
        self.trim_end();
    }

    /// Give a free extent touching the end back to the address space
    fn trim_end(&mut self) {
        if let Some((&last, &len)) = self.free.iter().next_back() {
            if last + len == self.end {
                self.free.remove(&last);
                self.end = last;
            }
        }
    }

    // =========================================================================
    // Block Access
    // =========================================================================

    /// Record a block's prior state before it changes
    fn touch(&mut self, offset: u64) {
        if let Some(journal) = self.journal.as_mut() {
            journal
                .blocks
                .entry(offset)
                .or_insert_with(|| self.blocks.get(&offset).cloned());
        }
        self.dirty.insert(offset);
    }

    fn head(&self, ptr: ChunkPtr) -> Result<&Block> {
        match self.blocks.get(&ptr.get()) {
            Some(block) if block.head => Ok(block),
            _ => Err(IoCollError::InvalidPointer(ptr.get())),
        }
    }

    fn block_mut(&mut self, offset: u64) -> Result<&mut Block> {
        self.touch(offset);
        self.blocks
            .get_mut(&offset)
            .ok_or(IoCollError::InvalidPointer(offset))
    }

    /// Offsets of every fragment in a chunk's chain, head first
    fn chain(&self, ptr: ChunkPtr) -> Result<Vec<u64>> {
        let mut offsets = vec![ptr.get()];
        let mut next = self.head(ptr)?.next;
        while let Some(offset) = next {
            let block = self
                .blocks
                .get(&offset)
                .ok_or_else(|| IoCollError::Corruption(format!("dangling fragment @{}", offset)))?;
            offsets.push(offset);
            next = block.next;
        }
        Ok(offsets)
    }

    fn total_capacity(&self, chain: &[u64]) -> u64 {
        chain
            .iter()
            .filter_map(|o| self.blocks.get(o))
            .map(Block::capacity)
            .sum()
    }

    /// Grow the last fragment in place, or link a new one
    fn grow(&mut self, ptr: ChunkPtr, needed: u64) -> Result<()> {
        let chain = self.chain(ptr)?;
        let total = self.total_capacity(&chain);
        if total >= needed {
            return Ok(());
        }
        let extra = needed - total;
        let last = *chain.last().unwrap_or(&ptr.get());
        let last_end = last + self.blocks.get(&last).map(Block::capacity).unwrap_or(0);

        // In place at the end of the address space
        if last_end == self.end {
            self.end += extra;
            let block = self.block_mut(last)?;
            block.data.resize(block.data.len() + extra as usize, 0);
            tracing::trace!("chunk {} grew in place by {} bytes", ptr, extra);
            return Ok(());
        }

        // In place into a neighbouring free extent
        if let Some(&free_len) = self.free.get(&last_end) {
            if free_len >= extra {
                self.free.remove(&last_end);
                if free_len > extra {
                    self.free.insert(last_end + extra, free_len - extra);
                }
                let block = self.block_mut(last)?;
                block.data.resize(block.data.len() + extra as usize, 0);
                tracing::trace!("chunk {} absorbed {} free bytes", ptr, extra);
                return Ok(());
            }
        }

        // New fragment, sized to amortize repeated growth
        let len = extra.max(total / 2).max(MIN_FRAGMENT);
        let offset = self.alloc_extent(len, Some(last_end));
        self.touch(offset);
        self.blocks.insert(offset, Block::new(len, false));
        self.block_mut(last)?.next = Some(offset);
        tracing::trace!("chunk {} linked fragment @{} ({} bytes)", ptr, offset, len);
        Ok(())
    }
}

impl ChunkStore for MemoryStore {
    fn allocate(&mut self, size_hint: u64, position_hint: Option<ChunkPtr>) -> Result<ChunkPtr> {
        let len = size_hint.max(MIN_FRAGMENT);
        let offset = self.alloc_extent(len, position_hint.map(ChunkPtr::get));
        self.touch(offset);
        self.blocks.insert(offset, Block::new(len, true));
        Ok(ChunkPtr::new(offset))
    }

    fn free(&mut self, ptr: ChunkPtr) -> Result<()> {
        for offset in self.chain(ptr)? {
            self.touch(offset);
            if let Some(block) = self.blocks.remove(&offset) {
                self.release_extent(offset, block.capacity());
            }
        }
        Ok(())
    }

    fn read(&self, ptr: ChunkPtr, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.head(ptr)?.size;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(size - offset) as usize;

        let mut copied = 0usize;
        let mut base = 0u64;
        for fragment in self.chain(ptr)? {
            let block = &self.blocks[&fragment];
            let cap = block.capacity();
            let pos = offset + copied as u64;
            if pos < base + cap {
                let start = (pos - base) as usize;
                let n = (cap as usize - start).min(wanted - copied);
                buf[copied..copied + n].copy_from_slice(&block.data[start..start + n]);
                copied += n;
                if copied == wanted {
                    break;
                }
            }
            base += cap;
        }
        Ok(copied)
    }

    fn write(&mut self, ptr: ChunkPtr, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        self.grow(ptr, end)?;

        let mut written = 0usize;
        let mut base = 0u64;
        for fragment in self.chain(ptr)? {
            if written == data.len() {
                break;
            }
            let cap = self.blocks[&fragment].capacity();
            let pos = offset + written as u64;
            if pos < base + cap {
                let start = (pos - base) as usize;
                let n = (cap as usize - start).min(data.len() - written);
                let block = self.block_mut(fragment)?;
                block.data[start..start + n].copy_from_slice(&data[written..written + n]);
                written += n;
            }
            base += cap;
        }

        let head = self.block_mut(ptr.get())?;
        head.size = head.size.max(end);
        Ok(())
    }

    fn size(&self, ptr: ChunkPtr) -> Result<u64> {
        Ok(self.head(ptr)?.size)
    }

    fn set_size(&mut self, ptr: ChunkPtr, size: u64) -> Result<()> {
        let old = self.head(ptr)?.size;
        if size > old {
            self.grow(ptr, size)?;
        } else if size < old {
            // Zero the cut tail so a later extension never resurrects it
            let mut base = 0u64;
            for fragment in self.chain(ptr)? {
                let cap = self.blocks[&fragment].capacity();
                let lo = size.max(base);
                let hi = old.min(base + cap);
                if lo < hi {
                    let block = self.block_mut(fragment)?;
                    block.data[(lo - base) as usize..(hi - base) as usize].fill(0);
                }
                base += cap;
            }
        }
        self.block_mut(ptr.get())?.size = size;
        Ok(())
    }

    fn capacity(&self, ptr: ChunkPtr) -> Result<u64> {
        let chain = self.chain(ptr)?;
        Ok(self.total_capacity(&chain))
    }

    fn ensure_capacity(&mut self, ptr: ChunkPtr, capacity: u64) -> Result<()> {
        self.grow(ptr, capacity)
    }

    fn set_capacity(&mut self, ptr: ChunkPtr, capacity: u64) -> Result<()> {
        let chain = self.chain(ptr)?;
        let total = self.total_capacity(&chain);
        if capacity >= total {
            return self.grow(ptr, capacity);
        }
        if self.head(ptr)?.size > capacity {
            self.set_size(ptr, capacity)?;
        }

        let mut base = 0u64;
        let mut keep_last: Option<u64> = None;
        for (index, fragment) in chain.iter().copied().enumerate() {
            let cap = self.blocks[&fragment].capacity();
            if keep_last.is_some() {
                // Past the cut: release the whole fragment
                self.touch(fragment);
                self.blocks.remove(&fragment);
                self.release_extent(fragment, cap);
            } else if base + cap >= capacity || index == chain.len() - 1 {
                // The cut lands in this fragment; heads keep at least one byte
                let min_keep = if index == 0 { 1 } else { 0 };
                let keep = (capacity - base).max(min_keep);
                if keep == 0 {
                    self.touch(fragment);
                    self.blocks.remove(&fragment);
                    self.release_extent(fragment, cap);
                    if let Some(&prev) = chain.get(index.wrapping_sub(1)) {
                        self.block_mut(prev)?.next = None;
                    }
                } else {
                    let block = self.block_mut(fragment)?;
                    block.data.truncate(keep as usize);
                    block.next = None;
                    self.release_extent(fragment + keep, cap - keep);
                }
                keep_last = Some(fragment);
            }
            base += cap;
        }
        Ok(())
    }

    fn fragment_capacities(&self, ptr: ChunkPtr) -> Result<Vec<u64>> {
        Ok(self
            .chain(ptr)?
            .iter()
            .map(|o| self.blocks[o].capacity())
            .collect())
    }

    fn merge_fragments(&mut self, ptr: ChunkPtr, first: usize, count: usize) -> Result<()> {
        let chain = self.chain(ptr)?;
        if first == 0 || count < 2 || first + count > chain.len() {
            return Err(IoCollError::Storage(format!(
                "cannot merge fragments {}..{} of a {}-fragment chain",
                first,
                first + count,
                chain.len()
            )));
        }
        let run = &chain[first..first + count];
        let mut data = Vec::new();
        for offset in run {
            data.extend_from_slice(&self.blocks[offset].data);
        }
        let tail_next = self.blocks[&run[count - 1]].next;

        let prev = chain[first - 1];
        let prev_end = prev + self.blocks[&prev].capacity();
        let merged = self.alloc_extent(data.len() as u64, Some(prev_end));
        self.touch(merged);
        self.blocks.insert(
            merged,
            Block {
                data,
                next: tail_next,
                head: false,
                size: 0,
            },
        );
        self.block_mut(prev)?.next = Some(merged);

        for offset in run.iter().copied() {
            self.touch(offset);
            if let Some(block) = self.blocks.remove(&offset) {
                self.release_extent(offset, block.capacity());
            }
        }
        tracing::debug!("chunk {} merged {} fragments into @{}", ptr, count, merged);
        Ok(())
    }

    fn root(&self, name: &str) -> Option<ChunkPtr> {
        self.roots.get(name).map(|&p| ChunkPtr::new(p))
    }

    fn set_root(&mut self, name: &str, ptr: ChunkPtr) -> Result<()> {
        if ptr.is_null() {
            self.roots.remove(name);
        } else {
            self.roots.insert(name.to_string(), ptr.get());
        }
        self.dirty_roots = true;
        Ok(())
    }

    fn begin_transaction(&mut self) {
        if self.depth == 0 {
            self.journal = Some(Journal {
                blocks: BTreeMap::new(),
                free: self.free.clone(),
                end: self.end,
                roots: self.roots.clone(),
            });
        }
        self.depth += 1;
    }

    fn commit_transaction(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(IoCollError::Storage("commit without transaction".to_string()));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.journal = None;
            self.committed += 1;
        }
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(IoCollError::Storage("abort without transaction".to_string()));
        }
        // Inner scopes defer to the outermost one
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        if let Some(journal) = self.journal.take() {
            for (offset, prior) in journal.blocks {
                self.dirty.insert(offset);
                match prior {
                    Some(block) => {
                        self.blocks.insert(offset, block);
                    }
                    None => {
                        self.blocks.remove(&offset);
                    }
                }
            }
            self.free = journal.free;
            self.end = journal.end;
            if self.roots != journal.roots {
                self.roots = journal.roots;
                self.dirty_roots = true;
            }
        }
        self.aborted += 1;
        tracing::debug!("transaction rolled back");
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.depth
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            chunks: self.blocks.values().filter(|b| b.head).count() as u64,
            fragments: self.blocks.len() as u64,
            allocated_bytes: self.blocks.values().map(Block::capacity).sum(),
            free_bytes: self.free.values().sum(),
            end: self.end,
            transactions_committed: self.committed,
            transactions_aborted: self.aborted,
        }
    }
}
