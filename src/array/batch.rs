//! Batched array operations
//!
//! Everything here moves many elements at once through a staging buffer of
//! `staging_buffer_bytes`, so no operation holds the whole array in memory.
//!
//! ## Width Migration
//! ```text
//!   old:  [hdr][a][b][c][d]            (element width w)
//!   new:  [hdr][ a ][ b ][ c ][ d ]    (element width w' > w)
//!                          └─window─┘  written first
//! ```
//! Windows are re-encoded back to front in place. A window `[s, e)` lands on
//! bytes `[s*w', e*w')`, which never overlap the unread old bytes `[0, s*w)`,
//! so the chunk pointer stays valid through the whole migration.

use bytes::BytesMut;

use crate::codec::{IoValue, NumberSize, ValueStorage};
use crate::error::Result;

use super::{no_wider_size, ContiguousArray, Staged};

impl<T: IoValue> ContiguousArray<T> {
    /// Append `count` values produced by `supplier`
    ///
    /// Values are staged and written one buffer at a time; each flush commits
    /// its own transaction and updates the element count.
    pub fn add_many(&mut self, count: u64, mut supplier: impl FnMut(u64) -> T) -> Result<()> {
        self.append_with(count, |array, index| array.stage(supplier(index)))
    }

    /// Staging loop shared by `add_many` and `from_values`
    pub(crate) fn append_with(
        &mut self,
        count: u64,
        mut next: impl FnMut(&Self, u64) -> Result<Staged<T>>,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.staging_bytes);
        let mut pending = 0u64;

        for index in 0..count {
            let staged = next(self, index)?;
            loop {
                let mark = buf.len();
                match self.encode_staged(&staged, &self.widths, &mut buf) {
                    Ok(()) => {
                        pending += 1;
                        break;
                    }
                    Err(e) if e.is_width_overflow() => {
                        // Flush what fits the old widths, widen, retry this value
                        buf.truncate(mark);
                        self.flush_staging(&mut buf, &mut pending)?;
                        let mut target = self.widths.clone();
                        self.raise_widths(&staged, &mut target);
                        if target == self.widths {
                            return Err(no_wider_size(e));
                        }
                        self.migrate(target)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            if buf.len() >= self.staging_bytes {
                self.flush_staging(&mut buf, &mut pending)?;
            }
        }
        self.flush_staging(&mut buf, &mut pending)
    }

    fn flush_staging(&mut self, buf: &mut BytesMut, pending: &mut u64) -> Result<()> {
        if *pending == 0 {
            return Ok(());
        }
        let count = *pending;
        let bytes = &buf[..];
        self.mutate(|array| {
            if !bytes.is_empty() {
                array.storage.write(array.ptr, array.offset(array.len), bytes)?;
            }
            array.len += count;
            array.write_count()
        })?;
        buf.clear();
        *pending = 0;
        self.maybe_defrag()
    }

    /// Re-encode every element with wider fields, in place
    pub(crate) fn migrate(&mut self, target: Vec<NumberSize>) -> Result<()> {
        let target: Vec<NumberSize> = self
            .widths
            .iter()
            .zip(&target)
            .map(|(old, new)| (*old).max(*new))
            .collect();
        if target == self.widths {
            return Ok(());
        }

        let from = self.widths.clone();
        let old_width = self.element_width() as u64;
        let new_width = self.layout.element_width(&target) as u64;
        let header = self.header_size();
        let window = (self.staging_bytes as u64 / new_width.max(1)).max(1);
        let len = self.len;
        let storage = self.storage.clone();

        self.mutate(|array| {
            storage.ensure_capacity(array.ptr, header + len * new_width)?;
            let mut end = len;
            while end > 0 {
                let start = end.saturating_sub(window);
                let count = (end - start) as usize;

                let mut old = vec![0u8; count * old_width as usize];
                storage.read_exact(array.ptr, header + start * old_width, &mut old)?;

                let mut input = &old[..];
                let mut out = BytesMut::with_capacity(count * new_width as usize);
                for _ in 0..count {
                    array.reencode(&from, &target, &mut input, &mut out)?;
                }
                storage.write(array.ptr, header + start * new_width, &out)?;
                end = start;
            }
            array.widths = target.clone();
            array.write_header()
        })?;

        tracing::debug!(
            "array {} migrated widths {:?} -> {:?} ({} elements)",
            self.ptr,
            from,
            self.widths,
            len
        );
        Ok(())
    }

    fn reencode(
        &self,
        from: &[NumberSize],
        to: &[NumberSize],
        input: &mut &[u8],
        out: &mut BytesMut,
    ) -> Result<()> {
        match self.layout {
            // Payloads stay where they are; only the pointer widens
            ValueStorage::Reference => to[0].write(from[0].read(input)?, out),
            _ => T::decode_element(from, input)?.encode_element(to, out),
        }
    }

    /// Shift `[index + 1, len)` down one slot, front to back
    pub(crate) fn squash(&mut self, index: u64) -> Result<()> {
        let width = self.element_width() as u64;
        if width == 0 {
            return Ok(());
        }
        let window = self.window();
        let mut start = index + 1;
        while start < self.len {
            let end = (start + window).min(self.len);
            let mut buf = vec![0u8; ((end - start) * width) as usize];
            self.storage
                .read_exact(self.ptr, self.offset(start), &mut buf)?;
            self.storage.write(self.ptr, self.offset(start - 1), &buf)?;
            start = end;
        }
        Ok(())
    }

    /// Shift `[index, len)` up one slot, back to front
    pub(crate) fn forward_dup(&mut self, index: u64) -> Result<()> {
        let width = self.element_width() as u64;
        if width == 0 {
            return Ok(());
        }
        let window = self.window();
        let mut end = self.len;
        while end > index {
            let start = end.saturating_sub(window).max(index);
            let mut buf = vec![0u8; ((end - start) * width) as usize];
            self.storage
                .read_exact(self.ptr, self.offset(start), &mut buf)?;
            self.storage.write(self.ptr, self.offset(start + 1), &buf)?;
            end = start;
        }
        Ok(())
    }

    pub(crate) fn maybe_defrag(&mut self) -> Result<()> {
        self.defrag().map(|_| ())
    }

    /// Merge a trailing run of fragments once the chain is too long
    ///
    /// At most `defrag_step_budget` fragments are merged per call; a chain
    /// that is still too long is handled by later calls.
    pub fn defrag(&mut self) -> Result<bool> {
        let fragments = self.storage.fragment_count(self.ptr)?;
        if fragments <= self.defrag_chain_limit.max(1) {
            return Ok(false);
        }
        let count = self.defrag_step_budget.min(fragments - 1);
        if count < 2 {
            return Ok(false);
        }
        let first = fragments - count;
        self.storage.merge_fragments(self.ptr, first, count)?;
        tracing::debug!(
            "array {} defragmented: merged fragments {}..{} of {}",
            self.ptr,
            first,
            fragments,
            fragments
        );
        Ok(true)
    }
}
