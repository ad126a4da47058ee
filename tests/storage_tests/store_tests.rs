//! Tests for the in-memory chunk store and the shared Storage handle
//!
//! These tests verify:
//! - Allocation, reads past the logical end, growth across fragments
//! - Size and capacity management
//! - Fragment merging
//! - Nested transactions (outermost commit / rollback)
//! - The std::io view over a chunk

use std::io::{Read, Seek, SeekFrom, Write};

use iocoll::storage::{ChunkPtr, Storage};
use iocoll::{IoCollError, Result};

// =============================================================================
// Helper Functions
// =============================================================================

fn read_all(storage: &Storage, ptr: ChunkPtr) -> Vec<u8> {
    storage.read_from(ptr, 0).unwrap()
}

/// A chunk forced into several fragments by interleaved allocations
fn fragmented(storage: &Storage) -> (ChunkPtr, Vec<u8>) {
    let ptr = storage.allocate(16, None).unwrap();
    let mut expected = Vec::new();
    for round in 0..4u8 {
        // Something allocated right after the chunk blocks in-place growth
        storage.allocate(16, None).unwrap();
        let bytes = vec![round + 1; 24];
        storage.write(ptr, expected.len() as u64, &bytes).unwrap();
        expected.extend_from_slice(&bytes);
    }
    (ptr, expected)
}

// =============================================================================
// Allocation and Access Tests
// =============================================================================

#[test]
fn test_allocate_never_returns_null() {
    let storage = Storage::memory();
    for _ in 0..10 {
        assert!(!storage.allocate(8, None).unwrap().is_null());
    }
}

#[test]
fn test_fresh_chunk_is_empty() {
    let storage = Storage::memory();
    let ptr = storage.allocate(64, None).unwrap();

    assert_eq!(storage.size(ptr).unwrap(), 0);
    assert!(storage.capacity(ptr).unwrap() >= 64);
    let mut buf = [0u8; 4];
    assert_eq!(storage.read(ptr, 0, &mut buf).unwrap(), 0);
}

#[test]
fn test_read_is_short_at_end_of_data() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    storage.write(ptr, 0, b"hello").unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(storage.read(ptr, 2, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"llo");

    let err = storage.read_exact(ptr, 2, &mut buf).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_write_past_capacity_grows() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    let data: Vec<u8> = (0..200u8).collect();

    storage.write(ptr, 0, &data).unwrap();

    assert_eq!(storage.size(ptr).unwrap(), 200);
    assert_eq!(read_all(&storage, ptr), data);
}

#[test]
fn test_growth_across_fragments_reads_back() {
    let storage = Storage::memory();
    let (ptr, expected) = fragmented(&storage);

    assert!(storage.fragment_count(ptr).unwrap() > 1);
    assert_eq!(read_all(&storage, ptr), expected);

    // A write spanning fragment boundaries
    storage.write(ptr, 10, &[0xEE; 60]).unwrap();
    let mut patched = expected.clone();
    patched[10..70].fill(0xEE);
    assert_eq!(read_all(&storage, ptr), patched);
}

#[test]
fn test_invalid_pointer_rejected() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    storage.free(ptr).unwrap();

    let err = storage.size(ptr).unwrap_err();
    assert!(matches!(err, IoCollError::InvalidPointer(_)));
}

#[test]
fn test_freed_space_is_reused() {
    let storage = Storage::memory();
    let a = storage.allocate(32, None).unwrap();
    let _b = storage.allocate(32, None).unwrap();
    storage.free(a).unwrap();

    let c = storage.allocate(32, None).unwrap();
    assert_eq!(c, a);
}

// =============================================================================
// Size and Capacity Tests
// =============================================================================

#[test]
fn test_shrunk_size_does_not_resurrect_bytes() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    storage.write(ptr, 0, &[9u8; 12]).unwrap();

    storage.set_size(ptr, 4).unwrap();
    storage.set_size(ptr, 12).unwrap();

    let bytes = read_all(&storage, ptr);
    assert_eq!(&bytes[..4], &[9u8; 4]);
    assert_eq!(&bytes[4..], &[0u8; 8]);
}

#[test]
fn test_set_capacity_releases_trailing_fragments() {
    let storage = Storage::memory();
    let (ptr, expected) = fragmented(&storage);
    let before = storage.fragment_count(ptr).unwrap();

    storage.set_capacity(ptr, 20).unwrap();

    assert!(storage.fragment_count(ptr).unwrap() < before);
    assert_eq!(storage.capacity(ptr).unwrap(), 20);
    assert_eq!(read_all(&storage, ptr), expected[..20].to_vec());
}

#[test]
fn test_merge_fragments_keeps_bytes() {
    let storage = Storage::memory();
    let (ptr, expected) = fragmented(&storage);
    let count = storage.fragment_count(ptr).unwrap();
    assert!(count >= 3);

    storage.merge_fragments(ptr, 1, count - 1).unwrap();

    assert_eq!(storage.fragment_count(ptr).unwrap(), 2);
    assert_eq!(read_all(&storage, ptr), expected);
}

#[test]
fn test_merge_rejects_head() {
    let storage = Storage::memory();
    let (ptr, _) = fragmented(&storage);
    assert!(storage.merge_fragments(ptr, 0, 2).is_err());
}

// =============================================================================
// Transaction Tests
// =============================================================================

#[test]
fn test_transaction_commits_on_ok() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();

    storage
        .transaction(|| {
            storage.write(ptr, 0, b"abc")?;
            storage.write(ptr, 3, b"def")
        })
        .unwrap();

    assert_eq!(read_all(&storage, ptr), b"abcdef");
    assert_eq!(storage.stats().transactions_committed, 1);
}

#[test]
fn test_transaction_rolls_back_on_err() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    storage.write(ptr, 0, b"keep").unwrap();
    let chunks_before = storage.stats().chunks;

    let result: Result<()> = storage.transaction(|| {
        storage.write(ptr, 0, b"lost")?;
        storage.allocate(64, None)?;
        Err(IoCollError::Storage("boom".to_string()))
    });

    assert!(result.is_err());
    assert_eq!(read_all(&storage, ptr), b"keep");
    assert_eq!(storage.stats().chunks, chunks_before);
    assert_eq!(storage.stats().transactions_aborted, 1);
}

#[test]
fn test_nested_failure_rolls_back_outer_scope() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();

    let result: Result<()> = storage.transaction(|| {
        storage.write(ptr, 0, b"outer")?;
        storage.transaction(|| {
            assert_eq!(storage.transaction_depth(), 2);
            Err(IoCollError::Storage("inner".to_string()))
        })
    });

    assert!(result.is_err());
    assert_eq!(storage.transaction_depth(), 0);
    assert_eq!(storage.size(ptr).unwrap(), 0);
}

#[test]
fn test_rollback_restores_freed_chunk() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    storage.write(ptr, 0, b"survivor").unwrap();

    let _ = storage.transaction(|| -> Result<()> {
        storage.free(ptr)?;
        Err(IoCollError::Storage("undo".to_string()))
    });

    assert_eq!(read_all(&storage, ptr), b"survivor");
}

#[test]
fn test_roots_follow_transactions() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    storage.set_root("main", ptr).unwrap();

    let _ = storage.transaction(|| -> Result<()> {
        storage.set_root("main", ChunkPtr::NULL)?;
        Err(IoCollError::Storage("undo".to_string()))
    });

    assert_eq!(storage.root("main"), Some(ptr));
    assert_eq!(storage.root("other"), None);
}

// =============================================================================
// std::io View Tests
// =============================================================================

#[test]
fn test_chunk_io_read_write_seek() {
    let storage = Storage::memory();
    let ptr = storage.allocate(8, None).unwrap();
    let mut io = storage.open(ptr);

    io.write_all(b"0123456789").unwrap();
    io.seek(SeekFrom::Start(4)).unwrap();
    let mut buf = [0u8; 3];
    io.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"456");

    io.seek(SeekFrom::End(-2)).unwrap();
    let mut rest = Vec::new();
    io.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"89");
}
