//! Tests for Cell
//!
//! These tests verify:
//! - Allocation with and without a value
//! - In-place pointer widening keeps the value intact
//! - Value replacement and clearing
//! - Reading a never-written chunk

use iocoll::cell::{Cell, CellContents};
use iocoll::codec::NumberSize;
use iocoll::storage::{ChunkPtr, Storage};

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_alloc_with_value() {
    let storage = Storage::memory();
    let cell = Cell::alloc(&storage, Some(&"hello".to_string()), ChunkPtr::NULL, None).unwrap();

    assert_eq!(cell.value().unwrap(), Some("hello".to_string()));
    assert!(cell.next().unwrap().is_null());
}

#[test]
fn test_alloc_without_value() {
    let storage = Storage::memory();
    let cell: Cell<u64> = Cell::alloc(&storage, None, ChunkPtr::NULL, None).unwrap();

    assert_eq!(
        cell.load().unwrap(),
        CellContents {
            next: ChunkPtr::NULL,
            value: None
        }
    );
}

#[test]
fn test_reopen_reads_link_and_value() {
    let storage = Storage::memory();
    let tail = Cell::alloc(&storage, Some(&2u64), ChunkPtr::NULL, None).unwrap();
    let head = Cell::alloc(&storage, Some(&1u64), tail.ptr(), None).unwrap();

    let reopened: Cell<u64> = Cell::open(&storage, head.ptr());
    let contents = reopened.load().unwrap();
    assert_eq!(contents.next, tail.ptr());
    assert_eq!(contents.value, Some(1));
}

#[test]
fn test_never_written_chunk_reads_empty() {
    let storage = Storage::memory();
    let ptr = storage.allocate(16, None).unwrap();
    let cell: Cell<u64> = Cell::open(&storage, ptr);

    assert_eq!(cell.width().unwrap(), NumberSize::Void);
    assert!(cell.next().unwrap().is_null());
    assert_eq!(cell.value().unwrap(), None);
}

// =============================================================================
// Mutation Tests
// =============================================================================

#[test]
fn test_set_next_widens_in_place() {
    let storage = Storage::memory();
    let mut cell = Cell::alloc(&storage, Some(&"payload".to_string()), ChunkPtr::NULL, None).unwrap();
    let before = cell.width().unwrap();
    let far = ChunkPtr::new(u64::from(u32::MAX) + 10);

    cell.set_next(far).unwrap();

    assert_eq!(cell.width().unwrap(), NumberSize::Long);
    assert!(before < NumberSize::Long);

    // A fresh handle sees the same layout
    let reopened: Cell<String> = Cell::open(&storage, cell.ptr());
    assert_eq!(reopened.next().unwrap(), far);
    assert_eq!(reopened.value().unwrap(), Some("payload".to_string()));
}

#[test]
fn test_set_next_to_null() {
    let storage = Storage::memory();
    let other = Cell::alloc(&storage, Some(&9u64), ChunkPtr::NULL, None).unwrap();
    let mut cell = Cell::alloc(&storage, Some(&1u64), other.ptr(), None).unwrap();

    cell.set_next(ChunkPtr::NULL).unwrap();

    assert!(cell.next().unwrap().is_null());
    assert_eq!(cell.value().unwrap(), Some(1));
}

#[test]
fn test_set_value_replaces_and_clears() {
    let storage = Storage::memory();
    let mut cell = Cell::alloc(&storage, Some(&"short".to_string()), ChunkPtr::NULL, None).unwrap();

    cell.set_value(Some(&"a much longer value than before".to_string()))
        .unwrap();
    assert_eq!(
        cell.value().unwrap(),
        Some("a much longer value than before".to_string())
    );

    cell.set_value(Some(&"s".to_string())).unwrap();
    assert_eq!(cell.value().unwrap(), Some("s".to_string()));

    cell.set_value(None).unwrap();
    assert_eq!(cell.value().unwrap(), None);
}

#[test]
fn test_free_releases_chunk() {
    let storage = Storage::memory();
    let cell = Cell::alloc(&storage, Some(&1u64), ChunkPtr::NULL, None).unwrap();
    let chunks = storage.stats().chunks;

    cell.free().unwrap();

    assert_eq!(storage.stats().chunks, chunks - 1);
}
