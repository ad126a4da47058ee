//! Tests for ContiguousArray
//!
//! These tests verify:
//! - Indexed access, insert/remove shifting, bounds errors
//! - Width migration when a wider value arrives
//! - Reference payloads (strings, nullable options)
//! - Bulk appends, iteration and reopen
//! - Defragmentation of long fragment chains
//! - No payload left behind when building from values fails

mod common;

use iocoll::codec::NumberSize;
use iocoll::config::Config;
use iocoll::storage::Storage;
use iocoll::{ContiguousArray, IoCollError};

use common::tapped_storage;

// =============================================================================
// Helper Functions
// =============================================================================

fn small_staging() -> Config {
    Config::builder().staging_buffer_bytes(16).build()
}

fn collect<T: iocoll::IoValue>(array: &ContiguousArray<T>) -> Vec<T> {
    array.iter().collect::<Result<Vec<_>, _>>().unwrap()
}

// =============================================================================
// Element Access Tests
// =============================================================================

#[test]
fn test_add_get_set() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();

    assert_eq!(array.add(10u64).unwrap(), 0);
    assert_eq!(array.add(20u64).unwrap(), 1);
    array.set(0, 11).unwrap();

    assert_eq!(array.len(), 2);
    assert_eq!(array.get(0).unwrap(), 11);
    assert_eq!(array.get(1).unwrap(), 20);
    assert_eq!(array.last().unwrap(), Some(20));
}

#[test]
fn test_out_of_bounds() {
    let storage = Storage::memory();
    let mut array: ContiguousArray<u64> =
        ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add(1).unwrap();

    assert!(matches!(
        array.get(1),
        Err(IoCollError::IndexOutOfBounds { index: 1, len: 1 })
    ));
    assert!(array.set(5, 0).is_err());
    assert!(array.insert(3, 0).is_err());
    assert!(array.get_many(0..2).is_err());
}

#[test]
fn test_insert_and_remove_shift() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    for v in [1u64, 2, 4, 5] {
        array.add(v).unwrap();
    }

    array.insert(2, 3).unwrap();
    assert_eq!(collect(&array), vec![1, 2, 3, 4, 5]);

    assert_eq!(array.remove(0).unwrap(), 1);
    assert_eq!(array.pop().unwrap(), Some(5));
    assert_eq!(collect(&array), vec![2, 3, 4]);
}

#[test]
fn test_pop_empty() {
    let storage = Storage::memory();
    let mut array: ContiguousArray<u64> =
        ContiguousArray::create(&storage, &Config::default()).unwrap();
    assert_eq!(array.pop().unwrap(), None);
    assert_eq!(array.last().unwrap(), None);
}

#[test]
fn test_get_many_range() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add_many(10, |i| i * 3).unwrap();

    assert_eq!(array.get_many(2..5).unwrap(), vec![6u64, 9, 12]);
    assert!(array.get_many(4..4).unwrap().is_empty());
}

// =============================================================================
// Width Migration Tests
// =============================================================================

#[test]
fn test_width_migration_round_trip() {
    let storage = Storage::memory();
    let config = small_staging();
    let mut array = ContiguousArray::create(&storage, &config).unwrap();

    let mut expected = Vec::new();
    for i in 0..40u64 {
        array.add(i).unwrap();
        expected.push(i);
    }
    assert_eq!(array.widths(), &[NumberSize::Byte]);

    array.add(70_000).unwrap();
    expected.push(70_000);
    assert_eq!(array.widths(), &[NumberSize::Int]);
    assert_eq!(collect(&array), expected);

    array.set(3, u64::MAX).unwrap();
    expected[3] = u64::MAX;
    assert_eq!(array.widths(), &[NumberSize::Long]);
    assert_eq!(collect(&array), expected);

    let reopened: ContiguousArray<u64> =
        ContiguousArray::open(&storage, array.ptr(), &config).unwrap();
    assert_eq!(reopened.widths(), &[NumberSize::Long]);
    assert_eq!(collect(&reopened), expected);
}

#[test]
fn test_widths_only_grow() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add(100_000u64).unwrap();
    array.set(0, 1).unwrap();

    assert_eq!(array.widths(), &[NumberSize::Int]);
    assert_eq!(array.get(0).unwrap(), 1);
}

#[test]
fn test_insert_wider_value_migrates() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &small_staging()).unwrap();
    array.add_many(20, |i| i).unwrap();

    array.insert(10, 1 << 40).unwrap();

    let mut expected: Vec<u64> = (0..20).collect();
    expected.insert(10, 1 << 40);
    assert_eq!(collect(&array), expected);
}

#[test]
fn test_from_values_negotiates_up_front() {
    let storage = Storage::memory();
    let values = vec![1i64, -300, 5];
    let array = ContiguousArray::from_values(&storage, &Config::default(), values.clone()).unwrap();

    assert_eq!(array.widths(), &[NumberSize::Short]);
    assert_eq!(collect(&array), values);
}

// =============================================================================
// Reference Payload Tests
// =============================================================================

#[test]
fn test_string_payloads() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add("alpha".to_string()).unwrap();
    array.add("beta".to_string()).unwrap();

    array.set(0, "gamma".to_string()).unwrap();

    assert_eq!(collect(&array), vec!["gamma".to_string(), "beta".to_string()]);
}

#[test]
fn test_replaced_payloads_are_freed() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add("first".to_string()).unwrap();
    let chunks = storage.stats().chunks;

    array.set(0, "second".to_string()).unwrap();
    assert_eq!(storage.stats().chunks, chunks);

    array.pop().unwrap();
    assert_eq!(storage.stats().chunks, chunks - 1);
}

#[test]
fn test_nullable_references() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add(Some("x".to_string())).unwrap();
    array.add(None).unwrap();

    assert_eq!(array.get(0).unwrap(), Some("x".to_string()));
    assert_eq!(array.get(1).unwrap(), None);
}

#[test]
fn test_free_releases_everything() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    for word in ["a", "b", "c"] {
        array.add(word.to_string()).unwrap();
    }

    array.free().unwrap();

    assert_eq!(storage.stats().chunks, 0);
}

#[test]
fn test_failed_from_values_leaves_no_payloads() {
    let (storage, tap) = tapped_storage();
    let words: Vec<String> = (0..12).map(|i| format!("payload-{}", i)).collect();

    // Fail each mutating call of the build in turn
    let mut failures = 0;
    for n in 0..256 {
        tap.fail_after(n);
        let result = ContiguousArray::from_values(&storage, &small_staging(), words.clone());
        let pending = tap.armed();
        tap.disarm();
        match result {
            Ok(array) => {
                assert!(pending);
                assert_eq!(collect(&array), words);
                break;
            }
            Err(_) => {
                failures += 1;
                assert_eq!(storage.stats().chunks, 0);
            }
        }
    }
    assert!(failures > words.len());
}

// =============================================================================
// Bulk and Iteration Tests
// =============================================================================

#[test]
fn test_add_many_crosses_staging_windows() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &small_staging()).unwrap();

    array.add_many(500, |i| i * 1000).unwrap();

    assert_eq!(array.len(), 500);
    assert_eq!(array.get(499).unwrap(), 499_000u64);
    let values = collect(&array);
    assert!(values.iter().enumerate().all(|(i, v)| *v == i as u64 * 1000));
}

#[test]
fn test_clear_keeps_array_usable() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add_many(5, |i| i).unwrap();

    array.clear().unwrap();
    assert!(array.is_empty());
    array.add(42u64).unwrap();
    assert_eq!(collect(&array), vec![42]);
}

#[test]
fn test_open_never_written_chunk() {
    let storage = Storage::memory();
    let ptr = storage.allocate(32, None).unwrap();
    let array: ContiguousArray<u64> =
        ContiguousArray::open(&storage, ptr, &Config::default()).unwrap();
    assert!(array.is_empty());
}

#[test]
fn test_trim_keeps_elements() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add_many(10, |i| i + 1000).unwrap();
    assert_eq!(array.widths(), &[NumberSize::Short]);
    array.request_capacity(100).unwrap();
    assert!(array.capacity().unwrap() >= 100);

    array.trim().unwrap();

    assert_eq!(array.capacity().unwrap(), 10);
    assert_eq!(array.get(9).unwrap(), 1009u64);
}

// =============================================================================
// Defragmentation Tests
// =============================================================================

#[test]
fn test_defrag_merges_trailing_fragments() {
    let storage = Storage::memory();
    let loose = Config::builder().defrag_chain_limit(1_000).build();
    let mut array = ContiguousArray::create(&storage, &loose).unwrap();
    for i in 0..200u64 {
        array.add(1000 + i).unwrap();
        // Pin the end of the address space so the array cannot grow in place
        storage.allocate(8, None).unwrap();
    }
    let before = storage.fragment_count(array.ptr()).unwrap();
    assert!(before >= 3);

    let tight = Config::builder()
        .defrag_chain_limit(1)
        .defrag_step_budget(2)
        .build();
    let mut array: ContiguousArray<u64> =
        ContiguousArray::open(&storage, array.ptr(), &tight).unwrap();
    assert!(array.defrag().unwrap());

    assert_eq!(storage.fragment_count(array.ptr()).unwrap(), before - 1);
    assert_eq!(collect(&array), (1000..1200).collect::<Vec<u64>>());
}

#[test]
fn test_defrag_skips_short_chains() {
    let storage = Storage::memory();
    let mut array = ContiguousArray::create(&storage, &Config::default()).unwrap();
    array.add(1u64).unwrap();

    assert!(!array.defrag().unwrap());
}
