//! Tests for HashIoMap
//!
//! These tests verify:
//! - Put / get / overwrite / remove semantics
//! - Reflow through both the rewire and the streaming path
//! - Entry handles and their staleness after a reflow
//! - Iteration, clear and reopen
//! - Bounded transactions in streamed reflows, and resuming an interrupted one
//! - Size and chains after a failed put or remove

mod common;

use std::collections::HashMap;

use iocoll::config::Config;
use iocoll::map::ReflowPath;
use iocoll::storage::Storage;
use iocoll::HashIoMap;
use tracing_subscriber::{fmt, EnvFilter};

use common::tapped_storage;

// =============================================================================
// Helper Functions
// =============================================================================

fn small_map(storage: &Storage) -> HashIoMap<u64, u64> {
    let config = Config::builder().initial_bucket_po2(1).build();
    HashIoMap::create(storage, &config).unwrap()
}

fn entries(map: &HashIoMap<u64, u64>) -> HashMap<u64, u64> {
    map.iter().collect::<Result<HashMap<_, _>, _>>().unwrap()
}

/// Reflow logging, shown with RUST_LOG=iocoll=debug
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn streaming(window: usize) -> Config {
    Config::builder()
        .initial_bucket_po2(1)
        .reflow_rewire_limit(0)
        .reflow_window(window)
        .build()
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_get_overwrite() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);

    assert_eq!(map.put(1, 100).unwrap(), None);
    assert_eq!(map.put(1, 101).unwrap(), Some(100));

    assert_eq!(map.get(&1).unwrap(), Some(101));
    assert_eq!(map.get(&2).unwrap(), None);
    assert_eq!(map.len(), 1);
}

#[test]
fn test_remove() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    for k in 0..10 {
        map.put(k, k * 2).unwrap();
    }

    assert_eq!(map.remove(&4).unwrap(), Some(8));
    assert_eq!(map.remove(&4).unwrap(), None);
    assert!(!map.contains_key(&4).unwrap());
    assert_eq!(map.len(), 9);
    map.validate().unwrap();
}

#[test]
fn test_reinsert_after_remove() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    for k in 0..16 {
        map.put(k, k).unwrap();
    }
    for k in 0..16 {
        map.remove(&k).unwrap();
    }
    assert!(map.is_empty());

    for k in 0..16 {
        assert_eq!(map.put(k, k + 1).unwrap(), None);
    }
    assert_eq!(map.get(&15).unwrap(), Some(16));
    map.validate().unwrap();
}

#[test]
fn test_string_keys_and_values() {
    let storage = Storage::memory();
    let mut map: HashIoMap<String, String> =
        HashIoMap::create(&storage, &Config::default()).unwrap();

    map.put("k".to_string(), "v1".to_string()).unwrap();
    map.put("k".to_string(), "a longer second value".to_string())
        .unwrap();

    assert_eq!(
        map.get(&"k".to_string()).unwrap(),
        Some("a longer second value".to_string())
    );
}

// =============================================================================
// Reflow Tests
// =============================================================================

#[test]
fn test_two_thousand_keys_reflow() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);

    for k in 1..=2000u64 {
        map.put(k, k * 10).unwrap();
    }

    let stats = map.stats();
    assert!(stats.reflows >= 2);
    assert!(map.bucket_count() >= 2000);
    for k in 1..=2000u64 {
        assert_eq!(map.get(&k).unwrap(), Some(k * 10));
    }
    assert_eq!(map.get(&2001).unwrap(), None);
    map.validate().unwrap();
}

#[test]
fn test_rewire_path_below_limit() {
    let storage = Storage::memory();
    let config = Config::builder()
        .initial_bucket_po2(1)
        .reflow_rewire_limit(1_000)
        .build();
    let mut map = HashIoMap::create(&storage, &config).unwrap();

    for k in 0..100u64 {
        map.put(k, k).unwrap();
    }

    assert_eq!(map.stats().last_reflow, Some(ReflowPath::Rewire));
    assert_eq!(entries(&map).len(), 100);
    map.validate().unwrap();
}

#[test]
fn test_stream_path_above_limit() {
    init_tracing();
    let storage = Storage::memory();
    let config = streaming(3);
    let mut map = HashIoMap::create(&storage, &config).unwrap();

    for k in 0..100u64 {
        map.put(k, k + 7).unwrap();
    }

    assert_eq!(map.stats().last_reflow, Some(ReflowPath::Stream));
    let all = entries(&map);
    assert_eq!(all.len(), 100);
    assert!(all.iter().all(|(k, v)| *v == k + 7));
    map.validate().unwrap();
}

#[test]
fn test_streamed_reflow_commits_per_window() {
    init_tracing();
    let (storage, tap) = tapped_storage();
    let mut map = HashIoMap::create(&storage, &streaming(4)).unwrap();

    for k in 0..4096u64 {
        map.put(k, !k).unwrap();
    }

    // The last reflow moved 4096 entries; no transaction grew with it
    let stats = map.stats();
    assert_eq!(stats.last_reflow, Some(ReflowPath::Stream));
    assert_eq!(stats.bucket_count, 8192);
    assert!(
        tap.largest_scope() < 256,
        "largest transaction made {} mutating calls",
        tap.largest_scope()
    );
    for k in (0..4096u64).step_by(97) {
        assert_eq!(map.get(&k).unwrap(), Some(!k));
    }
    map.validate().unwrap();
}

#[test]
fn test_interrupted_reflow_finishes_on_next_operation() {
    init_tracing();
    let (storage, tap) = tapped_storage();
    let mut map = HashIoMap::create(&storage, &streaming(2)).unwrap();
    for k in 0..63u64 {
        map.put(k, k * 3).unwrap();
    }
    assert_eq!(map.bucket_count(), 64);

    // The 64th entry commits, then the reflow it triggers fails mid-stream
    tap.fail_after(40);
    assert!(map.put(63, 189).is_err());
    tap.disarm();

    assert_eq!(map.len(), 64);
    assert_eq!(map.bucket_count(), 64);
    assert!(map.validate().is_err());
    let seen = entries(&map);
    assert_eq!(seen.len(), 64);
    assert!(seen.iter().all(|(k, v)| *v == k * 3));

    // Any operation completes the reflow first
    assert_eq!(map.get(&63).unwrap(), Some(189));
    assert_eq!(map.bucket_count(), 128);
    assert_eq!(map.stats().last_reflow, Some(ReflowPath::Stream));
    for k in 0..64u64 {
        assert_eq!(map.get(&k).unwrap(), Some(k * 3));
    }
    map.validate().unwrap();
}

#[test]
fn test_interrupted_reflow_finishes_on_open() {
    let (storage, tap) = tapped_storage();
    let config = streaming(2);
    let ptr = {
        let mut map = HashIoMap::create(&storage, &config).unwrap();
        for k in 0..63u64 {
            map.put(k, k + 1).unwrap();
        }
        tap.fail_after(60);
        assert!(map.put(63, 64).is_err());
        tap.disarm();
        map.ptr()
    };

    let mut map: HashIoMap<u64, u64> = HashIoMap::open(&storage, ptr, &config).unwrap();
    assert_eq!(map.bucket_count(), 128);
    map.validate().unwrap();
    assert_eq!(entries(&map).len(), 64);
    assert_eq!(map.get(&0).unwrap(), Some(1));
}

#[test]
fn test_reflow_drops_empty_tail_cells() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    map.put(1, 1).unwrap();
    map.remove(&1).unwrap();

    // Header, bucket array and the emptied tail cell kept for reuse
    assert_eq!(storage.stats().chunks, 3);
    map.validate().unwrap();

    // The second put fills both buckets and reflows
    map.put(10, 10).unwrap();
    map.put(11, 11).unwrap();

    assert_eq!(map.stats().reflows, 1);
    assert_eq!(storage.stats().chunks, 2 + map.len());
    map.validate().unwrap();
}

#[test]
fn test_validate_every_mutation() {
    let storage = Storage::memory();
    let config = Config::builder()
        .initial_bucket_po2(1)
        .validate(true)
        .build();
    let mut map = HashIoMap::create(&storage, &config).unwrap();

    for k in 0..300u64 {
        map.put(k, k).unwrap();
    }
    for k in (0..300u64).step_by(3) {
        map.remove(&k).unwrap();
    }
    assert_eq!(map.len(), 200);
}

#[test]
fn test_validate_compares_resident_buckets() {
    let storage = Storage::memory();
    let config = Config::builder()
        .initial_bucket_po2(4)
        .validate(true)
        .build();
    let mut map: HashIoMap<String, Vec<u8>> = HashIoMap::create(&storage, &config).unwrap();

    map.put("a".to_string(), vec![1, 2]).unwrap();
    map.put("b".to_string(), vec![3]).unwrap();
    // Lookups leave both chains resident
    map.get(&"a".to_string()).unwrap();
    map.get(&"b".to_string()).unwrap();
    assert!(map.stats().cached_buckets >= 1);

    map.put("a".to_string(), vec![9]).unwrap();
    map.validate().unwrap();
    assert_eq!(map.get(&"a".to_string()).unwrap(), Some(vec![9]));
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_put_leaves_size_and_chains() {
    let (storage, tap) = tapped_storage();
    let config = Config::builder().initial_bucket_po2(4).build();
    let mut map = HashIoMap::create(&storage, &config).unwrap();
    for k in 0..5u64 {
        map.put(k, k).unwrap();
    }

    // Fail each mutating call of the put in turn
    let mut failures = 0;
    for n in 0..64 {
        tap.fail_after(n);
        let result = map.put(100, 1);
        let pending = tap.armed();
        tap.disarm();
        if result.is_ok() {
            assert!(pending);
            break;
        }
        failures += 1;
        assert_eq!(map.len(), 5);
        assert_eq!(map.get(&100).unwrap(), None);
        map.validate().unwrap();
    }

    assert!(failures >= 2);
    assert_eq!(map.len(), 6);
    assert_eq!(map.get(&100).unwrap(), Some(1));
    map.validate().unwrap();
}

#[test]
fn test_failed_remove_keeps_entry() {
    let (storage, tap) = tapped_storage();
    let config = Config::builder().initial_bucket_po2(1).build();
    let mut map = HashIoMap::create(&storage, &config).unwrap();
    for k in 0..6u64 {
        map.put(k, k * 2).unwrap();
    }
    let before = entries(&map);

    for k in 0..6u64 {
        tap.fail_after(0);
        assert!(map.remove(&k).is_err());
        tap.disarm();
        assert_eq!(map.len(), 6);
        assert_eq!(map.get(&k).unwrap(), Some(k * 2));
    }
    assert_eq!(entries(&map), before);
    map.validate().unwrap();

    assert_eq!(map.remove(&3).unwrap(), Some(6));
    assert_eq!(map.len(), 5);
    map.validate().unwrap();
}

// =============================================================================
// Entry Handle Tests
// =============================================================================

#[test]
fn test_entry_updates_in_place() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    map.put(5, 50).unwrap();

    let mut entry = map.entry(&5).unwrap().unwrap();
    assert_eq!(*entry.key(), 5);
    assert_eq!(*entry.value(), 50);
    assert!(map.is_current(&entry));

    map.set_entry_value(&mut entry, 55).unwrap();
    assert_eq!(*entry.value(), 55);
    assert_eq!(map.get(&5).unwrap(), Some(55));
    assert!(map.entry(&6).unwrap().is_none());
}

#[test]
fn test_entry_goes_stale_after_reflow() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    map.put(1, 10).unwrap();
    let mut entry = map.entry(&1).unwrap().unwrap();
    let before = map.dataset_id();

    for k in 2..40u64 {
        map.put(k, k).unwrap();
    }

    assert!(map.dataset_id() > before);
    assert!(!map.is_current(&entry));

    // A stale write re-resolves instead of touching a moved cell
    map.set_entry_value(&mut entry, 11).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(11));
    assert!(map.is_current(&entry));
    assert_eq!(map.len(), 39);
    map.validate().unwrap();
}

#[test]
fn test_entry_goes_stale_after_remove() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    map.put(1, 1).unwrap();
    map.put(2, 2).unwrap();
    let entry = map.entry(&1).unwrap().unwrap();

    map.remove(&2).unwrap();

    assert!(!map.is_current(&entry));
}

// =============================================================================
// Whole-map Tests
// =============================================================================

#[test]
fn test_iter_and_keys() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    let mut expected = HashMap::new();
    for k in 0..50u64 {
        map.put(k, k * k).unwrap();
        expected.insert(k, k * k);
    }

    assert_eq!(entries(&map), expected);
    let mut keys: Vec<u64> = map.keys().collect::<Result<_, _>>().unwrap();
    keys.sort_unstable();
    assert_eq!(keys, (0..50).collect::<Vec<_>>());
}

#[test]
fn test_clear_resets_buckets() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    for k in 0..40u64 {
        map.put(k, k).unwrap();
    }

    map.clear().unwrap();

    assert!(map.is_empty());
    assert_eq!(map.bucket_po2(), 1);
    assert_eq!(map.get(&3).unwrap(), None);
    // Header and bucket array only
    assert_eq!(storage.stats().chunks, 2);
    map.put(3, 3).unwrap();
    map.validate().unwrap();
}

#[test]
fn test_free_releases_everything() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    for k in 0..20u64 {
        map.put(k, k).unwrap();
    }
    map.free().unwrap();
    assert_eq!(storage.stats().chunks, 0);
}

#[test]
fn test_reopen() {
    let storage = Storage::memory();
    let config = Config::builder().initial_bucket_po2(1).build();
    let ptr = {
        let mut map = HashIoMap::create(&storage, &config).unwrap();
        for k in 0..30u64 {
            map.put(k, k + 1).unwrap();
        }
        map.ptr()
    };

    let mut map: HashIoMap<u64, u64> = HashIoMap::open(&storage, ptr, &config).unwrap();
    assert_eq!(map.len(), 30);
    assert_eq!(map.get(&29).unwrap(), Some(30));
    map.validate().unwrap();
}

#[test]
fn test_cache_serves_repeat_lookups() {
    let storage = Storage::memory();
    let mut map = small_map(&storage);
    map.put(1, 1).unwrap();

    map.get(&1).unwrap();
    map.get(&1).unwrap();

    let stats = map.stats();
    assert!(stats.cache_hits >= 1);
    assert!(stats.cached_buckets >= 1);
}
