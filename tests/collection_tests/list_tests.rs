//! Tests for LinkedIoList
//!
//! These tests verify:
//! - Head, tail and indexed operations keep order
//! - The walk cursor stays correct across mutations
//! - Bulk append, clear and reopen

use iocoll::config::Config;
use iocoll::storage::Storage;
use iocoll::{IoCollError, LinkedIoList};

// =============================================================================
// Helper Functions
// =============================================================================

fn list_of(storage: &Storage, values: &[u64]) -> LinkedIoList<u64> {
    let mut list = LinkedIoList::create(storage, &Config::default()).unwrap();
    for v in values {
        list.add(*v).unwrap();
    }
    list
}

fn contents(list: &LinkedIoList<u64>) -> Vec<u64> {
    list.iter().collect::<Result<Vec<_>, _>>().unwrap()
}

// =============================================================================
// Head and Tail Tests
// =============================================================================

#[test]
fn test_add_appends_in_order() {
    let storage = Storage::memory();
    let list = list_of(&storage, &[1, 2, 3]);

    assert_eq!(list.len(), 3);
    assert_eq!(contents(&list), vec![1, 2, 3]);
    list.validate().unwrap();
}

#[test]
fn test_push_and_pop_front() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &[2]);

    list.push_front(1).unwrap();
    assert_eq!(contents(&list), vec![1, 2]);

    assert_eq!(list.pop_front().unwrap(), Some(1));
    assert_eq!(list.pop_front().unwrap(), Some(2));
    assert_eq!(list.pop_front().unwrap(), None);
    assert!(list.is_empty());
}

// =============================================================================
// Indexed Operation Tests
// =============================================================================

#[test]
fn test_get_and_set() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &[10, 20, 30]);

    assert_eq!(list.get(2).unwrap(), 30);
    assert_eq!(list.set(1, 25).unwrap(), 20);
    assert_eq!(list.get(1).unwrap(), 25);
    assert!(matches!(
        list.get(3),
        Err(IoCollError::IndexOutOfBounds { index: 3, len: 3 })
    ));
}

#[test]
fn test_insert_middle_and_end() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &[1, 3]);

    list.insert(1, 2).unwrap();
    list.insert(3, 4).unwrap();
    list.insert(0, 0).unwrap();

    assert_eq!(contents(&list), vec![0, 1, 2, 3, 4]);
    assert!(list.insert(9, 9).is_err());
    list.validate().unwrap();
}

#[test]
fn test_remove_anywhere() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &[1, 2, 3, 4, 5]);

    assert_eq!(list.remove(2).unwrap(), 3);
    assert_eq!(list.remove(0).unwrap(), 1);
    assert_eq!(list.remove(2).unwrap(), 5);

    assert_eq!(contents(&list), vec![2, 4]);
    list.validate().unwrap();
}

#[test]
fn test_cursor_survives_mutations() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &(0..20).collect::<Vec<_>>());

    // Park the cursor deep in the list, then shift everything
    assert_eq!(list.get(15).unwrap(), 15);
    list.push_front(100).unwrap();
    assert_eq!(list.get(16).unwrap(), 15);
    list.pop_front().unwrap();
    list.pop_front().unwrap();
    assert_eq!(list.get(0).unwrap(), 1);
    assert_eq!(list.get(14).unwrap(), 15);

    list.remove(5).unwrap();
    assert_eq!(list.get(5).unwrap(), 7);
}

#[test]
fn test_contains() {
    let storage = Storage::memory();
    let list = list_of(&storage, &[4, 8, 15]);

    assert!(list.contains(&8).unwrap());
    assert!(!list.contains(&16).unwrap());
}

// =============================================================================
// Whole-list Tests
// =============================================================================

#[test]
fn test_add_many_onto_existing() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &[1]);

    list.add_many(vec![2, 3, 4]).unwrap();
    list.add_many(Vec::new()).unwrap();

    assert_eq!(contents(&list), vec![1, 2, 3, 4]);
    list.validate().unwrap();
}

#[test]
fn test_clear_frees_cells() {
    let storage = Storage::memory();
    let mut list = list_of(&storage, &[1, 2, 3]);

    list.clear().unwrap();

    assert!(list.is_empty());
    assert_eq!(storage.stats().chunks, 1);
    list.add(7).unwrap();
    assert_eq!(contents(&list), vec![7]);
}

#[test]
fn test_free_releases_header() {
    let storage = Storage::memory();
    let list = list_of(&storage, &[1, 2]);
    list.free().unwrap();
    assert_eq!(storage.stats().chunks, 0);
}

#[test]
fn test_reopen() {
    let storage = Storage::memory();
    let config = Config::default();
    let ptr = {
        let list = list_of(&storage, &[5, 6, 7]);
        list.ptr()
    };

    let mut list: LinkedIoList<u64> = LinkedIoList::open(&storage, ptr, &config).unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.get(1).unwrap(), 6);
}

#[test]
fn test_string_values() {
    let storage = Storage::memory();
    let mut list = LinkedIoList::create(&storage, &Config::default()).unwrap();
    list.add("one".to_string()).unwrap();
    list.add("two".to_string()).unwrap();
    list.set(0, "uno".to_string()).unwrap();

    let values: Vec<String> = list.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(values, vec!["uno".to_string(), "two".to_string()]);
}
