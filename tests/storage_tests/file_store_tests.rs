//! Tests for the durable file store
//!
//! These tests verify:
//! - State survives close + reopen (checkpoint image)
//! - State survives a drop without close (WAL replay)
//! - Checkpoints truncate the WAL
//! - Rolled-back transactions never reach the WAL
//! - Damaged images are reported, not silently loaded

use iocoll::config::{Config, WalSyncStrategy};
use iocoll::storage::{ChunkPtr, ChunkStore, FileStore, Storage};
use iocoll::{IoCollError, Result};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config_for(temp_dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .build()
}

fn write_chunk(store: &mut FileStore, bytes: &[u8]) -> ChunkPtr {
    let ptr = store.allocate(bytes.len() as u64, None).unwrap();
    store.write(ptr, 0, bytes).unwrap();
    ptr
}

fn read_chunk(store: &FileStore, ptr: ChunkPtr) -> Vec<u8> {
    let mut buf = vec![0u8; store.size(ptr).unwrap() as usize];
    let n = store.read(ptr, 0, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_after_close() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    let ptr = {
        let mut store = FileStore::open(&config).unwrap();
        let ptr = write_chunk(&mut store, b"persisted bytes");
        store.set_root("main", ptr).unwrap();
        store.close().unwrap();
        ptr
    };

    let store = FileStore::open(&config).unwrap();
    assert_eq!(store.root("main"), Some(ptr));
    assert_eq!(read_chunk(&store, ptr), b"persisted bytes");
    assert!(temp_dir.path().join("store.img").exists());
}

#[test]
fn test_wal_replay_after_drop_without_close() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    let ptr = {
        let mut store = FileStore::open(&config).unwrap();
        let ptr = write_chunk(&mut store, b"only in the log");
        store.set_root("main", ptr).unwrap();
        assert!(store.wal_size() > 0);
        ptr
        // Dropped without a checkpoint
    };

    let store = FileStore::open(&config).unwrap();
    assert_eq!(store.root("main"), Some(ptr));
    assert_eq!(read_chunk(&store, ptr), b"only in the log");
}

#[test]
fn test_storage_handle_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    let ptr = {
        let storage = Storage::file(&config).unwrap();
        let ptr = storage.allocate(8, None).unwrap();
        storage
            .transaction(|| {
                storage.write(ptr, 0, b"grouped")?;
                storage.set_root("main", ptr)
            })
            .unwrap();
        storage.flush().unwrap();
        ptr
    };

    let storage = Storage::file(&config).unwrap();
    assert_eq!(storage.root("main"), Some(ptr));
    assert_eq!(storage.read_from(ptr, 0).unwrap(), b"grouped");
}

#[test]
fn test_freed_chunk_stays_freed() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    let (kept, freed) = {
        let mut store = FileStore::open(&config).unwrap();
        let kept = write_chunk(&mut store, b"kept");
        let freed = write_chunk(&mut store, b"freed");
        store.free(freed).unwrap();
        (kept, freed)
    };

    let store = FileStore::open(&config).unwrap();
    assert_eq!(read_chunk(&store, kept), b"kept");
    assert!(matches!(
        store.size(freed),
        Err(IoCollError::InvalidPointer(_))
    ));
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[test]
fn test_checkpoint_truncates_wal() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&config_for(&temp_dir)).unwrap();
    write_chunk(&mut store, &[7u8; 100]);
    assert!(store.wal_size() > 0);

    store.checkpoint().unwrap();

    assert_eq!(store.wal_size(), 0);
    let on_disk = std::fs::metadata(temp_dir.path().join("wal.log")).unwrap().len();
    assert_eq!(on_disk, 0);
}

#[test]
fn test_threshold_triggers_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .checkpoint_threshold(1)
        .build();
    let mut store = FileStore::open(&config).unwrap();

    write_chunk(&mut store, b"tiny");

    assert_eq!(store.wal_size(), 0);
    assert!(temp_dir.path().join("store.img").exists());
}

#[test]
fn test_writes_after_checkpoint_are_replayed() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    let (a, b) = {
        let mut store = FileStore::open(&config).unwrap();
        let a = write_chunk(&mut store, b"before");
        store.checkpoint().unwrap();
        let b = write_chunk(&mut store, b"after");
        (a, b)
    };

    let store = FileStore::open(&config).unwrap();
    assert_eq!(read_chunk(&store, a), b"before");
    assert_eq!(read_chunk(&store, b), b"after");
}

// =============================================================================
// Transaction Tests
// =============================================================================

#[test]
fn test_transaction_logged_only_on_commit() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&config_for(&temp_dir)).unwrap();
    let ptr = write_chunk(&mut store, b"base");
    let before = store.wal_size();

    store.begin_transaction();
    store.write(ptr, 0, b"next").unwrap();
    assert_eq!(store.wal_size(), before);
    store.commit_transaction().unwrap();

    assert!(store.wal_size() > before);
}

#[test]
fn test_aborted_transaction_not_logged() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    let ptr = {
        let mut store = FileStore::open(&config).unwrap();
        let ptr = write_chunk(&mut store, b"base");
        let before = store.wal_size();

        store.begin_transaction();
        store.write(ptr, 0, b"gone").unwrap();
        store.allocate(64, None).unwrap();
        store.abort_transaction().unwrap();

        assert_eq!(store.wal_size(), before);
        ptr
    };

    let store = FileStore::open(&config).unwrap();
    assert_eq!(read_chunk(&store, ptr), b"base");
    assert_eq!(store.stats().chunks, 1);
}

#[test]
fn test_failed_storage_transaction_leaves_disk_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);

    {
        let storage = Storage::file(&config).unwrap();
        let result: Result<()> = storage.transaction(|| {
            let ptr = storage.allocate(16, None)?;
            storage.set_root("main", ptr)?;
            Err(IoCollError::Storage("abandon".to_string()))
        });
        assert!(result.is_err());
    }

    let storage = Storage::file(&config).unwrap();
    assert_eq!(storage.root("main"), None);
    assert_eq!(storage.stats().chunks, 0);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_corrupt_image_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_for(&temp_dir);
    {
        let mut store = FileStore::open(&config).unwrap();
        write_chunk(&mut store, b"data");
        store.close().unwrap();
    }

    let image_path = temp_dir.path().join("store.img");
    let mut bytes = std::fs::read(&image_path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    std::fs::write(&image_path, &bytes).unwrap();

    let err = FileStore::open(&config).err().unwrap();
    assert!(err.is_corruption());
}

#[test]
fn test_bad_magic_rejected() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("store.img"), vec![0u8; 128]).unwrap();

    let err = FileStore::open(&config_for(&temp_dir)).err().unwrap();
    assert!(err.is_corruption());
}
