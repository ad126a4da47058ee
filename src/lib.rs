//! # iocoll
//!
//! Maps, sets, lists and tries whose every node lives in a block-oriented
//! chunk store instead of process memory:
//! - Variable-width integer encodings chosen per collection
//! - Growable, fragment-tolerant chunks with in-place width migration
//! - Transaction groups for every multi-step mutation
//! - Optional durability through a write-ahead log and checkpoint image
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HashIoMap   IoHashSet   IoTreeSet   PrefixTree  LinkedIoList│
//! └───────┬──────────┬───────────┬───────────┬───────────┬──────┘
//!         │          │           │           │           │
//!         ▼          ▼           ▼           ▼           ▼
//!   ┌──────────────────────┐  ┌──────────────────────────────┐
//!   │ Cell (linked nodes)  │  │ ContiguousArray (flat slots) │
//!   └──────────┬───────────┘  └──────────────┬───────────────┘
//!              └───────────────┬─────────────┘
//!                              ▼
//!                 ┌─────────────────────────┐
//!                 │ Storage (ChunkStore)    │
//!                 │ MemoryStore | FileStore │──► WAL + checkpoint image
//!                 └─────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod storage;
pub mod wal;

pub mod cache;
pub mod cell;
pub mod array;
pub mod list;
pub mod map;
pub mod hashset;
pub mod slots;
pub mod tree;
pub mod trie;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{IoCollError, Result};
pub use config::{Config, WalSyncStrategy};
pub use codec::{IoValue, NumberSize, ValueStorage};
pub use storage::{ChunkPtr, ChunkStore, FileStore, MemoryStore, Storage};

pub use array::ContiguousArray;
pub use cell::Cell;
pub use hashset::IoHashSet;
pub use list::LinkedIoList;
pub use map::{EntryRef, HashIoMap, MapStats};
pub use tree::IoTreeSet;
pub use trie::PrefixTree;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of iocoll
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
