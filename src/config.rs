//! Configuration for iocoll
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

/// Tuning knobs shared by the stores and collections
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // File Store Configuration
    // -------------------------------------------------------------------------
    /// Root directory for a durable store
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── store.img        (last checkpoint image)
    ///     └── wal.log          (write-ahead log since that checkpoint)
    pub data_dir: PathBuf,

    /// Sync strategy: how often to fsync the WAL
    pub wal_sync_strategy: WalSyncStrategy,

    /// WAL size (in bytes) that triggers an automatic checkpoint
    pub checkpoint_threshold: u64,

    // -------------------------------------------------------------------------
    // Hash Map Configuration
    // -------------------------------------------------------------------------
    /// Bucket count of a fresh map is 2^initial_bucket_po2
    pub initial_bucket_po2: u8,

    /// Number of candidate buckets probed per key
    pub probe_generations: usize,

    /// Maps with fewer entries than this reflow by rewiring in one transaction
    pub reflow_rewire_limit: u64,

    /// Buckets read per window while streaming a large reflow
    pub reflow_window: usize,

    /// Entries kept in the hot-bucket cache
    pub bucket_cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Array / Tree Configuration
    // -------------------------------------------------------------------------
    /// Size of the staging buffer used by bulk copies (in bytes)
    pub staging_buffer_bytes: usize,

    /// Fragments a chunk chain may reach before it is defragmented
    pub defrag_chain_limit: usize,

    /// Maximum trailing fragments merged in one defragmentation step
    pub defrag_step_budget: usize,

    /// Entries kept in the tree node cache
    pub node_cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Debugging
    // -------------------------------------------------------------------------
    /// Run structural validation after every mutation
    pub validate: bool,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./iocoll_data"),
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            checkpoint_threshold: 4 * 1024 * 1024, // 4 MB
            initial_bucket_po2: 2,
            probe_generations: 3,
            reflow_rewire_limit: 256,
            reflow_window: 64,
            bucket_cache_capacity: 32,
            staging_buffer_bytes: 4096,
            defrag_chain_limit: 8,
            defrag_step_budget: 4,
            node_cache_capacity: 64,
            validate: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory of a durable store
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the WAL size that triggers a checkpoint (in bytes)
    pub fn checkpoint_threshold(mut self, bytes: u64) -> Self {
        self.config.checkpoint_threshold = bytes;
        self
    }

    /// Set the starting bucket power of new hash maps
    pub fn initial_bucket_po2(mut self, po2: u8) -> Self {
        self.config.initial_bucket_po2 = po2;
        self
    }

    /// Set the number of candidate buckets per key
    pub fn probe_generations(mut self, generations: usize) -> Self {
        self.config.probe_generations = generations.max(1);
        self
    }

    /// Set the entry count below which reflow rewires in place
    pub fn reflow_rewire_limit(mut self, limit: u64) -> Self {
        self.config.reflow_rewire_limit = limit;
        self
    }

    /// Set the number of buckets per streaming reflow window
    pub fn reflow_window(mut self, window: usize) -> Self {
        self.config.reflow_window = window.max(1);
        self
    }

    /// Set the hot-bucket cache capacity
    pub fn bucket_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.bucket_cache_capacity = capacity;
        self
    }

    /// Set the staging buffer size used by bulk copies (in bytes)
    pub fn staging_buffer_bytes(mut self, bytes: usize) -> Self {
        self.config.staging_buffer_bytes = bytes.max(1);
        self
    }

    /// Set the fragment count that triggers defragmentation
    pub fn defrag_chain_limit(mut self, limit: usize) -> Self {
        self.config.defrag_chain_limit = limit.max(2);
        self
    }

    /// Set the number of fragments merged per defragmentation step
    pub fn defrag_step_budget(mut self, budget: usize) -> Self {
        self.config.defrag_step_budget = budget.max(2);
        self
    }

    /// Set the tree node cache capacity
    pub fn node_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.node_cache_capacity = capacity;
        self
    }

    /// Enable or disable validation after every mutation
    pub fn validate(mut self, enabled: bool) -> Self {
        self.config.validate = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
