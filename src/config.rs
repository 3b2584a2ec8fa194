use std::path::PathBuf;

/// Configuration for a strata engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database (default: ./data)
    pub data_dir: PathBuf,

    /// Memtable size that triggers a flush (default: 64 MiB)
    pub memtable_threshold_bytes: usize,

    /// Number of level-0 tables that triggers compaction (default: 4)
    pub l0_compaction_trigger: usize,

    /// Size ratio between adjacent levels (default: 10)
    pub level_size_multiplier: u64,

    /// Byte budget for level 1; level n holds this times
    /// `level_size_multiplier^(n-1)` (default: 64 MiB)
    pub base_level_bytes: u64,

    /// Size cap for a single compaction output file (default: 256 MiB)
    pub max_output_file_bytes: u64,

    /// LRU cache capacity in bytes (default: 128 MiB)
    pub cache_capacity_bytes: usize,

    /// Record the compression flag in new SSTables (default: true)
    pub enable_compression: bool,

    /// Write a bloom block into new SSTables (default: true)
    pub enable_bloom_filter: bool,

    /// Bloom filter sizing target (default: 0.01)
    pub target_false_positive_rate: f64,

    /// Fsync the WAL before returning from put/delete (default: false)
    pub sync_on_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_threshold_bytes: 64 * 1024 * 1024,
            l0_compaction_trigger: 4,
            level_size_multiplier: 10,
            base_level_bytes: 64 * 1024 * 1024,
            max_output_file_bytes: 256 * 1024 * 1024,
            cache_capacity_bytes: 128 * 1024 * 1024,
            enable_compression: true,
            enable_bloom_filter: true,
            target_false_positive_rate: 0.01,
            sync_on_write: false,
        }
    }
}

impl Config {
    /// Create a new config with the given data directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable flush threshold
    pub fn memtable_threshold_bytes(mut self, bytes: usize) -> Self {
        self.memtable_threshold_bytes = bytes;
        self
    }

    /// Set the level-0 compaction trigger
    pub fn l0_compaction_trigger(mut self, count: usize) -> Self {
        self.l0_compaction_trigger = count;
        self
    }

    /// Set the size ratio between adjacent levels
    pub fn level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    /// Set the byte budget for level 1
    pub fn base_level_bytes(mut self, bytes: u64) -> Self {
        self.base_level_bytes = bytes;
        self
    }

    /// Set the compaction output file size cap
    pub fn max_output_file_bytes(mut self, bytes: u64) -> Self {
        self.max_output_file_bytes = bytes;
        self
    }

    /// Set the cache capacity
    pub fn cache_capacity_bytes(mut self, bytes: usize) -> Self {
        self.cache_capacity_bytes = bytes;
        self
    }

    /// Enable or disable the compression flag for new SSTables
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    /// Enable or disable bloom blocks in new SSTables
    pub fn enable_bloom_filter(mut self, enabled: bool) -> Self {
        self.enable_bloom_filter = enabled;
        self
    }

    /// Set the bloom filter false-positive target
    pub fn target_false_positive_rate(mut self, rate: f64) -> Self {
        self.target_false_positive_rate = rate;
        self
    }

    /// Fsync the WAL on every write
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }
}
