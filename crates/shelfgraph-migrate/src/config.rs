//! Migration configuration.

use std::path::PathBuf;

use shelfgraph_store::StoreConfig;

/// Default relational snapshot path.
pub const DEFAULT_SOURCE: &str = "data/books.db";

/// Default graph store directory.
pub const DEFAULT_TARGET: &str = "data/graph";

/// Default backup directory.
pub const DEFAULT_BACKUP_DIR: &str = "data/backups";

/// Default number of writes per store batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of records checked from each end of every collection.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// Default store page cache (64 MB).
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Migration run configuration.
///
/// Built once and handed to [`crate::MigrationOrchestrator::new`]; the run
/// never changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Relational snapshot to migrate.
    pub source: PathBuf,

    /// Graph store directory.
    pub target: PathBuf,

    /// Directory receiving the pre-migration backup.
    pub backup_dir: PathBuf,

    /// Writes per store batch.
    pub batch_size: usize,

    /// Records compared from the start and the end of each collection.
    pub sample_size: usize,

    /// Page cache for the target store in bytes.
    pub cache_capacity: u64,
}

impl MigrationConfig {
    /// Create a configuration for a source and target, with defaults elsewhere.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Set the backup directory.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the verification sample size.
    pub fn with_sample_size(mut self, size: usize) -> Self {
        self.sample_size = size;
        self
    }

    /// Set the store page cache capacity.
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Store configuration for the target.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.target)
            .with_cache_capacity(self.cache_capacity)
            .with_flush_every_ms(None)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE, DEFAULT_TARGET)
    }
}
