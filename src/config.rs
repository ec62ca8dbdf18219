//! Configuration for logdb
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::datadb::DiskBudget;
use crate::error::LogDbError;

/// Callback invoked when a background worker hits a fatal error
pub type FatalHandler = Arc<dyn Fn(&LogDbError) + Send + Sync>;

/// Upper bound for a single part produced by any merge
pub const MAX_BIG_PART_SIZE: u64 = 1_000_000_000_000;

/// Configuration of one partition (one datadb instance)
#[derive(Clone)]
pub struct DatadbConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Partition directory. Internal structure:
    ///   {path}/
    ///     ├── parts.json       (names of small and big parts)
    ///     └── {016X merge idx}/ (one directory per file part)
    pub path: PathBuf,

    // -------------------------------------------------------------------------
    // Flush Configuration
    // -------------------------------------------------------------------------
    /// In-memory parts older than this are converted to file parts
    pub flush_interval: Duration,

    /// Rows sitting in a row-buffer shard longer than this are packed into a part
    pub rows_buffer_flush_interval: Duration,

    /// Number of row-buffer shards
    pub rows_buffer_shards: usize,

    // -------------------------------------------------------------------------
    // Merge Configuration
    // -------------------------------------------------------------------------
    /// Concurrent merges allowed per tier
    pub merge_workers: usize,

    /// Memory budget used to derive the in-memory and small part ceilings
    pub memory_allowed_bytes: u64,

    /// Pins the in-memory part ceiling instead of deriving it from memory
    pub max_inmemory_part_size: Option<u64>,

    /// Disk space accounting shared by all partitions
    pub disk_budget: Arc<DiskBudget>,

    // -------------------------------------------------------------------------
    // Failure Handling
    // -------------------------------------------------------------------------
    /// Called once per fatal background error
    pub fatal_handler: FatalHandler,
}

impl Default for DatadbConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            path: PathBuf::from("./logdb_data"),
            flush_interval: Duration::from_secs(5),
            rows_buffer_flush_interval: Duration::from_secs(1),
            rows_buffer_shards: cpus,
            merge_workers: cpus,
            memory_allowed_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_inmemory_part_size: None,
            disk_budget: DiskBudget::global(),
            fatal_handler: Arc::new(default_fatal_handler),
        }
    }
}

impl fmt::Debug for DatadbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatadbConfig")
            .field("path", &self.path)
            .field("flush_interval", &self.flush_interval)
            .field("rows_buffer_flush_interval", &self.rows_buffer_flush_interval)
            .field("rows_buffer_shards", &self.rows_buffer_shards)
            .field("merge_workers", &self.merge_workers)
            .field("memory_allowed_bytes", &self.memory_allowed_bytes)
            .field("max_inmemory_part_size", &self.max_inmemory_part_size)
            .finish_non_exhaustive()
    }
}

impl DatadbConfig {
    /// Create a new config builder
    pub fn builder() -> DatadbConfigBuilder {
        DatadbConfigBuilder::default()
    }

    /// Largest part that may stay in memory
    pub fn max_inmemory_part_size(&self) -> u64 {
        if let Some(n) = self.max_inmemory_part_size {
            return n;
        }
        // 10% of the memory budget shared by up to 20 in-memory parts
        let n = (0.1 * self.memory_allowed_bytes as f64 / 20.0) as u64;
        n.max(1_000_000)
    }

    /// Largest part kept in the small tier, bounded by what the disk can take
    pub fn max_small_part_size(&self, max_out_bytes: u64) -> u64 {
        let n = (self.memory_allowed_bytes / 15).max(10_000_000);
        n.min(max_out_bytes)
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.rows_buffer_shards == 0 {
            return Err(LogDbError::Config("rows_buffer_shards must be positive".to_string()));
        }
        if self.merge_workers == 0 {
            return Err(LogDbError::Config("merge_workers must be positive".to_string()));
        }
        if self.flush_interval.is_zero() || self.rows_buffer_flush_interval.is_zero() {
            return Err(LogDbError::Config("flush intervals must be positive".to_string()));
        }
        Ok(())
    }
}

/// Logs the error and terminates the process
fn default_fatal_handler(err: &LogDbError) {
    tracing::error!(error = %err, "fatal storage error; terminating");
    std::process::exit(1);
}

/// Builder for DatadbConfig
#[derive(Default)]
pub struct DatadbConfigBuilder {
    config: DatadbConfig,
}

impl DatadbConfigBuilder {
    /// Set the partition directory
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the in-memory part flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set the row-buffer shard flush interval
    pub fn rows_buffer_flush_interval(mut self, interval: Duration) -> Self {
        self.config.rows_buffer_flush_interval = interval;
        self
    }

    /// Set the number of row-buffer shards
    pub fn rows_buffer_shards(mut self, shards: usize) -> Self {
        self.config.rows_buffer_shards = shards;
        self
    }

    /// Set the per-tier merge concurrency
    pub fn merge_workers(mut self, workers: usize) -> Self {
        self.config.merge_workers = workers;
        self
    }

    /// Set the memory budget (in bytes)
    pub fn memory_allowed_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_allowed_bytes = bytes;
        self
    }

    /// Pin the in-memory part ceiling (in bytes)
    pub fn max_inmemory_part_size(mut self, bytes: u64) -> Self {
        self.config.max_inmemory_part_size = Some(bytes);
        self
    }

    /// Use a dedicated disk budget instead of the process-wide one
    pub fn disk_budget(mut self, budget: Arc<DiskBudget>) -> Self {
        self.config.disk_budget = budget;
        self
    }

    /// Replace the fatal error handler
    pub fn fatal_handler(mut self, handler: impl Fn(&LogDbError) + Send + Sync + 'static) -> Self {
        self.config.fatal_handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> DatadbConfig {
        self.config
    }
}
