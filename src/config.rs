//! Configuration for AtlasLog
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{AtlasError, Result};

/// Main configuration for a serializer instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Backing file. Internal structure:
    ///   extent 0        metablock slots
    ///   extent 1..N     data extents and LBA extents, interleaved
    pub db_path: PathBuf,

    /// I/O alignment granularity; every on-disk record is padded to it
    pub block_size: u64,

    /// Size of one extent, the unit of allocation and garbage collection
    pub extent_size: u64,

    /// Upper bound on the number of extents in the file (None = unbounded)
    pub max_extents: Option<u64>,

    /// When completed writes are forced to stable storage
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Metablock Configuration
    // -------------------------------------------------------------------------
    /// Number of rotating metablock slots
    pub metablock_slots: u32,

    // -------------------------------------------------------------------------
    // Garbage Collection Configuration
    // -------------------------------------------------------------------------
    /// GC starts when live bytes / capacity across filled extents drops below this
    pub gc_density_threshold: f64,

    /// GC also starts when more than this many data extents are in use
    pub gc_extent_budget: Option<u64>,

    // -------------------------------------------------------------------------
    // LBA Configuration
    // -------------------------------------------------------------------------
    /// Rewrite the LBA as a snapshot once on-disk entries exceed this multiple
    /// of the defined block ids
    pub lba_compaction_ratio: u64,
}

/// Sync strategy for completed writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// Leave flushing to the OS (tests, benchmarks)
    Never,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./atlaslog.db"),
            block_size: 4096,
            extent_size: 8 * 1024 * 1024, // 8 MB
            max_extents: None,
            sync_strategy: SyncStrategy::EveryWrite,
            metablock_slots: 4,
            gc_density_threshold: 0.5,
            gc_extent_budget: None,
            lba_compaction_ratio: 4,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Size of one metablock slot
    pub fn metablock_slot_size(&self) -> u64 {
        self.block_size.max(4096)
    }

    /// Check the geometry invariants the on-disk layout relies on
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(AtlasError::Config(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.extent_size == 0 || self.extent_size % self.block_size != 0 {
            return Err(AtlasError::Config(format!(
                "extent_size {} must be a non-zero multiple of block_size {}",
                self.extent_size, self.block_size
            )));
        }
        if self.metablock_slots < 2 {
            return Err(AtlasError::Config(
                "at least two metablock slots are required".to_string(),
            ));
        }
        let region = self.metablock_slot_size() * u64::from(self.metablock_slots);
        if region > self.extent_size {
            return Err(AtlasError::Config(format!(
                "metablock region of {} bytes does not fit in one extent of {} bytes",
                region, self.extent_size
            )));
        }
        if !(0.0..=1.0).contains(&self.gc_density_threshold) {
            return Err(AtlasError::Config(format!(
                "gc_density_threshold must be within [0, 1], got {}",
                self.gc_density_threshold
            )));
        }
        if self.max_extents.is_some_and(|max| max < 2) {
            return Err(AtlasError::Config(
                "max_extents must leave room for at least one data extent".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backing file path
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    /// Set the I/O alignment granularity (in bytes)
    pub fn block_size(mut self, size: u64) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the extent size (in bytes)
    pub fn extent_size(mut self, size: u64) -> Self {
        self.config.extent_size = size;
        self
    }

    /// Cap the number of extents the file may grow to
    pub fn max_extents(mut self, count: u64) -> Self {
        self.config.max_extents = Some(count);
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the number of metablock slots
    pub fn metablock_slots(mut self, slots: u32) -> Self {
        self.config.metablock_slots = slots;
        self
    }

    /// Set the GC live-density threshold
    pub fn gc_density_threshold(mut self, threshold: f64) -> Self {
        self.config.gc_density_threshold = threshold;
        self
    }

    /// Set the data extent budget that also triggers GC
    pub fn gc_extent_budget(mut self, count: u64) -> Self {
        self.config.gc_extent_budget = Some(count);
        self
    }

    /// Set the LBA compaction ratio
    pub fn lba_compaction_ratio(mut self, ratio: u64) -> Self {
        self.config.lba_compaction_ratio = ratio;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
