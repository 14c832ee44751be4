//! Storage configuration.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Default block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Smallest block size accepted by validation.
pub const MIN_BLOCK_SIZE: usize = 1 << 12;

/// Largest block size accepted by validation. Slot offsets must fit in `u32`.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Storage configuration.
///
/// The block size is threaded through `BlockLayout`, `BlockPool` and
/// `DataTable` construction, so tables with different block sizes can live in
/// one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Block size in bytes (power of two, also the block alignment)
    pub block_size: usize,
    /// Released blocks kept for reuse before the pool starts freeing them
    pub block_pool_reuse_limit: usize,
    /// Maximum blocks outstanding from one pool (default: unlimited)
    pub block_pool_capacity: usize,
    /// Capacity of each table's block directory
    pub max_blocks_per_table: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_pool_reuse_limit: 16,
            block_pool_capacity: usize::MAX,
            max_blocks_per_table: 4096,
        }
    }
}

impl StorageConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Returns
    /// `Result<StorageConfig, StorageError>` with the validated configuration.
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        let config: StorageConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), StorageError> {
        if !self.block_size.is_power_of_two() {
            return Err(StorageError::InvalidConfig {
                field: "block_size",
                reason: format!("{} is not a power of two", self.block_size),
            });
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(StorageError::InvalidConfig {
                field: "block_size",
                reason: format!(
                    "{} outside [{}, {}]",
                    self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
                ),
            });
        }
        if self.block_pool_capacity == 0 {
            return Err(StorageError::InvalidConfig {
                field: "block_pool_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_blocks_per_table == 0 || self.max_blocks_per_table > u32::MAX as usize {
            return Err(StorageError::InvalidConfig {
                field: "max_blocks_per_table",
                reason: format!("{} outside [1, {}]", self.max_blocks_per_table, u32::MAX),
            });
        }
        Ok(())
    }
}
