//! Block store: source and sink of raw blocks.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::raw_block::RawBlock;

/// Pooled allocator handing out block-size-aligned raw blocks.
pub trait BlockStore: Send + Sync {
    /// Size of every block this store hands out.
    fn block_size(&self) -> usize;

    /// Returns a recycled or freshly allocated block.
    ///
    /// Failure is resource exhaustion and is fatal to the calling operation.
    fn acquire(&self) -> Result<RawBlock, StorageError>;

    /// Returns a block to the store.
    fn release(&self, block: RawBlock);
}

/// Fixed-capacity object pool of raw blocks.
///
/// Released blocks are queued for reuse up to `reuse_limit`; past that they
/// are freed. At most `capacity` blocks may be outstanding at once.
#[derive(Debug)]
pub struct BlockPool {
    block_size: usize,
    reuse_limit: usize,
    capacity: usize,
    outstanding: AtomicUsize,
    reusable: Mutex<Vec<RawBlock>>,
}

impl BlockPool {
    /// Creates a pool from a validated configuration.
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        Ok(Self::with_limits(
            config.block_size,
            config.block_pool_reuse_limit,
            config.block_pool_capacity,
        ))
    }

    /// Creates a pool with explicit limits.
    ///
    /// # Panics
    /// Panics if `block_size` is not a power of two.
    pub fn with_limits(block_size: usize, reuse_limit: usize, capacity: usize) -> Self {
        assert!(
            block_size.is_power_of_two(),
            "block_size must be a power of two"
        );
        Self {
            block_size,
            reuse_limit,
            capacity,
            outstanding: AtomicUsize::new(0),
            reusable: Mutex::new(Vec::with_capacity(reuse_limit.min(64))),
        }
    }

    /// Blocks currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Blocks queued for reuse.
    pub fn reusable(&self) -> usize {
        self.reusable.lock().len()
    }
}

impl BlockStore for BlockPool {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn acquire(&self) -> Result<RawBlock, StorageError> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| {
                tracing::warn!("Block pool exhausted at {} blocks", self.capacity);
                StorageError::BlockStoreExhausted {
                    capacity: self.capacity,
                }
            })?;

        if let Some(block) = self.reusable.lock().pop() {
            return Ok(block);
        }
        RawBlock::allocate(self.block_size).inspect_err(|e| {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            tracing::error!("Block allocation failed: {}", e);
        })
    }

    fn release(&self, block: RawBlock) {
        debug_assert_eq!(block.size(), self.block_size);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut reusable = self.reusable.lock();
        if reusable.len() < self.reuse_limit {
            reusable.push(block);
        }
    }
}
