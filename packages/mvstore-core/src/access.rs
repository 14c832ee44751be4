//! Tuple access strategy: translates (slot, column) into block memory.
//!
//! Stateless apart from the shared layout. Every mutation is either a null-bit
//! flip or an atomic store into a value cell whose slot the writer already owns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bitmap::{bitmap_size, RawBitmap};
use crate::block::{BlockHeader, BlockLayout, VERSION_POINTER_COLUMN};
use crate::raw_block::RawBlock;

/// Handle to one attribute value inside a block.
///
/// Loads use acquire and stores use release ordering, so a reader that
/// observes a stored value also observes everything the writer published
/// before it, including the version chain head.
#[derive(Clone, Copy)]
pub struct AttrRef<'a> {
    block: &'a RawBlock,
    offset: usize,
    size: u8,
}

impl<'a> AttrRef<'a> {
    /// Reads the value, zero-extended to `u64`.
    #[inline]
    pub fn load(&self) -> u64 {
        self.block.load(self.offset, self.size, Ordering::Acquire)
    }

    /// Writes the value, truncated to the attribute width.
    #[inline]
    pub fn store(&self, value: u64) {
        self.block.store(self.offset, self.size, value, Ordering::Release)
    }

    /// Attribute width in bytes.
    pub fn size(&self) -> u8 {
        self.size
    }
}

impl fmt::Debug for AttrRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrRef")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Accessor over blocks sharing one layout.
#[derive(Debug, Clone)]
pub struct TupleAccessStrategy {
    layout: Arc<BlockLayout>,
}

impl TupleAccessStrategy {
    pub fn new(layout: Arc<BlockLayout>) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Returns the null bitmap of column `col`. For column 0 this is the
    /// slot allocation bitmap.
    #[inline]
    pub fn column_null_bitmap<'a>(&self, block: &'a RawBlock, col: u16) -> RawBitmap<'a> {
        let num_slots = self.layout.num_slots() as usize;
        let bits = block.atomic_bytes(self.layout.column_offset(col), bitmap_size(num_slots));
        RawBitmap::new(bits, num_slots)
    }

    /// Claims the lowest free slot of `block`.
    ///
    /// # Returns
    /// The slot offset, or `None` if the block is full. Losing a race for a
    /// slot moves on to the next free one, so `None` means no slot was free.
    pub fn allocate(&self, block: &RawBlock) -> Option<u32> {
        let offset = self
            .column_null_bitmap(block, VERSION_POINTER_COLUMN)
            .claim_first_unset(0)?;
        BlockHeader::new(block, &self.layout).increment_num_records();
        Some(offset as u32)
    }

    /// Returns `true` if slot `offset` of `block` has been allocated.
    pub fn is_allocated(&self, block: &RawBlock, offset: u32) -> bool {
        self.column_null_bitmap(block, VERSION_POINTER_COLUMN)
            .test(offset as usize)
    }

    #[inline]
    fn attr<'a>(&self, block: &'a RawBlock, offset: u32, col: u16) -> AttrRef<'a> {
        debug_assert!(offset < self.layout.num_slots());
        AttrRef {
            block,
            offset: self.layout.value_offset(col, offset),
            size: self.layout.attr_size(col),
        }
    }

    /// Returns the value of column `col` at slot `offset`, or `None` if it is
    /// null.
    #[inline]
    pub fn access_with_null_check<'a>(
        &self,
        block: &'a RawBlock,
        offset: u32,
        col: u16,
    ) -> Option<AttrRef<'a>> {
        if !self.column_null_bitmap(block, col).test(offset as usize) {
            return None;
        }
        Some(self.attr(block, offset, col))
    }

    /// Marks column `col` at slot `offset` present and returns its value cell.
    #[inline]
    pub fn access_force_not_null<'a>(
        &self,
        block: &'a RawBlock,
        offset: u32,
        col: u16,
    ) -> AttrRef<'a> {
        self.column_null_bitmap(block, col).flip(offset as usize, false);
        self.attr(block, offset, col)
    }

    /// Marks column `col` at slot `offset` null.
    #[inline]
    pub fn set_null(&self, block: &RawBlock, offset: u32, col: u16) {
        self.column_null_bitmap(block, col).flip(offset as usize, true);
    }

    /// Returns the version chain head cell of slot `offset`.
    #[inline]
    pub fn version_pointer<'a>(&self, block: &'a RawBlock, offset: u32) -> &'a AtomicU64 {
        debug_assert!(offset < self.layout.num_slots());
        block.atomic_u64(self.layout.value_offset(VERSION_POINTER_COLUMN, offset))
    }
}
