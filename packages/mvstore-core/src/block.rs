//! Physical block layout.
//!
//! A block is a header followed by one mini-block per column:
//!
//! ```text
//! +----------+-------------+-----------+----------------------------+
//! | block_id | num_records | num_slots | column_offsets[num_columns] |  u32 each
//! +----------+-------------+-----------+----------------------------+
//! | num_columns (u16) | attr_sizes[num_columns] (u8) | pad to 8      |
//! +--------------------------------------------------+---------------+
//! | mini-block 0 | mini-block 1 | ...                                |
//! +------------------------------------------------------------------+
//!
//! mini-block: | null bitmap (num_slots bits, pad to 8) | values (pad to 8) |
//! ```
//!
//! All header fields are little-endian. Column 0 is the 8-byte version
//! pointer column and its bitmap doubles as the slot allocation bitmap.
//! Mini-blocks and value arrays start on 8-byte boundaries, so every value is
//! naturally aligned for its width.
//!
//! Column offsets are not `header + sum(attr_size * num_slots)` over the
//! preceding columns: each preceding mini-block also contributes its null
//! bitmap, padded to 8 bytes, and its value array is padded to 8 bytes. A
//! layout that only summed value arrays would place each bitmap on top of the
//! previous column's values.

use std::sync::atomic::Ordering;

use crate::bitmap::bitmap_size;
use crate::error::StorageError;
use crate::raw_block::RawBlock;

/// Column holding the version chain head of every tuple.
pub const VERSION_POINTER_COLUMN: u16 = 0;

/// Attribute widths a column may have.
pub const SUPPORTED_ATTR_SIZES: [u8; 4] = [1, 2, 4, 8];

const BLOCK_ID_OFFSET: usize = 0;
const NUM_RECORDS_OFFSET: usize = 4;
const NUM_SLOTS_OFFSET: usize = 8;
const COLUMN_OFFSETS_OFFSET: usize = 12;

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Immutable description of how a block is carved up for one table schema.
///
/// Shared read-only by every block of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    num_columns: u16,
    attr_sizes: Vec<u8>,
    block_size: usize,
    header_size: u32,
    tuple_size: u32,
    num_slots: u32,
    bitmap_region_size: u32,
    column_offsets: Vec<u32>,
}

impl BlockLayout {
    /// Creates a layout for the given attribute widths.
    ///
    /// # Arguments
    /// * `attr_sizes` - Width of each column in bytes; column 0 must be 8
    /// * `block_size` - Block size in bytes (power of two)
    ///
    /// # Returns
    /// `Result<BlockLayout, StorageError>` containing the layout or an error.
    pub fn new(attr_sizes: Vec<u8>, block_size: usize) -> Result<Self, StorageError> {
        if attr_sizes.is_empty() {
            return Err(StorageError::InvalidLayout(
                "layout needs at least the version pointer column".to_string(),
            ));
        }
        let num_columns = u16::try_from(attr_sizes.len()).map_err(|_| {
            StorageError::InvalidLayout(format!("{} columns exceed u16", attr_sizes.len()))
        })?;
        if let Some((col, size)) = attr_sizes
            .iter()
            .enumerate()
            .find(|(_, size)| !SUPPORTED_ATTR_SIZES.contains(size))
        {
            return Err(StorageError::InvalidLayout(format!(
                "column {} has unsupported width {}",
                col, size
            )));
        }
        if attr_sizes[VERSION_POINTER_COLUMN as usize] != 8 {
            return Err(StorageError::InvalidLayout(format!(
                "version pointer column must be 8 bytes, got {}",
                attr_sizes[0]
            )));
        }
        if !block_size.is_power_of_two() || block_size > u32::MAX as usize {
            return Err(StorageError::InvalidLayout(format!(
                "block size {} must be a power of two below 4 GiB",
                block_size
            )));
        }

        let header_size = Self::compute_header_size(num_columns);
        let tuple_size: usize = attr_sizes.iter().map(|&s| s as usize).sum();
        let num_slots = Self::compute_num_slots(&attr_sizes, header_size, tuple_size, block_size);
        if num_slots == 0 {
            return Err(StorageError::InvalidLayout(format!(
                "no tuple of {} bytes across {} columns fits a {} byte block",
                tuple_size, num_columns, block_size
            )));
        }

        let bitmap_region_size = align8(bitmap_size(num_slots));
        let mut column_offsets = Vec::with_capacity(attr_sizes.len());
        let mut offset = align8(header_size);
        for &size in &attr_sizes {
            column_offsets.push(offset as u32);
            offset += bitmap_region_size + align8(size as usize * num_slots);
        }
        debug_assert!(offset <= block_size);

        Ok(Self {
            num_columns,
            attr_sizes,
            block_size,
            header_size: header_size as u32,
            tuple_size: tuple_size as u32,
            num_slots: num_slots as u32,
            bitmap_region_size: bitmap_region_size as u32,
            column_offsets,
        })
    }

    fn compute_header_size(num_columns: u16) -> usize {
        let n = num_columns as usize;
        4 * 3 // block_id, num_records, num_slots
            + 4 * n // column offsets
            + 2 // num_columns
            + n // attr_sizes
    }

    fn footprint(attr_sizes: &[u8], header_size: usize, num_slots: usize) -> usize {
        let bitmap = align8(bitmap_size(num_slots));
        align8(header_size)
            + attr_sizes
                .iter()
                .map(|&size| bitmap + align8(size as usize * num_slots))
                .sum::<usize>()
    }

    fn compute_num_slots(
        attr_sizes: &[u8],
        header_size: usize,
        tuple_size: usize,
        block_size: usize,
    ) -> usize {
        if header_size >= block_size {
            return 0;
        }
        // Each slot costs its tuple bytes plus one bitmap bit per column.
        let mut slots = (8 * (block_size - header_size)) / (8 * tuple_size + attr_sizes.len());
        slots = slots.saturating_sub(1);
        while slots > 0 && Self::footprint(attr_sizes, header_size, slots) > block_size {
            slots -= 1;
        }
        slots
    }

    pub fn num_columns(&self) -> u16 {
        self.num_columns
    }

    pub fn attr_sizes(&self) -> &[u8] {
        &self.attr_sizes
    }

    /// Width of column `col` in bytes.
    #[inline]
    pub fn attr_size(&self, col: u16) -> u8 {
        self.attr_sizes[col as usize]
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Unpadded header size in bytes.
    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Sum of all attribute widths.
    pub fn tuple_size(&self) -> u32 {
        self.tuple_size
    }

    /// Maximum tuples per block.
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Byte offset of column `col`'s mini-block from the block start.
    #[inline]
    pub fn column_offset(&self, col: u16) -> usize {
        self.column_offsets[col as usize] as usize
    }

    /// Byte offset of the first value of column `col`.
    #[inline]
    pub fn values_offset(&self, col: u16) -> usize {
        self.column_offset(col) + self.bitmap_region_size as usize
    }

    /// Byte offset of slot `offset`'s value in column `col`.
    #[inline]
    pub fn value_offset(&self, col: u16, offset: u32) -> usize {
        self.values_offset(col) + offset as usize * self.attr_size(col) as usize
    }

    /// Returns `true` if `col` names a user column (anything but column 0).
    pub fn is_user_column(&self, col: u16) -> bool {
        col != VERSION_POINTER_COLUMN && col < self.num_columns
    }

    /// Projection list covering every user column in order.
    pub fn all_user_columns(&self) -> Vec<u16> {
        (1..self.num_columns).collect()
    }
}

/// Prepares a raw block to hold tuples of `layout`.
///
/// Zeroes the whole block, so every slot starts free and every value null,
/// then writes the header.
///
/// # Panics
/// Panics if the block size does not match the layout.
pub fn init_block(raw: &mut RawBlock, layout: &BlockLayout, block_id: u32) {
    assert_eq!(
        raw.size(),
        layout.block_size(),
        "block size does not match layout"
    );
    let bytes = raw.as_mut_slice();
    bytes.fill(0);

    let n = layout.num_columns() as usize;
    bytes[BLOCK_ID_OFFSET..BLOCK_ID_OFFSET + 4].copy_from_slice(&block_id.to_le_bytes());
    bytes[NUM_RECORDS_OFFSET..NUM_RECORDS_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
    bytes[NUM_SLOTS_OFFSET..NUM_SLOTS_OFFSET + 4]
        .copy_from_slice(&layout.num_slots().to_le_bytes());

    let mut pos = COLUMN_OFFSETS_OFFSET;
    for col in 0..layout.num_columns() {
        let offset = layout.column_offset(col) as u32;
        bytes[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
        pos += 4;
    }
    bytes[pos..pos + 2].copy_from_slice(&layout.num_columns().to_le_bytes());
    pos += 2;
    bytes[pos..pos + n].copy_from_slice(layout.attr_sizes());
}

/// Read view over an initialized block's header.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader<'a> {
    raw: &'a RawBlock,
    num_columns: usize,
}

impl<'a> BlockHeader<'a> {
    /// Creates a header view. `layout` only supplies the column count needed
    /// to locate the trailing header fields; every value is read from the
    /// block itself.
    pub fn new(raw: &'a RawBlock, layout: &BlockLayout) -> Self {
        Self {
            raw,
            num_columns: layout.num_columns() as usize,
        }
    }

    pub fn block_id(&self) -> u32 {
        self.raw.load(BLOCK_ID_OFFSET, 4, Ordering::Acquire) as u32
    }

    /// Tuples allocated in this block so far.
    pub fn num_records(&self) -> u32 {
        self.raw.load(NUM_RECORDS_OFFSET, 4, Ordering::Acquire) as u32
    }

    pub fn num_slots(&self) -> u32 {
        self.raw.load(NUM_SLOTS_OFFSET, 4, Ordering::Acquire) as u32
    }

    /// Column offset as recorded in the header.
    pub fn column_offset(&self, col: u16) -> u32 {
        debug_assert!((col as usize) < self.num_columns);
        self.raw
            .load(COLUMN_OFFSETS_OFFSET + 4 * col as usize, 4, Ordering::Acquire) as u32
    }

    pub fn num_columns(&self) -> u16 {
        let pos = COLUMN_OFFSETS_OFFSET + 4 * self.num_columns;
        self.raw.load(pos, 2, Ordering::Acquire) as u16
    }

    /// Attribute width as recorded in the header.
    pub fn attr_size(&self, col: u16) -> u8 {
        debug_assert!((col as usize) < self.num_columns);
        let pos = COLUMN_OFFSETS_OFFSET + 4 * self.num_columns + 2 + col as usize;
        self.raw.load(pos, 1, Ordering::Acquire) as u8
    }

    /// Records one more allocated tuple.
    pub(crate) fn increment_num_records(&self) {
        let cell = self.raw.atomic_u32(NUM_RECORDS_OFFSET);
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let next = (u32::from_le(current) + 1).to_le();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
