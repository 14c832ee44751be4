//! Projected rows: self-describing partial-row buffers.
//!
//! A projected row carries a subset of a tuple's columns in caller-owned
//! memory. It is used for inserts and updates (redo), selects (output) and
//! undo before-images. Layout, all fields little-endian:
//!
//! ```text
//! +-------------+---------------------------+------------------------------+
//! | num_columns | column_ids[num_columns]   | value_offsets[num_columns]   |
//! |    u16      |  u16 each                 |  u32 each, from row start    |
//! +-------------+---------------------------+------------------------------+
//! | null bitmap (ceil(num_columns / 8) bytes, 1 = present) | values ...    |
//! +---------------------------------------------------------+--------------+
//! ```
//!
//! The projection list order is the caller's; it need not be sorted or
//! contiguous. Positions (`i` below) index the projection list, not the
//! table's column ids.

use std::collections::HashSet;
use std::fmt;

use crate::bitmap::{bitmap_size, one_hot_mask, BYTE_SIZE};
use crate::block::BlockLayout;
use crate::error::StorageError;

const COLUMN_IDS_OFFSET: usize = 2;

/// Reads a little-endian integer of `size` bytes (1, 2, 4 or 8).
///
/// # Panics
/// Panics on any other size: that is a layout mismatch that would otherwise
/// read past the value into adjacent memory.
#[inline]
pub fn read_bytes(size: u8, src: &[u8]) -> u64 {
    match size {
        1 => src[0] as u64,
        2 => u16::from_le_bytes([src[0], src[1]]) as u64,
        4 => u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as u64,
        8 => u64::from_le_bytes([
            src[0], src[1], src[2], src[3], src[4], src[5], src[6], src[7],
        ]),
        _ => panic!("invalid attribute size {} in byte read", size),
    }
}

/// Writes `value` truncated to `size` bytes (1, 2, 4 or 8), little-endian.
///
/// # Panics
/// Panics on any other size.
#[inline]
pub fn write_bytes(size: u8, value: u64, dst: &mut [u8]) {
    match size {
        1 => dst[0] = value as u8,
        2 => dst[..2].copy_from_slice(&(value as u16).to_le_bytes()),
        4 => dst[..4].copy_from_slice(&(value as u32).to_le_bytes()),
        8 => dst[..8].copy_from_slice(&value.to_le_bytes()),
        _ => panic!("invalid attribute size {} in byte write", size),
    }
}

#[inline]
fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

#[inline]
fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

#[inline]
const fn value_offsets_start(num_columns: usize) -> usize {
    COLUMN_IDS_OFFSET + 2 * num_columns
}

#[inline]
const fn bitmap_start(num_columns: usize) -> usize {
    COLUMN_IDS_OFFSET + 6 * num_columns
}

#[inline]
const fn header_size(num_columns: usize) -> usize {
    bitmap_start(num_columns) + bitmap_size(num_columns)
}

fn validate_projection(layout: &BlockLayout, column_ids: &[u16]) -> Result<(), StorageError> {
    if column_ids.len() > u16::MAX as usize {
        return Err(StorageError::MalformedRow(format!(
            "{} projected columns exceed u16",
            column_ids.len()
        )));
    }
    let mut seen = HashSet::with_capacity(column_ids.len());
    for &col in column_ids {
        if !layout.is_user_column(col) {
            return Err(StorageError::ColumnOutOfRange {
                column: col,
                num_columns: layout.num_columns(),
            });
        }
        if !seen.insert(col) {
            return Err(StorageError::MalformedRow(format!(
                "column {} projected twice",
                col
            )));
        }
    }
    Ok(())
}

/// Maps table column ids to positions in one projected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionMap {
    positions: Vec<Option<u16>>,
}

impl ProjectionMap {
    /// Builds the map for a projection list over a layout of `num_columns`.
    pub fn new(column_ids: impl IntoIterator<Item = u16>, num_columns: u16) -> Self {
        let mut positions = vec![None; num_columns as usize];
        for (i, col) in column_ids.into_iter().enumerate() {
            positions[col as usize] = Some(i as u16);
        }
        Self { positions }
    }

    /// Position of column `col`, if projected.
    #[inline]
    pub fn get(&self, col: u16) -> Option<u16> {
        self.positions.get(col as usize).copied().flatten()
    }
}

/// View over a projected row stored in `B`.
///
/// Only constructible through `initialize` or `from_bytes`, which validate
/// the header against a layout.
#[derive(Clone)]
pub struct ProjectedRow<B> {
    buf: B,
}

impl ProjectedRow<Vec<u8>> {
    /// Exact byte footprint of a row projecting `column_ids`.
    ///
    /// # Returns
    /// `Result<usize, StorageError>`; fails if a column id is 0, out of
    /// range, or repeated.
    pub fn size(layout: &BlockLayout, column_ids: &[u16]) -> Result<usize, StorageError> {
        validate_projection(layout, column_ids)?;
        Ok(header_size(column_ids.len())
            + column_ids
                .iter()
                .map(|&col| layout.attr_size(col) as usize)
                .sum::<usize>())
    }

    /// Allocates a zeroed buffer of the right size and initializes a row in
    /// it.
    pub fn allocate(layout: &BlockLayout, column_ids: &[u16]) -> Result<Self, StorageError> {
        let size = Self::size(layout, column_ids)?;
        ProjectedRow::initialize(vec![0u8; size], layout, column_ids)
    }
}

impl<B: AsRef<[u8]>> ProjectedRow<B> {
    /// Wraps bytes that already hold a projected row.
    ///
    /// # Returns
    /// `Result<ProjectedRow<B>, StorageError>`; fails if the header does not
    /// fit, names columns the layout lacks, or points values outside `buf`.
    pub fn from_bytes(buf: B, layout: &BlockLayout) -> Result<Self, StorageError> {
        let bytes = buf.as_ref();
        if bytes.len() < COLUMN_IDS_OFFSET {
            return Err(StorageError::BufferTooSmall {
                required: COLUMN_IDS_OFFSET,
                actual: bytes.len(),
            });
        }
        let n = read_u16(bytes, 0) as usize;
        let header = header_size(n);
        if bytes.len() < header {
            return Err(StorageError::BufferTooSmall {
                required: header,
                actual: bytes.len(),
            });
        }
        let column_ids: Vec<u16> = (0..n)
            .map(|i| read_u16(bytes, COLUMN_IDS_OFFSET + 2 * i))
            .collect();
        validate_projection(layout, &column_ids)?;
        for (i, &col) in column_ids.iter().enumerate() {
            let offset = read_u32(bytes, value_offsets_start(n) + 4 * i) as usize;
            let end = offset + layout.attr_size(col) as usize;
            if offset < header || end > bytes.len() {
                return Err(StorageError::MalformedRow(format!(
                    "value of column {} at [{}, {}) outside [{}, {})",
                    col,
                    offset,
                    end,
                    header,
                    bytes.len()
                )));
            }
        }
        Ok(Self { buf })
    }

    /// Wraps bytes written by `initialize` without revalidating them.
    pub(crate) fn from_initialized(buf: B) -> Self {
        Self { buf }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Number of projected columns.
    #[inline]
    pub fn num_columns(&self) -> u16 {
        read_u16(self.bytes(), 0)
    }

    /// Table column id at projection position `i`.
    #[inline]
    pub fn column_id(&self, i: u16) -> u16 {
        read_u16(self.bytes(), COLUMN_IDS_OFFSET + 2 * i as usize)
    }

    /// The projection list in order.
    pub fn column_ids(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.num_columns()).map(move |i| self.column_id(i))
    }

    /// Byte offset of position `i`'s value from the row start.
    #[inline]
    pub fn value_offset(&self, i: u16) -> u32 {
        let n = self.num_columns() as usize;
        read_u32(self.bytes(), value_offsets_start(n) + 4 * i as usize)
    }

    /// Returns `true` if position `i` is null.
    #[inline]
    pub fn is_null(&self, i: u16) -> bool {
        let pos = bitmap_start(self.num_columns() as usize) + i as usize / BYTE_SIZE;
        self.bytes()[pos] & one_hot_mask(i as usize) == 0
    }

    /// Returns the value bytes at position `i`, or `None` if null.
    #[inline]
    pub fn access_with_null_check(&self, layout: &BlockLayout, i: u16) -> Option<&[u8]> {
        if self.is_null(i) {
            return None;
        }
        let start = self.value_offset(i) as usize;
        let size = layout.attr_size(self.column_id(i)) as usize;
        Some(&self.bytes()[start..start + size])
    }

    /// Returns the value at position `i` zero-extended to `u64`, or `None`
    /// if null.
    pub fn get(&self, layout: &BlockLayout, i: u16) -> Option<u64> {
        let size = layout.attr_size(self.column_id(i));
        self.access_with_null_check(layout, i)
            .map(|bytes| read_bytes(size, bytes))
    }

    /// Maps column ids to positions of this row.
    pub fn projection_map(&self, layout: &BlockLayout) -> ProjectionMap {
        ProjectionMap::new(self.column_ids(), layout.num_columns())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes()
    }

    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ProjectedRow<B> {
    /// Writes a row header for `column_ids` into `buf`.
    ///
    /// Values are packed contiguously after the null bitmap in projection
    /// order. Every position starts null.
    ///
    /// # Arguments
    /// * `buf` - Caller buffer of at least `ProjectedRow::size` bytes
    /// * `layout` - Layout supplying attribute widths
    /// * `column_ids` - Projection list; user columns only, no repeats
    pub fn initialize(
        mut buf: B,
        layout: &BlockLayout,
        column_ids: &[u16],
    ) -> Result<Self, StorageError> {
        let required = ProjectedRow::size(layout, column_ids)?;
        let bytes = buf.as_mut();
        if bytes.len() < required {
            return Err(StorageError::BufferTooSmall {
                required,
                actual: bytes.len(),
            });
        }

        let n = column_ids.len();
        bytes[0..2].copy_from_slice(&(n as u16).to_le_bytes());
        let mut value_offset = header_size(n) as u32;
        for (i, &col) in column_ids.iter().enumerate() {
            let id_pos = COLUMN_IDS_OFFSET + 2 * i;
            bytes[id_pos..id_pos + 2].copy_from_slice(&col.to_le_bytes());
            let offset_pos = value_offsets_start(n) + 4 * i;
            bytes[offset_pos..offset_pos + 4].copy_from_slice(&value_offset.to_le_bytes());
            value_offset += layout.attr_size(col) as u32;
        }
        bytes[bitmap_start(n)..header_size(n)].fill(0);
        Ok(Self { buf })
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Marks position `i` present and returns its value bytes.
    #[inline]
    pub fn access_force_not_null(&mut self, layout: &BlockLayout, i: u16) -> &mut [u8] {
        let pos = bitmap_start(self.num_columns() as usize) + i as usize / BYTE_SIZE;
        let start = self.value_offset(i) as usize;
        let size = layout.attr_size(self.column_id(i)) as usize;
        let bytes = self.bytes_mut();
        bytes[pos] |= one_hot_mask(i as usize);
        &mut bytes[start..start + size]
    }

    /// Writes `value` at position `i`, truncated to the column width.
    pub fn set(&mut self, layout: &BlockLayout, i: u16, value: u64) {
        let size = layout.attr_size(self.column_id(i));
        write_bytes(size, value, self.access_force_not_null(layout, i));
    }

    /// Marks position `i` null.
    #[inline]
    pub fn set_null(&mut self, i: u16) {
        let pos = bitmap_start(self.num_columns() as usize) + i as usize / BYTE_SIZE;
        self.bytes_mut()[pos] &= !one_hot_mask(i as usize);
    }

    /// Marks every position null, returning the row to its initialized state.
    pub fn clear(&mut self) {
        let n = self.num_columns() as usize;
        self.bytes_mut()[bitmap_start(n)..header_size(n)].fill(0);
    }
}

/// Replays one undo step onto `target`.
///
/// For every column present in `delta` that `target` projects (located via
/// `map`), copies the delta's value or null state over the target's.
/// Columns `target` does not project are skipped.
pub fn apply_delta<D, T>(
    layout: &BlockLayout,
    delta: &ProjectedRow<D>,
    target: &mut ProjectedRow<T>,
    map: &ProjectionMap,
) where
    D: AsRef<[u8]>,
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    for i in 0..delta.num_columns() {
        let Some(target_pos) = map.get(delta.column_id(i)) else {
            continue;
        };
        match delta.access_with_null_check(layout, i) {
            None => target.set_null(target_pos),
            Some(bytes) => target
                .access_force_not_null(layout, target_pos)
                .copy_from_slice(bytes),
        }
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for ProjectedRow<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns: Vec<(u16, bool)> = (0..self.num_columns())
            .map(|i| (self.column_id(i), !self.is_null(i)))
            .collect();
        f.debug_struct("ProjectedRow")
            .field("len", &self.bytes().len())
            .field("columns", &columns)
            .finish()
    }
}
