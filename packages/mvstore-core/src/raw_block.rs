//! Block-size-aligned raw memory regions.
//!
//! A `RawBlock` is one contiguous allocation whose address is a multiple of
//! its own size. Blocks are shared between threads once installed in a table,
//! so after initialization every access goes through raw pointers and atomics
//! of the accessed width; no `&[u8]` over a shared block is ever formed.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::error::StorageError;

/// Owned, zero-initialized, self-aligned memory block.
///
/// # Safety
/// - Shared access (`&RawBlock`) must only touch memory through the atomic
///   accessors below or through reads of bytes that are no longer written
/// - Exclusive access (`&mut RawBlock`) may use `as_mut_slice`
pub struct RawBlock {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the block owns its allocation and all shared access goes through
// atomics, so moving it across threads and sharing it are both sound.
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
    /// Allocates a zeroed block of `size` bytes aligned to `size`.
    ///
    /// # Arguments
    /// * `size` - Block size in bytes; must be a power of two
    ///
    /// # Returns
    /// `Result<RawBlock, StorageError>` containing the block or an error.
    pub fn allocate(size: usize) -> Result<Self, StorageError> {
        let layout = Self::memory_layout(size)?;
        // SAFETY: layout has non-zero size, checked by memory_layout.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr, size })
            .ok_or(StorageError::AllocationFailed { size, align: size })
    }

    fn memory_layout(size: usize) -> Result<Layout, StorageError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(StorageError::InvalidConfig {
                field: "block_size",
                reason: format!("{} is not a non-zero power of two", size),
            });
        }
        Layout::from_size_align(size, size).map_err(|e| StorageError::InvalidConfig {
            field: "block_size",
            reason: e.to_string(),
        })
    }

    /// Returns the block size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the block's base address.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Returns the whole block as a byte slice for exclusive access.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and &mut self guarantees no
        // other reference to the block exists.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Copies the block's bytes out. Requires exclusive access so the copy is
    /// a consistent dump.
    pub fn to_vec(&mut self) -> Vec<u8> {
        self.as_mut_slice().to_vec()
    }

    #[inline]
    fn checked_ptr(&self, offset: usize, width: usize) -> *mut u8 {
        assert!(
            offset + width <= self.size,
            "access [{}, {}) out of block bounds {}",
            offset,
            offset + width,
            self.size
        );
        // SAFETY: offset + width is within the allocation.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    // The block base is self-aligned, so offset alignment is address alignment.
    #[inline]
    fn aligned_ptr(&self, offset: usize, width: usize) -> *mut u8 {
        debug_assert!(offset % width == 0, "unaligned {}-byte access at {}", width, offset);
        self.checked_ptr(offset, width)
    }

    /// Returns the byte at `offset` as an atomic cell.
    #[inline]
    pub fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        // SAFETY: in bounds, alignment 1, and shared access is atomic only.
        unsafe { AtomicU8::from_ptr(self.checked_ptr(offset, 1)) }
    }

    /// Returns `len` consecutive atomic byte cells starting at `offset`.
    #[inline]
    pub fn atomic_bytes(&self, offset: usize, len: usize) -> &[AtomicU8] {
        let ptr = self.checked_ptr(offset, len.max(1)) as *const AtomicU8;
        // SAFETY: AtomicU8 has the layout of u8 and the range is in bounds.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    #[inline]
    pub fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        // SAFETY: in bounds; alignment checked in debug builds and
        // guaranteed by the block layout.
        unsafe { AtomicU16::from_ptr(self.aligned_ptr(offset, 2) as *mut u16) }
    }

    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: see atomic_u16.
        unsafe { AtomicU32::from_ptr(self.aligned_ptr(offset, 4) as *mut u32) }
    }

    #[inline]
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: see atomic_u16.
        unsafe { AtomicU64::from_ptr(self.aligned_ptr(offset, 8) as *mut u64) }
    }

    /// Reads a little-endian integer of `width` bytes (1, 2, 4 or 8).
    ///
    /// # Panics
    /// Panics on any other width: that is a layout defect.
    #[inline]
    pub fn load(&self, offset: usize, width: u8, order: Ordering) -> u64 {
        match width {
            1 => self.atomic_u8(offset).load(order) as u64,
            2 => u16::from_le(self.atomic_u16(offset).load(order)) as u64,
            4 => u32::from_le(self.atomic_u32(offset).load(order)) as u64,
            8 => u64::from_le(self.atomic_u64(offset).load(order)),
            _ => panic!("unsupported attribute width {} at block offset {}", width, offset),
        }
    }

    /// Writes a little-endian integer of `width` bytes (1, 2, 4 or 8),
    /// truncating `value` to the width.
    ///
    /// # Panics
    /// Panics on any other width.
    #[inline]
    pub fn store(&self, offset: usize, width: u8, value: u64, order: Ordering) {
        match width {
            1 => self.atomic_u8(offset).store(value as u8, order),
            2 => self.atomic_u16(offset).store((value as u16).to_le(), order),
            4 => self.atomic_u32(offset).store((value as u32).to_le(), order),
            8 => self.atomic_u64(offset).store(value.to_le(), order),
            _ => panic!("unsupported attribute width {} at block offset {}", width, offset),
        }
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // The layout was validated when the block was allocated.
        if let Ok(layout) = Self::memory_layout(self.size) {
            // SAFETY: ptr came from alloc_zeroed with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBlock")
            .field("addr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
