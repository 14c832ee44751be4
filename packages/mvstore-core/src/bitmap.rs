//! Lock-free bitmap with per-bit conditional flips.
//!
//! Bits are packed most-significant-first into byte-sized atomic cells: bit
//! `i` is `1 << (7 - i % 8)` of byte `i / 8`. Several threads may flip
//! different bits of the same byte at once, so every flip is a CAS loop on the
//! containing byte that retries only while the target bit still holds the
//! expected value.
//!
//! The same structure tracks slot allocation (column 0, `false` = free) and
//! per-column presence (`true` = not null).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Bits per bitmap cell.
pub const BYTE_SIZE: usize = 8;

/// Returns the number of bytes needed to hold `num_bits` bits.
pub const fn bitmap_size(num_bits: usize) -> usize {
    num_bits.div_ceil(BYTE_SIZE)
}

#[inline]
pub(crate) const fn one_hot_mask(pos: usize) -> u8 {
    1u8 << (BYTE_SIZE - 1 - pos % BYTE_SIZE)
}

/// Bitmap view over borrowed atomic cells.
///
/// Used for the null bitmaps embedded in block memory, where the cells live
/// inside a raw block rather than in an owned allocation.
#[derive(Clone, Copy)]
pub struct RawBitmap<'a> {
    bits: &'a [AtomicU8],
    len: usize,
}

impl<'a> RawBitmap<'a> {
    /// Creates a view of `len` bits over `bits`.
    ///
    /// # Panics
    /// Panics if `bits` holds fewer than `bitmap_size(len)` cells.
    pub fn new(bits: &'a [AtomicU8], len: usize) -> Self {
        assert!(
            bits.len() >= bitmap_size(len),
            "bitmap of {} bits needs {} cells, got {}",
            len,
            bitmap_size(len),
            bits.len()
        );
        Self { bits, len }
    }

    /// Returns the number of bits in the bitmap.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bitmap holds no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the current value of bit `pos`.
    #[inline]
    pub fn test(&self, pos: usize) -> bool {
        debug_assert!(pos < self.len, "bit {} out of range {}", pos, self.len);
        self.bits[pos / BYTE_SIZE].load(Ordering::Acquire) & one_hot_mask(pos) != 0
    }

    /// Atomically flips bit `pos` from `expected` to `!expected`.
    ///
    /// # Returns
    /// `true` if this call performed the transition, `false` if the bit did
    /// not hold `expected` when the flip was attempted.
    #[inline]
    pub fn flip(&self, pos: usize, expected: bool) -> bool {
        debug_assert!(pos < self.len, "bit {} out of range {}", pos, self.len);
        let cell = &self.bits[pos / BYTE_SIZE];
        let mask = one_hot_mask(pos);
        let mut current = cell.load(Ordering::Acquire);
        while (current & mask != 0) == expected {
            match cell.compare_exchange_weak(
                current,
                current ^ mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Scans for the lowest unset bit at or after `start` and claims it.
    ///
    /// Fully set cells are skipped without touching their bits. Losing a race
    /// for a bit moves the scan on to the next one.
    ///
    /// # Returns
    /// The claimed position, or `None` if every bit from `start` on is set.
    pub fn claim_first_unset(&self, start: usize) -> Option<usize> {
        let mut pos = start;
        while pos < self.len {
            let cell = self.bits[pos / BYTE_SIZE].load(Ordering::Acquire);
            if cell == u8::MAX {
                pos = (pos / BYTE_SIZE + 1) * BYTE_SIZE;
                continue;
            }
            if self.flip(pos, false) {
                return Some(pos);
            }
            pos += 1;
        }
        None
    }

    /// Counts the set bits. Not a consistent snapshot under concurrent flips.
    pub fn count_ones(&self) -> usize {
        (0..self.len).filter(|&pos| self.test(pos)).count()
    }
}

impl fmt::Debug for RawBitmap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBitmap")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .finish()
    }
}

/// Owned fixed-length concurrent bitmap. All bits start unset.
pub struct ConcurrentBitmap {
    bits: Box<[AtomicU8]>,
    len: usize,
}

impl ConcurrentBitmap {
    /// Creates a bitmap of `len` bits, all unset.
    pub fn new(len: usize) -> Self {
        let bits = (0..bitmap_size(len)).map(|_| AtomicU8::new(0)).collect();
        Self { bits, len }
    }

    /// Returns a borrowed view of the bitmap.
    pub fn as_raw(&self) -> RawBitmap<'_> {
        RawBitmap {
            bits: &self.bits,
            len: self.len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, pos: usize) -> bool {
        self.as_raw().test(pos)
    }

    pub fn flip(&self, pos: usize, expected: bool) -> bool {
        self.as_raw().flip(pos, expected)
    }
}

impl fmt::Debug for ConcurrentBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_raw().fmt(f)
    }
}
