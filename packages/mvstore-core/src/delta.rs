//! Undo records and version chains.
//!
//! Every tuple's version pointer column holds the newest `DeltaRecord`, or 0.
//! Each record carries the before-image of the columns one update changed and
//! links to the record installed before it:
//!
//! ```text
//! version pointer ──> [ts: -7 | before-image of {2}] ──> [ts: 3 | {1, 2}] ──> null
//!                       newest, uncommitted               insert ("did not exist")
//! ```
//!
//! Chains are only ever prepended to. The transaction layer owns record
//! memory; tables borrow records for as long as they may traverse them.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, Ordering};

use crate::block::BlockLayout;
use crate::error::StorageError;
use crate::projected_row::ProjectedRow;

/// Transaction or commit timestamp.
///
/// Non-negative values are commit timestamps. Negative values mark an
/// uncommitted version owned by transaction `-raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Commit timestamp `ts`.
    ///
    /// # Panics
    /// Panics if `ts` does not fit in 63 bits.
    pub fn committed(ts: u64) -> Self {
        let raw = i64::try_from(ts).unwrap_or_else(|_| panic!("commit timestamp {} exceeds 63 bits", ts));
        Self(raw)
    }

    /// Uncommitted timestamp owned by transaction `txn_id`.
    ///
    /// # Panics
    /// Panics if `txn_id` is 0 or does not fit in 63 bits.
    pub fn uncommitted(txn_id: u64) -> Self {
        assert!(
            txn_id > 0 && txn_id <= i64::MAX as u64,
            "transaction id {} outside [1, 2^63)",
            txn_id
        );
        Self(-(txn_id as i64))
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_uncommitted(self) -> bool {
        self.0 < 0
    }

    /// Owning transaction of an uncommitted timestamp.
    pub const fn txn_id(self) -> Option<u64> {
        if self.0 < 0 {
            Some(self.0.unsigned_abs())
        } else {
            None
        }
    }

    /// Whether a version stamped `self` is visible to a reader at `as_of`.
    ///
    /// A reader at a commit timestamp sees committed versions no newer than
    /// `as_of`. A reader identified by an uncommitted timestamp sees its own
    /// pending versions and every committed one. Other transactions'
    /// uncommitted versions are never visible.
    #[inline]
    pub fn is_visible_to(self, as_of: Timestamp) -> bool {
        self == as_of || (!self.is_uncommitted() && (as_of.is_uncommitted() || self <= as_of))
    }
}

impl From<i64> for Timestamp {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.txn_id() {
            Some(txn) => write!(f, "txn#{}", txn),
            None => write!(f, "{}", self.0),
        }
    }
}

const STATE_FREE: u8 = 0;
const STATE_WRITING: u8 = 1;
const STATE_LINKED: u8 = 2;

/// Undo log node: timestamp, link to the previously installed record, and the
/// before-image of the columns the producing update changed.
///
/// A record moves from free to writing while a table fills in its
/// before-image, then to linked once it is published as a chain head. Linked
/// records are immutable apart from their timestamp and never go back, so a
/// record is linked at most once.
pub struct DeltaRecord {
    timestamp: AtomicI64,
    next: AtomicPtr<DeltaRecord>,
    state: AtomicU8,
    column_ids: Box<[u16]>,
    delta: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the before-image is written only by the thread that moved the
// record from free to writing, and read only once the record is linked, which
// happens-after those writes (release on publish, acquire on traversal).
unsafe impl Sync for DeltaRecord {}

impl DeltaRecord {
    /// Footprint of the before-image buffer for `column_ids`.
    pub fn size(layout: &BlockLayout, column_ids: &[u16]) -> Result<usize, StorageError> {
        ProjectedRow::size(layout, column_ids)
    }

    /// Creates an unlinked record whose before-image projects `column_ids`.
    ///
    /// # Arguments
    /// * `timestamp` - Timestamp of the update that will install the record
    /// * `layout` - Table layout
    /// * `column_ids` - Columns the update changes
    pub fn new(
        timestamp: Timestamp,
        layout: &BlockLayout,
        column_ids: &[u16],
    ) -> Result<Self, StorageError> {
        let row = ProjectedRow::allocate(layout, column_ids)?;
        Ok(Self {
            timestamp: AtomicI64::new(timestamp.raw()),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(STATE_FREE),
            column_ids: column_ids.into(),
            delta: UnsafeCell::new(row.into_inner().into_boxed_slice()),
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp(self.timestamp.load(Ordering::Acquire))
    }

    /// Restamps the record, e.g. with the commit timestamp once the owning
    /// transaction commits.
    pub fn set_timestamp(&self, timestamp: Timestamp) {
        self.timestamp.store(timestamp.raw(), Ordering::Release);
    }

    /// Columns whose before-image the record holds, in projection order.
    pub fn column_ids(&self) -> &[u16] {
        &self.column_ids
    }

    /// Returns `true` if the record projects exactly the columns of `row`.
    pub fn covers<B: AsRef<[u8]>>(&self, row: &ProjectedRow<B>) -> bool {
        row.num_columns() as usize == self.column_ids.len()
            && row.column_ids().all(|col| self.column_ids.contains(&col))
    }

    /// Returns `true` once the record is a member of a version chain.
    pub fn is_linked(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_LINKED
    }

    /// The record installed before this one, if any.
    pub fn next(&self) -> Option<&DeltaRecord> {
        // SAFETY: next is either null or a record the table borrowed for at
        // least as long as this one.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }

    /// Before-image of a linked record. `None` until the record is linked.
    pub fn delta(&self) -> Option<ProjectedRow<&[u8]>> {
        if !self.is_linked() {
            return None;
        }
        // SAFETY: linked records are never written again.
        Some(unsafe { self.delta_unchecked() })
    }

    /// Moves the record from free to writing.
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(STATE_FREE, STATE_WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns a claimed but unpublished record to free.
    pub(crate) fn unclaim(&self) {
        self.state.store(STATE_FREE, Ordering::Release);
    }

    pub(crate) fn mark_linked(&self) {
        self.state.store(STATE_LINKED, Ordering::Release);
    }

    pub(crate) fn set_next(&self, next: *const DeltaRecord) {
        self.next.store(next as *mut DeltaRecord, Ordering::Release);
    }

    /// # Safety
    /// The caller must hold the claim (state writing) on this record.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn delta_mut(&self) -> ProjectedRow<&mut [u8]> {
        let bytes: &mut [u8] = &mut *self.delta.get();
        ProjectedRow::from_initialized(bytes)
    }

    /// # Safety
    /// No thread may be writing the before-image: the record must have been
    /// reached through a published chain head, or be linked.
    pub(crate) unsafe fn delta_unchecked(&self) -> ProjectedRow<&[u8]> {
        let bytes: &[u8] = &*self.delta.get();
        ProjectedRow::from_initialized(bytes)
    }
}

impl fmt::Debug for DeltaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaRecord")
            .field("timestamp", &self.timestamp())
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("linked", &self.is_linked())
            .finish_non_exhaustive()
    }
}
