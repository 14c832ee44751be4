//! Multi-version data table.
//!
//! A table owns a fixed-capacity directory of blocks taken from a
//! `BlockStore`. Inserts claim slots lock-free from the current insertion
//! head; updates install an undo record as the tuple's new version chain head
//! with one CAS and then overwrite the live columns; selects copy the live
//! columns and replay undo records until they reach a version visible at the
//! requested timestamp.
//!
//! No table-wide or block-wide lock exists: all synchronization is bit flips,
//! per-value atomics, and the version pointer CAS.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::access::TupleAccessStrategy;
use crate::block::{init_block, BlockLayout};
use crate::block_store::BlockStore;
use crate::config::StorageConfig;
use crate::delta::{DeltaRecord, Timestamp};
use crate::error::StorageError;
use crate::projected_row::{apply_delta, read_bytes, write_bytes, ProjectedRow};
use crate::raw_block::RawBlock;
use crate::tuple_slot::TupleSlot;

/// Multi-version table over fixed-width columns.
///
/// `'u` is how long the table may traverse the undo records linked into it.
/// Records are owned by the caller (the transaction layer) and must outlive
/// the table's use of them; the borrow checker enforces this.
pub struct DataTable<'u> {
    store: Arc<dyn BlockStore>,
    accessor: TupleAccessStrategy,
    blocks: Box<[OnceLock<RawBlock>]>,
    num_blocks: AtomicU32,
    insertion_head: AtomicU32,
    _records: PhantomData<&'u DeltaRecord>,
}

impl<'u> DataTable<'u> {
    /// Creates a table and acquires its first block.
    ///
    /// # Arguments
    /// * `store` - Block store supplying and recycling blocks
    /// * `layout` - Table layout; its block size must match the store's
    /// * `config` - Storage configuration (block size, directory capacity)
    ///
    /// # Returns
    /// `Result<DataTable, StorageError>` containing the table or an error.
    pub fn new(
        store: Arc<dyn BlockStore>,
        layout: Arc<BlockLayout>,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        if layout.block_size() != config.block_size || store.block_size() != config.block_size {
            return Err(StorageError::InvalidConfig {
                field: "block_size",
                reason: format!(
                    "layout uses {}, store uses {}, config says {}",
                    layout.block_size(),
                    store.block_size(),
                    config.block_size
                ),
            });
        }

        let blocks = (0..config.max_blocks_per_table)
            .map(|_| OnceLock::new())
            .collect();
        let table = Self {
            store,
            accessor: TupleAccessStrategy::new(layout),
            blocks,
            num_blocks: AtomicU32::new(0),
            insertion_head: AtomicU32::new(0),
            _records: PhantomData,
        };
        table.install_block(0)?;
        tracing::debug!(
            "Created table with {} columns, {} slots per block",
            table.layout().num_columns(),
            table.layout().num_slots()
        );
        Ok(table)
    }

    pub fn layout(&self) -> &BlockLayout {
        self.accessor.layout()
    }

    pub fn accessor(&self) -> &TupleAccessStrategy {
        &self.accessor
    }

    /// Blocks currently owned by the table.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks.load(Ordering::Acquire) as usize
    }

    #[inline]
    fn block(&self, block_id: u32) -> Option<&RawBlock> {
        self.blocks.get(block_id as usize).and_then(OnceLock::get)
    }

    // Slots are only handed out by this table, so an unknown block id is a
    // caller defect.
    #[inline]
    fn block_of(&self, slot: TupleSlot) -> &RawBlock {
        self.block(slot.block_id())
            .unwrap_or_else(|| panic!("tuple slot {} does not belong to this table", slot))
    }

    /// Acquires, initializes, and publishes block `block_id` unless another
    /// thread already did.
    fn install_block(&self, block_id: u32) -> Result<(), StorageError> {
        let max_blocks = self.blocks.len();
        let Some(cell) = self.blocks.get(block_id as usize) else {
            tracing::warn!("Table block directory full at {} blocks", max_blocks);
            return Err(StorageError::TableFull { max_blocks });
        };
        if cell.get().is_some() {
            return Ok(());
        }

        let mut raw = self.store.acquire()?;
        init_block(&mut raw, self.layout(), block_id);
        match cell.set(raw) {
            Ok(()) => {
                self.num_blocks.fetch_max(block_id + 1, Ordering::AcqRel);
                tracing::debug!("Installed block {}", block_id);
            }
            // Another inserter won the race for this directory entry.
            Err(raw) => self.store.release(raw),
        }
        Ok(())
    }

    /// Claims a free slot, rotating the insertion head to a new block when
    /// the current one is full.
    fn allocate_slot(&self) -> Result<TupleSlot, StorageError> {
        loop {
            let head = self.insertion_head.load(Ordering::Acquire);
            if let Some(block) = self.block(head) {
                if let Some(offset) = self.accessor.allocate(block) {
                    return Ok(TupleSlot::new(head, offset));
                }
            }
            self.install_block(head + 1)?;
            if self
                .insertion_head
                .compare_exchange(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::debug!("Insertion head rotated to block {}", head + 1);
            }
        }
    }

    /// Inserts a tuple.
    ///
    /// Claims a slot, clears its version pointer, and installs `undo` (whose
    /// before-image records "did not exist") through `update`.
    ///
    /// # Arguments
    /// * `redo` - Values to insert; unprojected columns stay null
    /// * `undo` - Unlinked record stamped with the inserting transaction's
    ///   timestamp, projecting the same columns as `redo`
    ///
    /// # Returns
    /// The new tuple's slot, or an error if no block could be obtained.
    ///
    /// # Panics
    /// Panics if `undo` is already linked or being installed elsewhere, or if
    /// it does not project exactly the columns of `redo`.
    pub fn insert<B: AsRef<[u8]>>(
        &self,
        redo: &ProjectedRow<B>,
        undo: &'u DeltaRecord,
    ) -> Result<TupleSlot, StorageError> {
        assert!(
            undo.covers(redo),
            "delta record projects columns {:?}, redo row changes {:?}",
            undo.column_ids(),
            redo.column_ids().collect::<Vec<_>>()
        );
        let slot = self.allocate_slot()?;
        self.version_pointer(slot).store(0, Ordering::Release);
        let installed = self.update(slot, redo, undo);
        debug_assert!(installed, "fresh slot {} rejected its first version", slot);
        Ok(slot)
    }

    /// Updates a tuple in place, keeping the old values in `undo`.
    ///
    /// Fails without any effect if the newest version belongs to another
    /// uncommitted transaction (first writer wins). Otherwise copies the
    /// current values of `undo`'s columns into its before-image, installs it
    /// as the chain head with one CAS, and writes `redo` into the live
    /// columns. A lost CAS restarts the whole read-check-install sequence.
    ///
    /// Concurrent readers only see whole versions if `undo` carries an
    /// uncommitted timestamp that is committed with `set_timestamp` after
    /// this call returns.
    ///
    /// # Arguments
    /// * `slot` - Tuple returned by `insert`
    /// * `redo` - New values (present or null) of the changed columns
    /// * `undo` - Unlinked record stamped with the updating transaction's
    ///   timestamp, projecting the changed columns
    ///
    /// # Returns
    /// `true` if installed, `false` on a write-write conflict.
    ///
    /// # Panics
    /// Panics if `undo` is already linked or being installed elsewhere, or if
    /// it does not project exactly the columns of `redo`.
    pub fn update<B: AsRef<[u8]>>(
        &self,
        slot: TupleSlot,
        redo: &ProjectedRow<B>,
        undo: &'u DeltaRecord,
    ) -> bool {
        assert!(
            undo.covers(redo),
            "delta record projects columns {:?}, redo row changes {:?}",
            undo.column_ids(),
            redo.column_ids().collect::<Vec<_>>()
        );
        assert!(
            undo.claim(),
            "delta record is already linked into a version chain"
        );
        let block = self.block_of(slot);
        let head_cell = self.accessor.version_pointer(block, slot.offset());
        let timestamp = undo.timestamp();

        loop {
            let head_raw = head_cell.load(Ordering::Acquire);
            let head = head_raw as usize as *const DeltaRecord;
            // SAFETY: non-null heads are records borrowed for 'u.
            if let Some(record) = unsafe { head.as_ref() } {
                let head_ts = record.timestamp();
                if head_ts != timestamp && head_ts.is_uncommitted() {
                    tracing::trace!(
                        "Write-write conflict on {}: held by {}, attempted by {}",
                        slot,
                        head_ts,
                        timestamp
                    );
                    undo.unclaim();
                    return false;
                }
            }

            // SAFETY: this thread holds the claim on undo.
            let mut before = unsafe { undo.delta_mut() };
            self.copy_into_projection(block, slot.offset(), &mut before);
            undo.set_next(head);

            let new_head = undo as *const DeltaRecord as usize as u64;
            if head_cell
                .compare_exchange(head_raw, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            tracing::trace!("Version head of {} moved, retrying update", slot);
        }
        undo.mark_linked();

        self.copy_from_projection(redo, block, slot.offset());
        true
    }

    /// Materializes the tuple as of `as_of` into `out`.
    ///
    /// Copies the live values of `out`'s columns, then walks the version
    /// chain applying the before-image of every record not visible at
    /// `as_of`. If the chain runs out first, the tuple did not exist at
    /// `as_of` and `out` ends all-null for the columns the insert set.
    ///
    /// Behavior for a slot this table never returned is unspecified.
    pub fn select<B>(&self, as_of: Timestamp, slot: TupleSlot, out: &mut ProjectedRow<B>)
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        let block = self.block_of(slot);
        let head_cell = self.accessor.version_pointer(block, slot.offset());

        let (head, head_visible) = loop {
            let head = head_cell.load(Ordering::Acquire) as usize as *const DeltaRecord;
            // SAFETY: non-null heads are records borrowed for 'u. Reading
            // the head's timestamp before the live values means a committed
            // head's writes are visible to the copies below.
            let head_visible = unsafe { head.as_ref() }
                .map_or(true, |record| record.timestamp().is_visible_to(as_of));
            self.copy_into_projection(block, slot.offset(), out);
            if head_cell.load(Ordering::Acquire) as usize as *const DeltaRecord == head {
                break (head, head_visible);
            }
        };
        if head_visible {
            return;
        }

        let layout = self.layout();
        let map = out.projection_map(layout);
        // SAFETY: see above; records reached from a published head are fully
        // written and never modified again.
        let mut current = unsafe { head.as_ref() };
        while let Some(record) = current {
            let delta = unsafe { record.delta_unchecked() };
            apply_delta(layout, &delta, out, &map);
            current = record
                .next()
                .filter(|next| !next.timestamp().is_visible_to(as_of));
        }
    }

    /// Newest undo record of a tuple, if any.
    pub fn version_head(&self, slot: TupleSlot) -> Option<&'u DeltaRecord> {
        let raw = self.version_pointer(slot).load(Ordering::Acquire);
        // SAFETY: non-null heads are records borrowed for 'u.
        unsafe { (raw as usize as *const DeltaRecord).as_ref() }
    }

    fn version_pointer(&self, slot: TupleSlot) -> &AtomicU64 {
        self.accessor
            .version_pointer(self.block_of(slot), slot.offset())
    }

    fn copy_into_projection<B>(&self, block: &RawBlock, offset: u32, row: &mut ProjectedRow<B>)
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        let layout = self.layout();
        for i in 0..row.num_columns() {
            let col = row.column_id(i);
            match self.accessor.access_with_null_check(block, offset, col) {
                None => row.set_null(i),
                Some(attr) => write_bytes(
                    attr.size(),
                    attr.load(),
                    row.access_force_not_null(layout, i),
                ),
            }
        }
    }

    fn copy_from_projection<B: AsRef<[u8]>>(
        &self,
        row: &ProjectedRow<B>,
        block: &RawBlock,
        offset: u32,
    ) {
        let layout = self.layout();
        for i in 0..row.num_columns() {
            let col = row.column_id(i);
            match row.access_with_null_check(layout, i) {
                None => self.accessor.set_null(block, offset, col),
                Some(bytes) => self
                    .accessor
                    .access_force_not_null(block, offset, col)
                    .store(read_bytes(layout.attr_size(col), bytes)),
            }
        }
    }
}

impl Drop for DataTable<'_> {
    fn drop(&mut self) {
        let blocks = std::mem::take(&mut self.blocks);
        let count = blocks.len();
        let mut released = 0;
        for raw in blocks.into_vec().into_iter().filter_map(OnceLock::into_inner) {
            self.store.release(raw);
            released += 1;
        }
        tracing::debug!("Table released {} of {} directory blocks", released, count);
    }
}

impl fmt::Debug for DataTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTable")
            .field("layout", self.layout())
            .field("num_blocks", &self.num_blocks())
            .field("insertion_head", &self.insertion_head.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
