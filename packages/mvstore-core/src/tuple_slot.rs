//! Tuple addressing.

use std::fmt;

/// Logical address of one tuple: the owning block's id within its table and
/// the slot offset inside that block.
///
/// Plain `Copy` handle; resolving it to memory is the owning table's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleSlot {
    block_id: u32,
    offset: u32,
}

impl TupleSlot {
    pub fn new(block_id: u32, offset: u32) -> Self {
        Self { block_id, offset }
    }

    /// Id of the block holding the tuple.
    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    /// Slot index inside the block.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl fmt::Display for TupleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_id, self.offset)
    }
}
