//! Physical storage core for an in-memory relational engine.
//!
//! Provides fixed-size block allocation, columnar tuple layout, lock-free
//! null bitmaps, projected rows, and multi-version tables with snapshot reads.

pub mod access;
pub mod bitmap;
pub mod block;
pub mod block_store;
pub mod config;
pub mod data_table;
pub mod delta;
pub mod error;
pub mod projected_row;
pub mod raw_block;
pub mod tuple_slot;

pub use access::{AttrRef, TupleAccessStrategy};
pub use bitmap::{ConcurrentBitmap, RawBitmap};
pub use block::{init_block, BlockHeader, BlockLayout};
pub use block_store::{BlockPool, BlockStore};
pub use config::StorageConfig;
pub use data_table::DataTable;
pub use delta::{DeltaRecord, Timestamp};
pub use error::StorageError;
pub use projected_row::{apply_delta, ProjectedRow, ProjectionMap};
pub use raw_block::RawBlock;
pub use tuple_slot::TupleSlot;
