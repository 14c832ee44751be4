//! Shared fixtures for integration tests.

use std::sync::Arc;

use mvstore_core::block::SUPPORTED_ATTR_SIZES;
use mvstore_core::{
    BlockLayout, BlockPool, DataTable, ProjectedRow, StorageConfig, Timestamp, TupleSlot,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

/// Pool, layout and config for a table over `sizes`.
pub fn fixture(sizes: &[u8], config: StorageConfig) -> (Arc<BlockPool>, Arc<BlockLayout>, StorageConfig) {
    let layout = Arc::new(BlockLayout::new(sizes.to_vec(), config.block_size).unwrap());
    let pool = Arc::new(BlockPool::new(&config).unwrap());
    (pool, layout, config)
}

pub fn small_blocks() -> StorageConfig {
    StorageConfig {
        block_size: 1 << 12,
        ..Default::default()
    }
}

/// Random layout with up to `max_cols` columns, column 0 being the version
/// pointer.
pub fn random_layout(rng: &mut StdRng, max_cols: u16, block_size: usize) -> Arc<BlockLayout> {
    let num_cols = rng.gen_range(2..=max_cols);
    let mut sizes = vec![8u8];
    for _ in 1..num_cols {
        sizes.push(*SUPPORTED_ATTR_SIZES.choose(rng).unwrap());
    }
    Arc::new(BlockLayout::new(sizes, block_size).unwrap())
}

/// Random value fitting the width of column `col`.
pub fn random_value(rng: &mut StdRng, layout: &BlockLayout, col: u16) -> u64 {
    let bits = 8 * layout.attr_size(col) as u32;
    rng.gen::<u64>() >> (64 - bits)
}

/// Fills a row over `ids` with random values, leaving roughly
/// `null_ratio` of them null. Returns the row and the expected contents.
pub fn random_row(
    rng: &mut StdRng,
    layout: &BlockLayout,
    ids: &[u16],
    null_ratio: f64,
) -> (ProjectedRow<Vec<u8>>, Vec<Option<u64>>) {
    let mut row = ProjectedRow::allocate(layout, ids).unwrap();
    let mut expected = Vec::with_capacity(ids.len());
    for (i, &col) in ids.iter().enumerate() {
        if rng.gen_bool(null_ratio) {
            expected.push(None);
            continue;
        }
        let value = random_value(rng, layout, col);
        row.set(layout, i as u16, value);
        expected.push(Some(value));
    }
    (row, expected)
}

pub fn row_with(layout: &BlockLayout, ids: &[u16], values: &[u64]) -> ProjectedRow<Vec<u8>> {
    let mut row = ProjectedRow::allocate(layout, ids).unwrap();
    for (i, &value) in values.iter().enumerate() {
        row.set(layout, i as u16, value);
    }
    row
}

/// Selects `ids` of `slot` as of `as_of`.
pub fn read(table: &DataTable<'_>, as_of: Timestamp, slot: TupleSlot, ids: &[u16]) -> Vec<Option<u64>> {
    let layout = table.layout();
    let mut out = ProjectedRow::allocate(layout, ids).unwrap();
    table.select(as_of, slot, &mut out);
    (0..out.num_columns()).map(|i| out.get(layout, i)).collect()
}
