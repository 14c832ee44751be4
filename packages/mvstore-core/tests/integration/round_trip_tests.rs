//! Values written through a table read back unchanged.

use mvstore_core::{DataTable, DeltaRecord, StorageConfig, Timestamp, TupleSlot};
use ntest::timeout;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::helpers::{fixture, random_layout, random_row, read};

/// Random layouts, all user columns, a third of the values null.
#[test]
#[timeout(20000)]
fn test_random_rows_round_trip() {
    round_trip_random_rows().unwrap();
}

fn round_trip_random_rows() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let config = StorageConfig {
        block_size: 1 << 16,
        ..Default::default()
    };

    for _ in 0..20 {
        let layout = random_layout(&mut rng, 64, config.block_size);
        let (pool, _, config) = fixture(layout.attr_sizes(), config.clone());
        let ids = layout.all_user_columns();
        let ts = Timestamp::committed(1);

        let rows: Vec<_> = (0..100)
            .map(|_| random_row(&mut rng, &layout, &ids, 0.3))
            .collect();
        let undos = rows
            .iter()
            .map(|_| DeltaRecord::new(ts, &layout, &ids))
            .collect::<Result<Vec<_>, _>>()?;
        let table = DataTable::new(pool, layout.clone(), &config)?;

        let mut slots = Vec::with_capacity(rows.len());
        for ((row, _), undo) in rows.iter().zip(&undos) {
            slots.push(table.insert(row, undo)?);
        }
        for (slot, (_, expected)) in slots.iter().zip(&rows) {
            assert_eq!(&read(&table, ts, *slot, &ids), expected);
        }
    }
    Ok(())
}

/// Selecting a shuffled subset of columns returns exactly that subset.
#[test]
#[timeout(5000)]
fn test_partial_projection_select() {
    let mut rng = StdRng::seed_from_u64(11);
    let (pool, layout, config) = fixture(&[8, 1, 2, 4, 8, 4, 2, 1], StorageConfig::default());
    let ids = layout.all_user_columns();
    let ts = Timestamp::committed(3);
    let (row, expected) = random_row(&mut rng, &layout, &ids, 0.2);
    let undo = DeltaRecord::new(ts, &layout, &ids).unwrap();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();
    let slot = table.insert(&row, &undo).unwrap();
    assert_eq!(slot, TupleSlot::new(0, 0));

    for _ in 0..50 {
        let mut subset = ids.clone();
        subset.shuffle(&mut rng);
        subset.truncate(3);
        let got = read(&table, ts, slot, &subset);
        for (value, col) in got.into_iter().zip(&subset) {
            assert_eq!(value, expected[*col as usize - 1], "column {}", col);
        }
    }
}
