//! Snapshot reads across version chains.

use mvstore_core::{DataTable, DeltaRecord, ProjectedRow, StorageConfig, Timestamp};
use ntest::timeout;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::helpers::{fixture, random_value, read, row_with};

/// Insert at T0 and update of column set C at T1: reads before T1 see the
/// old values of C, reads from T1 on see the new ones, other columns never
/// change.
#[test]
#[timeout(2000)]
fn test_update_visibility_by_timestamp() {
    let (pool, layout, config) = fixture(&[8, 8, 4, 2, 1], StorageConfig::default());
    let all = layout.all_user_columns();
    let insert = DeltaRecord::new(Timestamp::committed(10), &layout, &all).unwrap();
    let update = DeltaRecord::new(Timestamp::committed(20), &layout, &[4, 2]).unwrap();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();

    let slot = table
        .insert(&row_with(&layout, &all, &[1, 2, 3, 4]), &insert)
        .unwrap();
    assert!(table.update(slot, &row_with(&layout, &[4, 2], &[40, 20]), &update));

    for as_of in [10, 15, 19] {
        assert_eq!(
            read(&table, Timestamp::committed(as_of), slot, &all),
            vec![Some(1), Some(2), Some(3), Some(4)],
            "as of {}",
            as_of
        );
    }
    for as_of in [20, 21, 1000] {
        assert_eq!(
            read(&table, Timestamp::committed(as_of), slot, &all),
            vec![Some(1), Some(20), Some(3), Some(40)],
            "as of {}",
            as_of
        );
    }
}

/// Reads before the inserting timestamp see a tuple that does not exist yet.
#[test]
#[timeout(2000)]
fn test_select_before_insert_is_all_null() {
    let (pool, layout, config) = fixture(&[8, 4, 8, 2], StorageConfig::default());
    let all = layout.all_user_columns();
    let insert = DeltaRecord::new(Timestamp::committed(5), &layout, &all).unwrap();
    let update = DeltaRecord::new(Timestamp::committed(8), &layout, &[2]).unwrap();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();

    let slot = table
        .insert(&row_with(&layout, &all, &[7, 8, 9]), &insert)
        .unwrap();
    assert!(table.update(slot, &row_with(&layout, &[2], &[80]), &update));

    for as_of in [0, 4] {
        assert_eq!(
            read(&table, Timestamp::committed(as_of), slot, &all),
            vec![None, None, None]
        );
    }
    assert_eq!(read(&table, Timestamp::committed(5), slot, &all), vec![Some(7), Some(8), Some(9)]);
}

/// Long chains of multi-column updates replay to every intermediate state.
#[test]
#[timeout(10000)]
fn test_multi_column_update_chain() {
    const VERSIONS: usize = 64;
    let mut rng = StdRng::seed_from_u64(99);
    let (pool, layout, config) = fixture(&[8, 1, 2, 4, 8, 4, 2], StorageConfig::default());
    let all = layout.all_user_columns();

    // history[k] is the tuple as of commit timestamp k + 1.
    let mut history: Vec<Vec<Option<u64>>> = Vec::with_capacity(VERSIONS + 1);
    let first: Vec<u64> = all.iter().map(|&col| random_value(&mut rng, &layout, col)).collect();
    history.push(first.iter().copied().map(Some).collect());

    let mut changes = Vec::with_capacity(VERSIONS);
    for _ in 0..VERSIONS {
        let mut ids = all.clone();
        ids.shuffle(&mut rng);
        ids.truncate(rng.gen_range(1..=ids.len()));
        let mut redo = ProjectedRow::allocate(&layout, &ids).unwrap();
        let mut state = history.last().unwrap().clone();
        for (i, &col) in ids.iter().enumerate() {
            let value = if rng.gen_bool(0.2) {
                redo.set_null(i as u16);
                None
            } else {
                let value = random_value(&mut rng, &layout, col);
                redo.set(&layout, i as u16, value);
                Some(value)
            };
            state[col as usize - 1] = value;
        }
        history.push(state);
        changes.push((ids, redo));
    }

    let insert = DeltaRecord::new(Timestamp::committed(1), &layout, &all).unwrap();
    let undos: Vec<DeltaRecord> = changes
        .iter()
        .enumerate()
        .map(|(k, (ids, _))| {
            DeltaRecord::new(Timestamp::committed(k as u64 + 2), &layout, ids).unwrap()
        })
        .collect();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();

    let slot = table.insert(&row_with(&layout, &all, &first), &insert).unwrap();
    for ((_, redo), undo) in changes.iter().zip(&undos) {
        assert!(table.update(slot, redo, undo));
    }

    assert_eq!(read(&table, Timestamp::committed(0), slot, &all), vec![None; all.len()]);
    for (k, expected) in history.iter().enumerate() {
        assert_eq!(
            &read(&table, Timestamp::committed(k as u64 + 1), slot, &all),
            expected,
            "as of {}",
            k + 1
        );
    }
}

/// A transaction reads its own pending writes; committed readers and other
/// transactions see the latest committed version until it commits.
#[test]
#[timeout(2000)]
fn test_uncommitted_reader_against_committed_reader() {
    let (pool, layout, config) = fixture(&[8, 4, 4], StorageConfig::default());
    let all = layout.all_user_columns();
    let writer = Timestamp::uncommitted(3);
    let bystander = Timestamp::uncommitted(4);

    let insert = DeltaRecord::new(Timestamp::committed(1), &layout, &all).unwrap();
    let committed = DeltaRecord::new(Timestamp::committed(2), &layout, &[1]).unwrap();
    let pending = DeltaRecord::new(writer, &layout, &[2]).unwrap();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();

    let slot = table
        .insert(&row_with(&layout, &all, &[10, 20]), &insert)
        .unwrap();
    assert!(table.update(slot, &row_with(&layout, &[1], &[11]), &committed));
    assert!(table.update(slot, &row_with(&layout, &[2], &[21]), &pending));

    assert_eq!(read(&table, writer, slot, &all), vec![Some(11), Some(21)]);
    assert_eq!(read(&table, bystander, slot, &all), vec![Some(11), Some(20)]);
    assert_eq!(read(&table, Timestamp::committed(100), slot, &all), vec![Some(11), Some(20)]);
    assert_eq!(read(&table, Timestamp::committed(1), slot, &all), vec![Some(10), Some(20)]);

    pending.set_timestamp(Timestamp::committed(3));
    assert_eq!(read(&table, bystander, slot, &all), vec![Some(11), Some(21)]);
    assert_eq!(read(&table, Timestamp::committed(3), slot, &all), vec![Some(11), Some(21)]);
    assert_eq!(read(&table, Timestamp::committed(2), slot, &all), vec![Some(11), Some(20)]);
}
