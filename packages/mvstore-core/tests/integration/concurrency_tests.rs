//! Concurrent insert and update against one table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use mvstore_core::{DataTable, DeltaRecord, StorageConfig, Timestamp, TupleSlot};
use ntest::timeout;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::helpers::{fixture, read, row_with, small_blocks};

const NUM_THREADS: usize = 8;

/// Concurrent inserts across many block rotations never hand out the same
/// slot twice, and every row reads back as written.
#[test]
#[timeout(20000)]
fn test_concurrent_insert_unique_slots() {
    const PER_THREAD: usize = 1000;
    let (pool, layout, config) = fixture(&[8, 8], small_blocks());
    let ts = Timestamp::committed(1);
    let undos: Vec<Vec<DeltaRecord>> = (0..NUM_THREADS)
        .map(|_| {
            (0..PER_THREAD)
                .map(|_| DeltaRecord::new(ts, &layout, &[1]).unwrap())
                .collect()
        })
        .collect();
    let table = DataTable::new(pool.clone(), layout.clone(), &config).unwrap();

    let inserted: Vec<(TupleSlot, u64)> = thread::scope(|s| {
        let handles: Vec<_> = undos
            .iter()
            .enumerate()
            .map(|(t, records)| {
                let table = &table;
                let layout = &layout;
                s.spawn(move || {
                    records
                        .iter()
                        .enumerate()
                        .map(|(i, undo)| {
                            let value = (t * PER_THREAD + i) as u64;
                            let slot = table
                                .insert(&row_with(layout, &[1], &[value]), undo)
                                .unwrap();
                            (slot, value)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let slots: HashSet<TupleSlot> = inserted.iter().map(|(slot, _)| *slot).collect();
    assert_eq!(slots.len(), NUM_THREADS * PER_THREAD);

    let per_block = layout.num_slots() as usize;
    let min_blocks = (NUM_THREADS * PER_THREAD).div_ceil(per_block);
    assert!(table.num_blocks() >= min_blocks);
    assert_eq!(pool.outstanding(), table.num_blocks());

    for (slot, value) in inserted {
        assert_eq!(read(&table, ts, slot, &[1]), vec![Some(value)]);
    }
}

/// N uncommitted transactions racing to update one committed tuple: exactly
/// one wins, and nobody else observes its pending value.
#[test]
#[timeout(20000)]
fn test_concurrent_update_one_writer_wins() {
    const ROUNDS: usize = 50;
    let (pool, layout, config) = fixture(&[8, 8], StorageConfig::default());
    let inserts: Vec<DeltaRecord> = (0..ROUNDS)
        .map(|_| DeltaRecord::new(Timestamp::committed(0), &layout, &[1]).unwrap())
        .collect();
    let updates: Vec<Vec<DeltaRecord>> = (0..ROUNDS)
        .map(|_| {
            (0..NUM_THREADS)
                .map(|t| {
                    DeltaRecord::new(Timestamp::uncommitted(t as u64 + 1), &layout, &[1]).unwrap()
                })
                .collect()
        })
        .collect();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();

    for (insert, contenders) in inserts.iter().zip(&updates) {
        let slot = table
            .insert(&row_with(&layout, &[1], &[u64::MAX]), insert)
            .unwrap();
        let barrier = Barrier::new(NUM_THREADS);

        let results: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = contenders
                .iter()
                .enumerate()
                .map(|(t, undo)| {
                    let (table, layout, barrier) = (&table, &layout, &barrier);
                    s.spawn(move || {
                        let redo = row_with(layout, &[1], &[t as u64]);
                        barrier.wait();
                        table.update(slot, &redo, undo)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
        let winner = results.iter().position(|won| *won).unwrap();
        for (t, undo) in contenders.iter().enumerate() {
            assert_eq!(undo.is_linked(), t == winner);
        }

        let mine = Timestamp::uncommitted(winner as u64 + 1);
        assert_eq!(read(&table, mine, slot, &[1]), vec![Some(winner as u64)]);
        assert_eq!(read(&table, Timestamp::committed(1), slot, &[1]), vec![Some(u64::MAX)]);
    }
}

/// Readers racing a writer always see a whole committed version: both
/// columns carry the same commit timestamp, never newer than the reader's.
#[test]
#[timeout(20000)]
fn test_readers_see_consistent_versions() {
    const VERSIONS: u64 = 300;
    let (pool, layout, config) = fixture(&[8, 8, 4], StorageConfig::default());
    let insert = DeltaRecord::new(Timestamp::committed(0), &layout, &[1, 2]).unwrap();
    let updates: Vec<DeltaRecord> = (1..=VERSIONS)
        .map(|k| DeltaRecord::new(Timestamp::uncommitted(k), &layout, &[1, 2]).unwrap())
        .collect();
    let table = DataTable::new(pool, layout.clone(), &config).unwrap();
    let slot = table
        .insert(&row_with(&layout, &[1, 2], &[0, 0]), &insert)
        .unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for seed in 0..4u64 {
            let (table, done) = (&table, &done);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                while !done.load(Ordering::Acquire) {
                    let as_of = rng.gen_range(0..=VERSIONS);
                    let got = read(table, Timestamp::committed(as_of), slot, &[1, 2]);
                    let first = got[0].unwrap();
                    assert_eq!(got[1], Some(first), "torn read at {}", as_of);
                    assert!(first <= as_of);
                }
            });
        }

        for (k, undo) in (1..=VERSIONS).zip(&updates) {
            assert!(table.update(slot, &row_with(&layout, &[1, 2], &[k, k]), undo));
            undo.set_timestamp(Timestamp::committed(k));
        }
        done.store(true, Ordering::Release);
    });

    for k in 0..=VERSIONS {
        assert_eq!(
            read(&table, Timestamp::committed(k), slot, &[1, 2]),
            vec![Some(k), Some(k)]
        );
    }
}
