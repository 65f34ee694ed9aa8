//! Concurrency suites: disjoint writer streams, writers with overlapping
//! descent paths (exercising validation restarts and lock escalation), and
//! readers racing writers.

mod common;

use std::sync::Barrier;

use arbor::{BtreeType, NullSink, OpStatus, Store, Tx, NTYPE_FIXED};
use common::{collect_from, get_u64, put_u64};
use tempfile::tempdir;

const TT: BtreeType = BtreeType {
    id: 1,
    ksize: 8,
    vsize: 8,
};

#[test]
fn disjoint_streams_interleave_into_one_sorted_set() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("mt.seg"), 1 << 25).unwrap();
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();
    drop(tx);

    const STREAMS: u64 = 8;
    const PER_STREAM: u64 = 256;
    let barrier = Barrier::new(STREAMS as usize);

    std::thread::scope(|scope| {
        for stream in 0..STREAMS {
            let bt = &bt;
            let barrier = &barrier;
            scope.spawn(move || {
                let mut sink = NullSink;
                let mut tx = Tx::new(&mut sink);
                barrier.wait();
                for i in 0..PER_STREAM {
                    let key = stream * 10_000 + i + 1;
                    assert_eq!(put_u64(bt, &mut tx, key, key * 2), OpStatus::Success);
                }
                tx.commit();
            });
        }
    });

    bt.verify_invariants().unwrap();
    let all = collect_from(&bt, 1);
    assert_eq!(all.len(), (STREAMS * PER_STREAM) as usize);
    for pair in all.windows(2) {
        assert!(pair[0].0 < pair[1].0, "iteration out of order");
    }
    for (key, val) in all {
        assert_eq!(val, key * 2);
    }
}

#[test]
fn overlapping_writers_all_complete_consistently() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("clash.seg"), 1 << 25).unwrap();
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(512, TT, NTYPE_FIXED, &mut tx).unwrap();
    drop(tx);

    // Two writers, interleaved keys over the same range: every descent
    // shares the same spine, so validation failures and lock escalation get
    // a workout.
    const PER_WRITER: u64 = 1500;
    let barrier = Barrier::new(2);

    std::thread::scope(|scope| {
        for parity in 0..2u64 {
            let bt = &bt;
            let barrier = &barrier;
            scope.spawn(move || {
                let mut sink = NullSink;
                let mut tx = Tx::new(&mut sink);
                barrier.wait();
                for i in 0..PER_WRITER {
                    let key = i * 2 + parity;
                    assert_eq!(put_u64(bt, &mut tx, key, key + 100), OpStatus::Success);
                }
                tx.commit();
            });
        }
    });

    bt.verify_invariants().unwrap();
    for key in 0..PER_WRITER * 2 {
        assert_eq!(get_u64(&bt, key), Some(key + 100), "key {key} missing");
    }
}

#[test]
fn readers_race_writers_without_tearing() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("rw.seg"), 1 << 25).unwrap();
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();

    // Seed half the key space so readers always have something to find.
    for key in 0..512u64 {
        put_u64(&bt, &mut tx, key * 2, key * 2 + 1);
    }
    drop(tx);

    let barrier = Barrier::new(3);
    std::thread::scope(|scope| {
        let writer = {
            let bt = &bt;
            let barrier = &barrier;
            scope.spawn(move || {
                let mut sink = NullSink;
                let mut tx = Tx::new(&mut sink);
                barrier.wait();
                for key in 0..512u64 {
                    assert_eq!(
                        put_u64(bt, &mut tx, key * 2 + 1, key),
                        OpStatus::Success
                    );
                }
                tx.commit();
            })
        };
        for _ in 0..2 {
            let bt = &bt;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for round in 0..4 {
                    for key in 0..512u64 {
                        // Pre-seeded records must always be intact; the
                        // writer's records appear atomically or not at all.
                        assert_eq!(get_u64(bt, key * 2), Some(key * 2 + 1));
                        if round == 3 {
                            if let Some(v) = get_u64(bt, key * 2 + 1) {
                                assert_eq!(v, key);
                            }
                        }
                    }
                }
            });
        }
        writer.join().unwrap();
    });

    bt.verify_invariants().unwrap();
    for key in 0..512u64 {
        assert_eq!(get_u64(&bt, key * 2 + 1), Some(key));
    }
}

#[test]
fn concurrent_opens_share_one_descriptor_and_close_cleanly() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("open.seg"), 1 << 22).unwrap();
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let mut bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();
    put_u64(&bt, &mut tx, 1, 10);
    let root = bt.root_addr();
    drop(tx);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let store = &store;
            scope.spawn(move || {
                let mut handle = store.btree_open(root, 1024).unwrap();
                assert_eq!(get_u64(&handle, 1), Some(10));
                handle.close().unwrap();
            });
        }
    });

    bt.close().unwrap();
}
