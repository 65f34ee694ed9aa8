//! End-to-end key-value scenarios on a single thread: randomized round
//! trips, root splits and the collapse back to an empty root, slant lookups,
//! and full enumerations.

mod common;

use arbor::{BtreeType, NullSink, OpFlags, OpStatus, Store, Tx, NTYPE_FIXED};
use common::{collect_from, del_u64, get_u64, put_u64};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

const TT: BtreeType = BtreeType {
    id: 1,
    ksize: 8,
    vsize: 8,
};

fn scratch_store(size: u64) -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("kv.seg"), size).unwrap();
    (dir, store)
}

#[test]
fn randomized_puts_round_trip_through_gets() {
    let (_dir, store) = scratch_store(1 << 24);
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();

    let mut keys: Vec<u64> = (0..2048).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    keys.shuffle(&mut rng);

    for &key in &keys {
        assert_eq!(put_u64(&bt, &mut tx, key, key), OpStatus::Success);
    }
    bt.verify_invariants().unwrap();

    for key in 0..2048u64 {
        assert_eq!(get_u64(&bt, key), Some(key), "key {key} lost");
    }
    assert_eq!(get_u64(&bt, 5000), None);
}

#[test]
fn enumeration_visits_exactly_the_stored_set() {
    let (_dir, store) = scratch_store(1 << 24);
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();

    let mut keys: Vec<u64> = (0..500).map(|i| i * 3 + 1).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    keys.shuffle(&mut rng);
    for &key in &keys {
        put_u64(&bt, &mut tx, key, key * 2);
    }

    let all = collect_from(&bt, 0);
    assert_eq!(all.len(), 500);
    let expect: Vec<(u64, u64)> = (0..500).map(|i| (i * 3 + 1, (i * 3 + 1) * 2)).collect();
    assert_eq!(all, expect);

    // Backward iteration mirrors the forward walk.
    let mut cursor = u64::MAX;
    let mut backwards = Vec::new();
    loop {
        let mut prev = None;
        let st = bt
            .iter(&cursor.to_be_bytes(), OpFlags::PREV, |rec| {
                if rec.status == OpStatus::Success {
                    prev = Some(u64::from_be_bytes(rec.key.try_into().unwrap()));
                }
                Ok(())
            })
            .unwrap();
        match st {
            OpStatus::Success => {
                cursor = prev.unwrap();
                backwards.push(cursor);
            }
            OpStatus::BtreeBoundary => break,
            other => panic!("unexpected status {other:?}"),
        }
    }
    let mut forward_keys: Vec<u64> = expect.iter().map(|(k, _)| *k).collect();
    forward_keys.reverse();
    assert_eq!(backwards, forward_keys);
}

#[test]
fn deleting_absent_keys_is_a_reported_no_op() {
    let (_dir, store) = scratch_store(1 << 22);
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();

    for key in 0..50u64 {
        put_u64(&bt, &mut tx, key, key);
    }
    assert_eq!(del_u64(&bt, &mut tx, 1000), OpStatus::KeyNotFound);
    assert_eq!(del_u64(&bt, &mut tx, 25), OpStatus::Success);
    assert_eq!(del_u64(&bt, &mut tx, 25), OpStatus::KeyNotFound);
    assert_eq!(collect_from(&bt, 0).len(), 49);
}

/// Four records per node: ascending inserts force root splits, descending
/// deletes collapse the tree one node at a time down to an empty root.
#[test]
fn root_split_then_collapse_to_empty_root() {
    let (_dir, store) = scratch_store(1 << 22);
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);

    // 512-byte nodes with 110-byte keys hold exactly 4 records.
    let tt = BtreeType {
        id: 2,
        ksize: 110,
        vsize: 8,
    };
    let bt = store.btree_create(512, tt, NTYPE_FIXED, &mut tx).unwrap();

    let make_key = |n: u64| {
        let mut key = [0u8; 110];
        key[..8].copy_from_slice(&n.to_be_bytes());
        key
    };

    for n in 0..17u64 {
        let key = make_key(n);
        let st = bt
            .put(&key, OpFlags::NONE, &mut tx, |rec| {
                if rec.status == OpStatus::Success {
                    rec.key.copy_from_slice(&key);
                    rec.val.copy_from_slice(&n.to_le_bytes());
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(st, OpStatus::Success);
        bt.verify_invariants().unwrap();
    }
    assert!(bt.height() >= 3, "17 inserts at 4 per node must split twice");

    for n in (0..17u64).rev() {
        let st = bt
            .del(&make_key(n), OpFlags::NONE, &mut tx, |_| Ok(()))
            .unwrap();
        assert_eq!(st, OpStatus::Success, "deleting {n}");
        if n > 0 {
            bt.verify_invariants().unwrap();
        }
    }
    assert_eq!(bt.height(), 1);

    let st = bt
        .get(&make_key(0), OpFlags::SLANT, |_| Ok(()))
        .unwrap();
    assert_eq!(st, OpStatus::BtreeBoundary, "tree should be empty");
    bt.destroy().unwrap();
}

#[test]
fn slant_finds_key_or_successor() {
    let (_dir, store) = scratch_store(1 << 22);
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();

    for key in [5u64, 10, 15, 20] {
        put_u64(&bt, &mut tx, key, key * 100);
    }

    let probe = |key: u64| {
        let mut hit = None;
        let st = bt
            .get(&key.to_be_bytes(), OpFlags::SLANT, |rec| {
                if rec.status == OpStatus::Success {
                    hit = Some((
                        u64::from_be_bytes(rec.key.try_into().unwrap()),
                        u64::from_le_bytes(rec.val.try_into().unwrap()),
                    ));
                }
                Ok(())
            })
            .unwrap();
        (st, hit)
    };

    assert_eq!(probe(7), (OpStatus::Success, Some((10, 1000))));
    assert_eq!(probe(20), (OpStatus::Success, Some((20, 2000))));
    assert_eq!(probe(25), (OpStatus::BtreeBoundary, None));
    assert_eq!(probe(1), (OpStatus::Success, Some((5, 500))));
}

#[test]
fn interleaved_puts_and_dels_keep_the_tree_sound() {
    let (_dir, store) = scratch_store(1 << 24);
    let mut sink = NullSink;
    let mut tx = Tx::new(&mut sink);
    let bt = store.btree_create(1024, TT, NTYPE_FIXED, &mut tx).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut present = std::collections::BTreeSet::new();
    let mut ops: Vec<u64> = (0..600).collect();
    ops.shuffle(&mut rng);

    for (step, key) in ops.iter().enumerate() {
        let key = key % 300;
        if present.contains(&key) {
            assert_eq!(del_u64(&bt, &mut tx, key), OpStatus::Success);
            present.remove(&key);
        } else {
            assert_eq!(put_u64(&bt, &mut tx, key, key + 1), OpStatus::Success);
            present.insert(key);
        }
        if step % 97 == 0 {
            bt.verify_invariants().unwrap();
        }
    }
    bt.verify_invariants().unwrap();

    let stored: Vec<u64> = collect_from(&bt, 0).iter().map(|(k, _)| *k).collect();
    let expect: Vec<u64> = present.iter().copied().collect();
    assert_eq!(stored, expect);
}
