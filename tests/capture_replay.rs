//! Crash-safety of the capture protocol: every byte a mutation touches goes
//! to the sink, so replaying a committed capture stream against a blank
//! segment must reproduce the exact tree the live operations built.

mod common;

use arbor::{BtreeType, MemLog, OpStatus, Store, Tx, NTYPE_FIXED};
use common::{collect_from, del_u64, put_u64};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::tempdir;

const TT: BtreeType = BtreeType {
    id: 9,
    ksize: 8,
    vsize: 8,
};

const SEG_SIZE: u64 = 1 << 23;

#[test]
fn replayed_captures_rebuild_the_same_tree() {
    let dir = tempdir().unwrap();

    let live = Store::create(dir.path().join("live.seg"), SEG_SIZE).unwrap();
    let mut log = MemLog::new();
    let root;
    let live_view;
    {
        let mut tx = Tx::new(&mut log);
        let bt = live.btree_create(512, TT, NTYPE_FIXED, &mut tx).unwrap();

        let mut keys: Vec<u64> = (0..600).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
        keys.shuffle(&mut rng);
        for &key in &keys {
            assert_eq!(put_u64(&bt, &mut tx, key, key ^ 0xABCD), OpStatus::Success);
        }
        // Deletions exercise underflow collapse captures too.
        for key in 0..600u64 {
            if key % 3 == 0 {
                assert_eq!(del_u64(&bt, &mut tx, key), OpStatus::Success);
            }
        }
        bt.verify_invariants().unwrap();

        root = bt.root_addr();
        live_view = collect_from(&bt, 0);
        tx.commit();
    }
    assert!(!log.committed().is_empty());

    let blank = Store::create(dir.path().join("replay.seg"), SEG_SIZE).unwrap();
    log.replay_into(blank.segment()).unwrap();

    let bt = blank.btree_open(root, 512).unwrap();
    bt.verify_invariants().unwrap();
    let replay_view = collect_from(&bt, 0);
    assert_eq!(replay_view, live_view);
}

#[test]
fn uncommitted_captures_are_not_part_of_the_replay() {
    let dir = tempdir().unwrap();

    let live = Store::create(dir.path().join("live.seg"), SEG_SIZE).unwrap();
    let mut log = MemLog::new();
    let root;
    let committed_view;
    {
        let mut tx = Tx::new(&mut log);
        let bt = live.btree_create(512, TT, NTYPE_FIXED, &mut tx).unwrap();
        for key in 0..100u64 {
            put_u64(&bt, &mut tx, key, key);
        }
        root = bt.root_addr();
        committed_view = collect_from(&bt, 0);
        tx.commit();

        // A second transaction that never commits: its captures stay out of
        // the durable prefix.
        let mut tx2 = Tx::new(&mut log);
        for key in 100..200u64 {
            put_u64(&bt, &mut tx2, key, key);
        }
        drop(tx2);
    }

    let blank = Store::create(dir.path().join("replay.seg"), SEG_SIZE).unwrap();
    log.replay_into(blank.segment()).unwrap();

    let bt = blank.btree_open(root, 512).unwrap();
    bt.verify_invariants().unwrap();
    assert_eq!(collect_from(&bt, 0), committed_view);
}

#[test]
fn capture_volume_respects_credit_estimates() {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("credit.seg"), SEG_SIZE).unwrap();

    let mut log = MemLog::new();
    let bt = {
        let mut tx = Tx::new(&mut log);
        let bt = store.btree_create(512, TT, NTYPE_FIXED, &mut tx).unwrap();
        for key in 0..200u64 {
            put_u64(&bt, &mut tx, key, key);
        }
        tx.commit();
        bt
    };

    let mut credit = arbor::Credit::default();
    bt.credit(arbor::CreditOp::Put, &mut credit);

    let before = log.len();
    {
        let mut tx = Tx::new(&mut log);
        put_u64(&bt, &mut tx, 999, 999);
        tx.commit();
    }
    let captured: u64 = log.records()[before..]
        .iter()
        .map(|r| r.bytes.len() as u64)
        .sum();
    assert!(
        captured <= credit.bytes,
        "one put captured {captured} bytes, credit promised at most {}",
        credit.bytes
    );
}
