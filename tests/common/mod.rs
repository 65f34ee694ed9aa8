//! Shared helpers for the integration suites: u64 keys stored big-endian so
//! byte order matches numeric order, u64 values stored little-endian.
#![allow(dead_code)]

use arbor::{Btree, OpFlags, OpStatus, Tx};
use eyre::Result;

pub fn put_u64(bt: &Btree<'_>, tx: &mut Tx<'_>, key: u64, val: u64) -> OpStatus {
    let kb = key.to_be_bytes();
    bt.put(&kb, OpFlags::NONE, tx, |rec| {
        if rec.status == OpStatus::Success {
            rec.key.copy_from_slice(&kb);
            rec.val.copy_from_slice(&val.to_le_bytes());
        }
        Ok(())
    })
    .expect("put failed")
}

pub fn get_u64(bt: &Btree<'_>, key: u64) -> Option<u64> {
    let mut out = None;
    bt.get(&key.to_be_bytes(), OpFlags::EQUAL, |rec| {
        if rec.status == OpStatus::Success {
            out = Some(u64::from_le_bytes(rec.val.try_into().unwrap()));
        }
        Ok(())
    })
    .expect("get failed");
    out
}

pub fn del_u64(bt: &Btree<'_>, tx: &mut Tx<'_>, key: u64) -> OpStatus {
    bt.del(&key.to_be_bytes(), OpFlags::NONE, tx, |_| Ok(()))
        .expect("del failed")
}

fn rec_pair(rec: &arbor::Rec<'_>) -> (u64, u64) {
    (
        u64::from_be_bytes(rec.key.try_into().unwrap()),
        u64::from_le_bytes(rec.val.try_into().unwrap()),
    )
}

/// Every record with key >= `from`, in ascending order, by slant lookup of
/// the first record followed by forward iteration to the boundary.
pub fn collect_from(bt: &Btree<'_>, from: u64) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::new();

    let mut first = None;
    let st = bt
        .get(&from.to_be_bytes(), OpFlags::SLANT, |rec| {
            if rec.status == OpStatus::Success {
                first = Some(rec_pair(rec));
            }
            Ok(())
        })
        .expect("slant get failed");
    let Some(first) = first else {
        assert_eq!(st, OpStatus::BtreeBoundary);
        return out;
    };
    out.push(first);

    loop {
        let cursor = out.last().unwrap().0;
        let mut next = None;
        let st = bt
            .iter(&cursor.to_be_bytes(), OpFlags::NEXT, |rec| {
                if rec.status == OpStatus::Success {
                    next = Some(rec_pair(rec));
                }
                Ok(())
            })
            .expect("iter failed");
        match st {
            OpStatus::Success => out.push(next.unwrap()),
            OpStatus::BtreeBoundary => return out,
            other => panic!("unexpected iteration status {other:?}"),
        }
    }
}

pub fn check_consistent(bt: &Btree<'_>) -> Result<()> {
    bt.verify_invariants()
}
