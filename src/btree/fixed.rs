//! # Fixed-Format Node
//!
//! The default node format: keys and values of sizes fixed per tree, stored
//! as contiguous slots after a 40-byte header.
//!
//! ## Frame Layout
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ----------------------------------------
//! 0       2     fmt_version     Format version (1)
//! 2       2     fmt_type        Format tag ("Bn")
//! 4       4     footer_offset   Offset of the footer (32)
//! 8       4     node_type       Node-format id selecting the vtable
//! 12      4     tree_type       Tree-type id
//! 16      8     opaque          In-memory descriptor token (not checksummed)
//! 24      2     used            Count of record slots
//! 26      1     shift           Node size as a power-of-2 exponent
//! 27      1     level           0 at leaves, parent = child + 1
//! 28      2     ksize           Key size in bytes
//! 30      2     vsize           Leaf value size in bytes
//! 32      4     footer_version  Footer tag
//! 36      4     footer_checksum CRC-32 of the header region
//! 40      ...   record slots    used × (ksize + value size), key-ascending
//! ```
//!
//! All multi-byte fields are little-endian. The checksum covers the header
//! region minus the opaque slot, which only ever holds an in-memory token and
//! may be rewritten without a footer update.
//!
//! ## Slot Stride
//!
//! A slot is `ksize + vsize` bytes in a leaf and `ksize + 8` bytes in an
//! internal node, where the value is a child segment address. The stored
//! `vsize` always records the leaf value size; the stride follows the node's
//! current level, which keeps the root's record area consistent across the
//! leaf↔internal transitions of root splits and demotions.
//!
//! ## Internal-Node Sentinel
//!
//! An internal node with `used` slots has `used - 1` delimiting keys; the
//! last slot's key bytes are unused and its value is the rightmost child.
//! `find` binary-searches the delimiting keys only.

use crc::{Crc, CRC_32_ISCSI};
use smallvec::smallvec;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::ADDR_VSIZE;
use crate::storage::SegAddr;
use super::node::{CapRange, Captures, NodeOps};

pub const NTYPE_FIXED: u32 = 1;

pub const NODE_HEADER_SIZE: usize = 40;
const FOOTER_OFFSET: usize = 32;
const OPAQUE_OFFSET: usize = 16;
const USED_OFFSET: usize = 24;
const LEVEL_OFFSET: usize = 27;

const FORMAT_VERSION: u16 = 1;
const FORMAT_TYPE_BNODE: u16 = u16::from_le_bytes(*b"Bn");
const FOOTER_VERSION: u32 = 1;

const FOOTER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHead {
    fmt_version: U16,
    fmt_type: U16,
    footer_offset: U32,
    node_type: U32,
    tree_type: U32,
    opaque: U64,
    used: U16,
    shift: u8,
    level: u8,
    ksize: U16,
    vsize: U16,
    footer_version: U32,
    footer_checksum: U32,
}

const _: () = assert!(std::mem::size_of::<NodeHead>() == NODE_HEADER_SIZE);

fn head(frame: &[u8]) -> &NodeHead {
    NodeHead::ref_from_bytes(&frame[..NODE_HEADER_SIZE]).expect("frame shorter than node header")
}

fn head_mut(frame: &mut [u8]) -> &mut NodeHead {
    NodeHead::mut_from_bytes(&mut frame[..NODE_HEADER_SIZE])
        .expect("frame shorter than node header")
}

/// Checksum of the header region with the opaque slot skipped.
fn header_checksum(frame: &[u8]) -> u32 {
    let mut digest = FOOTER_CRC.digest();
    digest.update(&frame[..OPAQUE_OFFSET]);
    digest.update(&[0u8; 8]);
    digest.update(&frame[OPAQUE_OFFSET + 8..FOOTER_OFFSET]);
    digest.finalize()
}

fn stride(h: &NodeHead) -> usize {
    let vsize = if h.level > 0 {
        ADDR_VSIZE
    } else {
        h.vsize.get() as usize
    };
    h.ksize.get() as usize + vsize
}

fn rec_offset(h: &NodeHead, idx: usize) -> usize {
    NODE_HEADER_SIZE + idx * stride(h)
}

/// The fixed-format vtable instance.
pub static FIXED_FORMAT: FixedFormat = FixedFormat;

/// Fixed key size, fixed value size node format.
pub struct FixedFormat;

impl NodeOps for FixedFormat {
    fn id(&self) -> u32 {
        NTYPE_FIXED
    }

    fn name(&self) -> &'static str {
        "bnode_fixed_format"
    }

    fn init(
        &self,
        frame: &mut [u8],
        shift: u8,
        ksize: u16,
        vsize: u16,
        ntype: u32,
        ttype: u32,
    ) -> Captures {
        debug_assert!(ksize != 0 && vsize != 0);
        debug_assert_eq!(frame.len(), 1usize << shift);

        let h = NodeHead {
            fmt_version: U16::new(FORMAT_VERSION),
            fmt_type: U16::new(FORMAT_TYPE_BNODE),
            footer_offset: U32::new(FOOTER_OFFSET as u32),
            node_type: U32::new(ntype),
            tree_type: U32::new(ttype),
            opaque: U64::new(0),
            used: U16::new(0),
            shift,
            level: 0,
            ksize: U16::new(ksize),
            vsize: U16::new(vsize),
            footer_version: U32::new(FOOTER_VERSION),
            footer_checksum: U32::new(0),
        };
        frame[..NODE_HEADER_SIZE].copy_from_slice(h.as_bytes());
        let sum = header_checksum(frame);
        head_mut(frame).footer_checksum = U32::new(sum);

        smallvec![CapRange::new(0, NODE_HEADER_SIZE)]
    }

    fn fini(&self, frame: &mut [u8]) -> Captures {
        let h = head_mut(frame);
        h.fmt_version = U16::new(0);
        h.fmt_type = U16::new(0);
        smallvec![CapRange::new(0, 4)]
    }

    fn count(&self, frame: &[u8]) -> usize {
        let h = head(frame);
        let used = h.used.get() as usize;
        if h.level > 0 {
            used.saturating_sub(1)
        } else {
            used
        }
    }

    fn count_rec(&self, frame: &[u8]) -> usize {
        head(frame).used.get() as usize
    }

    fn space(&self, frame: &[u8]) -> usize {
        let h = head(frame);
        (1usize << h.shift) - NODE_HEADER_SIZE - h.used.get() as usize * stride(h)
    }

    fn level(&self, frame: &[u8]) -> u8 {
        head(frame).level
    }

    fn shift(&self, frame: &[u8]) -> u8 {
        head(frame).shift
    }

    fn tree_type(&self, frame: &[u8]) -> u32 {
        head(frame).tree_type.get()
    }

    fn keysize(&self, frame: &[u8]) -> usize {
        head(frame).ksize.get() as usize
    }

    fn valsize(&self, frame: &[u8]) -> usize {
        let h = head(frame);
        if h.level > 0 {
            ADDR_VSIZE
        } else {
            h.vsize.get() as usize
        }
    }

    fn leaf_valsize(&self, frame: &[u8]) -> usize {
        head(frame).vsize.get() as usize
    }

    fn is_underflow(&self, frame: &[u8], predict: bool) -> bool {
        let mut used = head(frame).used.get();
        if predict && used != 0 {
            used -= 1;
        }
        used == 0
    }

    fn is_overflow(&self, frame: &[u8]) -> bool {
        self.space(frame) < stride(head(frame))
    }

    fn key<'a>(&self, frame: &'a [u8], idx: usize) -> &'a [u8] {
        let h = head(frame);
        debug_assert!(idx < h.used.get() as usize || (h.used.get() == 0 && idx == 0));
        let off = rec_offset(h, idx);
        &frame[off..off + h.ksize.get() as usize]
    }

    fn val<'a>(&self, frame: &'a [u8], idx: usize) -> &'a [u8] {
        let h = head(frame);
        debug_assert!(idx < h.used.get() as usize || (h.used.get() == 0 && idx == 0));
        let off = rec_offset(h, idx) + h.ksize.get() as usize;
        &frame[off..off + self.valsize(frame)]
    }

    fn rec_mut<'a>(&self, frame: &'a mut [u8], idx: usize) -> (&'a mut [u8], &'a mut [u8]) {
        let h = head(frame);
        debug_assert!(idx < h.used.get() as usize);
        let ksize = h.ksize.get() as usize;
        let vsize = self.valsize(frame);
        let off = rec_offset(h, idx);
        let (key, rest) = frame[off..off + ksize + vsize].split_at_mut(ksize);
        (key, rest)
    }

    fn child(&self, frame: &[u8], idx: usize) -> SegAddr {
        let val = self.val(frame, idx);
        debug_assert_eq!(val.len(), ADDR_VSIZE);
        SegAddr::from_raw(u64::from_le_bytes(val.try_into().expect("child value size")))
    }

    fn is_fit(&self, frame: &[u8], klen: usize, vlen: usize) -> bool {
        debug_assert_eq!(klen, self.keysize(frame));
        debug_assert_eq!(vlen, self.valsize(frame));
        klen + vlen <= self.space(frame)
    }

    fn make(&self, frame: &mut [u8], idx: usize) -> Captures {
        let h = head(frame);
        let used = h.used.get() as usize;
        let rsize = stride(h);
        debug_assert!(idx <= used);
        debug_assert!(self.space(frame) >= rsize);

        let start = rec_offset(h, idx);
        let tail = rsize * (used - idx);
        frame.copy_within(start..start + tail, start + rsize);
        let h = head_mut(frame);
        h.used = U16::new((used + 1) as u16);

        smallvec![
            CapRange::new(start, rsize * (used - idx + 1)),
            CapRange::new(USED_OFFSET, 2),
        ]
    }

    fn del(&self, frame: &mut [u8], idx: usize) -> Captures {
        let h = head(frame);
        let used = h.used.get() as usize;
        let rsize = stride(h);
        debug_assert!(idx < used && used > 0);

        let start = rec_offset(h, idx);
        let tail = rsize * (used - idx - 1);
        frame.copy_within(start + rsize..start + rsize + tail, start);
        let h = head_mut(frame);
        h.used = U16::new((used - 1) as u16);

        let mut caps: Captures = smallvec![CapRange::new(USED_OFFSET, 2)];
        if tail > 0 {
            caps.push(CapRange::new(start, tail));
        }
        caps
    }

    fn set_level(&self, frame: &mut [u8], level: u8) -> Captures {
        head_mut(frame).level = level;
        smallvec![CapRange::new(LEVEL_OFFSET, 1)]
    }

    fn fix(&self, frame: &mut [u8]) -> Captures {
        let sum = header_checksum(frame);
        head_mut(frame).footer_checksum = U32::new(sum);
        smallvec![CapRange::new(FOOTER_OFFSET, 8)]
    }

    fn is_valid(&self, frame: &[u8]) -> bool {
        let h = head(frame);
        h.fmt_version.get() == FORMAT_VERSION
            && h.fmt_type.get() == FORMAT_TYPE_BNODE
            && h.footer_offset.get() == FOOTER_OFFSET as u32
            && h.footer_version.get() == FOOTER_VERSION
    }

    fn verify(&self, frame: &[u8]) -> bool {
        head(frame).footer_checksum.get() == header_checksum(frame)
    }

    fn invariant(&self, frame: &[u8], addr: SegAddr) -> bool {
        head(frame).shift == addr.shift()
    }

    fn opaque(&self, frame: &[u8]) -> u64 {
        head(frame).opaque.get()
    }

    fn set_opaque(&self, frame: &mut [u8], token: u64) {
        head_mut(frame).opaque = U64::new(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{find, move_recs, Dir, MoveCount};

    const OPS: &FixedFormat = &FIXED_FORMAT;

    fn new_frame(shift: u8, ksize: u16, vsize: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 1 << shift];
        OPS.init(&mut frame, shift, ksize, vsize, NTYPE_FIXED, 7);
        frame
    }

    fn insert(frame: &mut [u8], key: u64, val: u64) {
        let (idx, found) = find(OPS, frame, &key.to_be_bytes());
        assert!(!found);
        OPS.make(frame, idx);
        let (k, v) = OPS.rec_mut(frame, idx);
        k.copy_from_slice(&key.to_be_bytes());
        v.copy_from_slice(&val.to_le_bytes());
        OPS.fix(frame);
    }

    #[test]
    fn init_produces_valid_empty_leaf() {
        let frame = new_frame(9, 8, 8);
        assert!(OPS.is_valid(&frame));
        assert!(OPS.verify(&frame));
        assert_eq!(OPS.count(&frame), 0);
        assert_eq!(OPS.count_rec(&frame), 0);
        assert_eq!(OPS.level(&frame), 0);
        assert_eq!(OPS.shift(&frame), 9);
        assert_eq!(OPS.keysize(&frame), 8);
        assert_eq!(OPS.valsize(&frame), 8);
        assert_eq!(OPS.space(&frame), 512 - NODE_HEADER_SIZE);
    }

    #[test]
    fn find_reports_insertion_point_and_exact_match() {
        let mut frame = new_frame(9, 8, 8);
        for key in [10u64, 20, 30] {
            insert(&mut frame, key, key * 100);
        }

        assert_eq!(find(OPS, &frame, &5u64.to_be_bytes()), (0, false));
        assert_eq!(find(OPS, &frame, &10u64.to_be_bytes()), (0, true));
        assert_eq!(find(OPS, &frame, &15u64.to_be_bytes()), (1, false));
        assert_eq!(find(OPS, &frame, &30u64.to_be_bytes()), (2, true));
        assert_eq!(find(OPS, &frame, &35u64.to_be_bytes()), (3, false));
    }

    #[test]
    fn records_stay_sorted_through_make_and_del() {
        let mut frame = new_frame(9, 8, 8);
        for key in [30u64, 10, 20, 40] {
            insert(&mut frame, key, key);
        }
        assert_eq!(OPS.count_rec(&frame), 4);

        let keys: Vec<u64> = (0..4)
            .map(|i| u64::from_be_bytes(OPS.key(&frame, i).try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![10, 20, 30, 40]);

        OPS.del(&mut frame, 1);
        OPS.fix(&mut frame);
        let keys: Vec<u64> = (0..3)
            .map(|i| u64::from_be_bytes(OPS.key(&frame, i).try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![10, 30, 40]);
        assert_eq!(
            u64::from_le_bytes(OPS.val(&frame, 1).try_into().unwrap()),
            30
        );
    }

    #[test]
    fn overflow_and_underflow_track_record_count() {
        let mut frame = new_frame(9, 8, 8);
        assert!(OPS.is_underflow(&frame, false));

        let capacity = (512 - NODE_HEADER_SIZE) / 16;
        for key in 0..capacity as u64 {
            assert!(!OPS.is_overflow(&frame));
            insert(&mut frame, key, key);
        }
        assert!(OPS.is_overflow(&frame));
        assert!(!OPS.is_fit(&frame, 8, 8));
        assert!(!OPS.is_underflow(&frame, false));

        for idx in (1..capacity).rev() {
            OPS.del(&mut frame, idx);
        }
        assert!(!OPS.is_underflow(&frame, false));
        assert!(OPS.is_underflow(&frame, true));
        OPS.del(&mut frame, 0);
        assert!(OPS.is_underflow(&frame, false));
    }

    #[test]
    fn internal_slot_stride_uses_address_size() {
        let mut frame = new_frame(9, 8, 64);
        assert_eq!(OPS.valsize(&frame), 64);

        OPS.set_level(&mut frame, 1);
        assert_eq!(OPS.valsize(&frame), ADDR_VSIZE);

        let addr = SegAddr::build(0x2000, 9);
        OPS.make(&mut frame, 0);
        let (k, v) = OPS.rec_mut(&mut frame, 0);
        k.copy_from_slice(&1u64.to_be_bytes());
        v.copy_from_slice(&addr.raw().to_le_bytes());
        OPS.fix(&mut frame);

        assert_eq!(OPS.child(&frame, 0), addr);
        // One slot has delimiting key semantics only above the sentinel.
        assert_eq!(OPS.count_rec(&frame), 1);
        assert_eq!(OPS.count(&frame), 0);
    }

    #[test]
    fn footer_detects_header_corruption() {
        let mut frame = new_frame(9, 8, 8);
        insert(&mut frame, 1, 1);
        assert!(OPS.verify(&frame));

        frame[USED_OFFSET] ^= 0xFF;
        assert!(!OPS.verify(&frame));
    }

    #[test]
    fn opaque_token_does_not_disturb_checksum() {
        let mut frame = new_frame(9, 8, 8);
        insert(&mut frame, 1, 1);
        assert!(OPS.verify(&frame));

        OPS.set_opaque(&mut frame, 0xDEAD_BEEF);
        assert_eq!(OPS.opaque(&frame), 0xDEAD_BEEF);
        assert!(OPS.verify(&frame));
    }

    #[test]
    fn fini_invalidates_the_frame() {
        let mut frame = new_frame(9, 8, 8);
        assert!(OPS.is_valid(&frame));
        OPS.fini(&mut frame);
        assert!(!OPS.is_valid(&frame));
    }

    #[test]
    fn move_even_balances_free_space() {
        let mut src = new_frame(9, 8, 8);
        let mut tgt = new_frame(9, 8, 8);
        for key in 0..20u64 {
            insert(&mut src, key, key);
        }

        move_recs(OPS, &mut src, OPS, &mut tgt, Dir::Left, MoveCount::Even);

        let moved = OPS.count_rec(&tgt);
        assert!(moved == 10, "expected an even split, moved {moved}");
        // Left move drains the low end of the source.
        assert_eq!(
            u64::from_be_bytes(OPS.key(&tgt, 0).try_into().unwrap()),
            0
        );
        assert_eq!(
            u64::from_be_bytes(OPS.key(&src, 0).try_into().unwrap()),
            10
        );
        assert!(OPS.verify(&src) && OPS.verify(&tgt));
    }

    #[test]
    fn move_max_drains_the_source() {
        let mut src = new_frame(9, 8, 8);
        let mut tgt = new_frame(9, 8, 8);
        for key in 0..7u64 {
            insert(&mut src, key, key);
        }

        move_recs(OPS, &mut src, OPS, &mut tgt, Dir::Right, MoveCount::Max);

        assert_eq!(OPS.count_rec(&src), 0);
        assert_eq!(OPS.count_rec(&tgt), 7);
        let keys: Vec<u64> = (0..7)
            .map(|i| u64::from_be_bytes(OPS.key(&tgt, i).try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn move_count_transfers_exactly_n() {
        let mut src = new_frame(9, 8, 8);
        let mut tgt = new_frame(9, 8, 8);
        for key in 0..6u64 {
            insert(&mut src, key, key);
        }

        move_recs(OPS, &mut src, OPS, &mut tgt, Dir::Right, MoveCount::Count(2));

        assert_eq!(OPS.count_rec(&src), 4);
        assert_eq!(OPS.count_rec(&tgt), 2);
        // Right move takes from the source's high end.
        assert_eq!(
            u64::from_be_bytes(OPS.key(&tgt, 0).try_into().unwrap()),
            4
        );
    }

    #[test]
    fn make_and_del_report_touched_ranges() {
        let mut frame = new_frame(9, 8, 8);
        insert(&mut frame, 10, 10);
        insert(&mut frame, 30, 30);

        let caps = OPS.make(&mut frame, 1);
        assert!(caps.iter().any(|c| c.off as usize == USED_OFFSET));
        let rec_start = NODE_HEADER_SIZE + 16;
        assert!(caps
            .iter()
            .any(|c| c.off as usize == rec_start && c.len == 32));

        let (k, v) = OPS.rec_mut(&mut frame, 1);
        k.copy_from_slice(&20u64.to_be_bytes());
        v.copy_from_slice(&20u64.to_le_bytes());

        let caps = OPS.del(&mut frame, 0);
        assert!(caps.iter().any(|c| c.off as usize == USED_OFFSET));
        assert!(caps
            .iter()
            .any(|c| c.off as usize == NODE_HEADER_SIZE && c.len == 32));
    }
}
