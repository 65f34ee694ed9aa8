//! # Node Operations
//!
//! The tree engine never touches frame bytes directly; it goes through the
//! [`NodeOps`] capability set. Each on-segment node format implements the
//! trait once, and the node-type id stored in every frame header selects the
//! implementation at load time through the [`NodeTypeRegistry`]. The engine
//! depends on nothing about a format beyond this interface.
//!
//! ## Record Slots
//!
//! A node holds `count_rec` contiguous record slots in key-ascending order.
//! In a leaf every slot is a key/value pair. In an internal node the value is
//! a child segment address, and the node stores one more child than
//! delimiting keys: the last slot is the *sentinel*, whose key bytes are
//! meaningless and whose value is the rightmost child. `count` excludes the
//! sentinel, `count_rec` includes it.
//!
//! ## Capture Discipline
//!
//! Every mutating primitive returns the byte ranges it touched as a
//! [`Captures`] list. The operation layer forwards those ranges (with the
//! bytes) to the transaction adaptor; the format implementations stay unaware
//! of the transaction API.
//!
//! ## Record Moves
//!
//! [`move_recs`] transfers records between two nodes one at a time, honoring
//! `is_fit` on the target, in either direction, until a quota is reached:
//! an explicit count, `Even` (free space balanced), or `Max` (source
//! drained). It is generic over the two formats because it only uses the
//! trait's record-level primitives.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::storage::SegAddr;

/// A modified byte range within a node frame, reported for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapRange {
    pub off: u32,
    pub len: u32,
}

impl CapRange {
    pub fn new(off: usize, len: usize) -> Self {
        Self {
            off: off as u32,
            len: len as u32,
        }
    }
}

/// Touched-range list returned by mutating node primitives.
pub type Captures = SmallVec<[CapRange; 4]>;

/// Direction of a record move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// From the source's low end into the target's high end.
    Left,
    /// From the source's high end into the target's low end.
    Right,
}

/// How many records [`move_recs`] transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveCount {
    /// Exactly this many (fewer if the target fills first).
    Count(usize),
    /// Until both nodes have approximately the same free space.
    Even,
    /// As many as fit: until the source is empty or the target is full.
    Max,
}

/// Capability set of an on-segment node format.
///
/// All methods take the raw frame bytes; offsets and sizes are the format's
/// own business. Mutating methods return the byte ranges they touched.
pub trait NodeOps: Send + Sync {
    fn id(&self) -> u32;
    fn name(&self) -> &'static str;

    /// Formats a freshly allocated frame as an empty leaf.
    fn init(
        &self,
        frame: &mut [u8],
        shift: u8,
        ksize: u16,
        vsize: u16,
        ntype: u32,
        ttype: u32,
    ) -> Captures;

    /// Invalidates the header of a frame about to be freed.
    fn fini(&self, frame: &mut [u8]) -> Captures;

    /// Number of delimiting keys (excludes the internal-node sentinel).
    fn count(&self, frame: &[u8]) -> usize;

    /// Number of record slots (includes the sentinel).
    fn count_rec(&self, frame: &[u8]) -> usize;

    /// Free bytes remaining for record slots.
    fn space(&self, frame: &[u8]) -> usize;

    fn level(&self, frame: &[u8]) -> u8;
    fn shift(&self, frame: &[u8]) -> u8;
    fn tree_type(&self, frame: &[u8]) -> u32;
    fn keysize(&self, frame: &[u8]) -> usize;

    /// Value size of a slot: the stored value size at leaves, the address
    /// size in internal nodes.
    fn valsize(&self, frame: &[u8]) -> usize;

    /// The tree's leaf value size, independent of this node's level.
    fn leaf_valsize(&self, frame: &[u8]) -> usize;

    /// With `predict` set, whether deleting one more record would empty the
    /// node; otherwise whether the node is empty now.
    fn is_underflow(&self, frame: &[u8], predict: bool) -> bool;

    /// Whether one more record cannot be guaranteed to fit.
    fn is_overflow(&self, frame: &[u8]) -> bool;

    fn key<'a>(&self, frame: &'a [u8], idx: usize) -> &'a [u8];
    fn val<'a>(&self, frame: &'a [u8], idx: usize) -> &'a [u8];

    /// Mutable key and value buffers of one slot.
    fn rec_mut<'a>(&self, frame: &'a mut [u8], idx: usize) -> (&'a mut [u8], &'a mut [u8]);

    /// Child address stored in an internal slot. Not validated; callers
    /// check `SegAddr::is_valid` and segment bounds before following it.
    fn child(&self, frame: &[u8], idx: usize) -> SegAddr;

    /// Whether a record of the given key/value lengths fits.
    fn is_fit(&self, frame: &[u8], klen: usize, vlen: usize) -> bool;

    /// Opens a hole for a new record at `idx`, shifting later slots right.
    /// The caller fills the slot afterwards.
    fn make(&self, frame: &mut [u8], idx: usize) -> Captures;

    /// Removes the record at `idx`, shifting later slots left.
    fn del(&self, frame: &mut [u8], idx: usize) -> Captures;

    fn set_level(&self, frame: &mut [u8], level: u8) -> Captures;

    /// Recomputes the footer after a batch of changes.
    fn fix(&self, frame: &mut [u8]) -> Captures;

    /// Cheap tag check: the frame claims to be a live node of this format.
    fn is_valid(&self, frame: &[u8]) -> bool;

    /// Thorough check: footer checksum matches the header region.
    fn verify(&self, frame: &[u8]) -> bool;

    /// Structural invariant relative to the node's own address.
    fn invariant(&self, frame: &[u8], addr: SegAddr) -> bool;

    /// In-memory descriptor token cached in the frame. Zero means none.
    fn opaque(&self, frame: &[u8]) -> u64;
    fn set_opaque(&self, frame: &mut [u8], token: u64);
}

/// Reads the node-type id from the common framed prefix without knowing the
/// format. Layout: framed header (8 bytes), then the node-type id.
pub fn ntype_of(frame: &[u8]) -> u32 {
    u32::from_le_bytes(frame[8..12].try_into().expect("frame shorter than prefix"))
}

/// Maps node-type ids to format implementations.
pub struct NodeTypeRegistry {
    map: hashbrown::HashMap<u32, &'static dyn NodeOps>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            map: hashbrown::HashMap::new(),
        };
        reg.register(&super::fixed::FIXED_FORMAT);
        reg
    }

    pub fn register(&mut self, ops: &'static dyn NodeOps) {
        let prev = self.map.insert(ops.id(), ops);
        debug_assert!(prev.is_none(), "duplicate node type id {}", ops.id());
    }

    pub fn lookup(&self, id: u32) -> Result<&'static dyn NodeOps> {
        match self.map.get(&id) {
            Some(ops) => Ok(*ops),
            None => bail!("unknown node type id {:#x}", id),
        }
    }
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary search over the delimiting keys. Returns the first index whose key
/// is `>=` the target plus an exact-match flag.
pub fn find(ops: &dyn NodeOps, frame: &[u8], target: &[u8]) -> (usize, bool) {
    let mut i: isize = -1;
    let mut j = ops.count(frame) as isize;
    while i + 1 < j {
        let m = (i + j) / 2;
        match ops.key(frame, m as usize).cmp(target) {
            std::cmp::Ordering::Less => i = m,
            std::cmp::Ordering::Greater => j = m,
            std::cmp::Ordering::Equal => return (m as usize, true),
        }
    }
    (j as usize, false)
}

/// Moves records from `src` into `tgt` one by one until the quota is reached,
/// the target is full, or the source runs dry. Footers of both nodes are
/// updated at the end. Returns the touched ranges of (src, tgt).
pub fn move_recs(
    src_ops: &dyn NodeOps,
    src: &mut [u8],
    tgt_ops: &dyn NodeOps,
    tgt: &mut [u8],
    dir: Dir,
    count: MoveCount,
) -> (Captures, Captures) {
    let mut src_caps = Captures::new();
    let mut tgt_caps = Captures::new();
    let mut left = match count {
        MoveCount::Count(n) => n as isize,
        _ => isize::MAX,
    };
    let mut srcidx: isize = match dir {
        Dir::Left => 0,
        Dir::Right => src_ops.count_rec(src) as isize - 1,
    };
    let mut tgtidx: usize = match dir {
        Dir::Left => tgt_ops.count_rec(tgt),
        Dir::Right => 0,
    };

    loop {
        let done = match count {
            MoveCount::Count(_) => left == 0,
            MoveCount::Even => tgt_ops.space(tgt) <= src_ops.space(src),
            MoveCount::Max => srcidx < 0 || src_ops.count_rec(src) == 0,
        };
        if done || srcidx < 0 || src_ops.count_rec(src) == 0 {
            break;
        }

        let klen = src_ops.key(src, srcidx as usize).len();
        let vlen = src_ops.val(src, srcidx as usize).len();
        if !tgt_ops.is_fit(tgt, klen, vlen) {
            break;
        }

        tgt_caps.extend(tgt_ops.make(tgt, tgtidx));
        {
            let (kdst, vdst) = tgt_ops.rec_mut(tgt, tgtidx);
            kdst.copy_from_slice(src_ops.key(src, srcidx as usize));
            vdst.copy_from_slice(src_ops.val(src, srcidx as usize));
        }
        src_caps.extend(src_ops.del(src, srcidx as usize));

        left = left.saturating_sub(1);
        match dir {
            Dir::Left => tgtidx += 1,
            Dir::Right => srcidx -= 1,
        }
    }

    src_caps.extend(src_ops.fix(src));
    tgt_caps.extend(tgt_ops.fix(tgt));
    (src_caps, tgt_caps)
}
