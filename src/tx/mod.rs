//! # Transaction Adaptor
//!
//! The tree engine does not own durability. Every byte range it modifies in a
//! node frame is reported, with the bytes, to an external [`CaptureSink`],
//! and the sink's write-ahead machinery is free to do whatever it wants with
//! the stream. Replaying a committed capture stream against a blank segment
//! reproduces the exact frame contents the live operations produced.
//!
//! ## Credits
//!
//! Before opening a transaction a caller asks the tree for a [`Credit`]: an
//! upper bound on the regions and bytes one operation may dirty, derived from
//! the tree height and node size. Sinks can use it to reserve log space.
//!
//! ## Transaction References
//!
//! A [`Tx`] pins every node descriptor it captures (`txrefs`). Pinned
//! descriptors survive LRU purges, so a frame's descriptor outlives the
//! transaction that recorded it. The pins release when the transaction is
//! committed or dropped, which is the post-commit callback of the engine.
//!
//! [`MemLog`] is the reference sink: it retains committed captures in memory
//! and can replay them into a fresh segment, which is how the capture
//! protocol is tested. [`NullSink`] discards everything for callers that
//! need no durability.

use std::sync::Arc;

use eyre::Result;

use crate::btree::desc::NodeDesc;
use crate::btree::node::Captures;
use crate::storage::{SegAddr, Segment};

/// Operation classes a caller can request credit for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOp {
    Put,
    Del,
    Create,
    Destroy,
}

/// Accumulated upper bound on dirtied state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    /// Distinct captured regions.
    pub regions: u64,
    /// Total captured bytes.
    pub bytes: u64,
}

impl Credit {
    pub fn add(&mut self, regions: u64, bytes: u64) {
        self.regions += regions;
        self.bytes += bytes;
    }
}

/// Receiver of modified byte ranges.
pub trait CaptureSink: Send {
    /// One modified region of the frame at `addr`. `bytes` holds the new
    /// contents starting at `off` within the frame.
    fn capture(&mut self, addr: SegAddr, off: u32, bytes: &[u8]);

    /// The transaction closed successfully; captures so far are durable.
    fn commit(&mut self) {}
}

/// Discards all captures.
pub struct NullSink;

impl CaptureSink for NullSink {
    fn capture(&mut self, _addr: SegAddr, _off: u32, _bytes: &[u8]) {}
}

/// One open transaction: a capture sink plus the descriptors pinned by it.
pub struct Tx<'a> {
    sink: &'a mut dyn CaptureSink,
    pinned: Vec<Arc<NodeDesc>>,
}

impl<'a> Tx<'a> {
    pub fn new(sink: &'a mut dyn CaptureSink) -> Self {
        Self {
            sink,
            pinned: Vec::new(),
        }
    }

    /// Forwards a node's touched ranges to the sink, pinning its descriptor
    /// on first contact. Bytes are read from the frame at call time, so this
    /// must run after the mutation it reports.
    pub(crate) fn capture_node(
        &mut self,
        seg: &Segment,
        desc: &Arc<NodeDesc>,
        caps: &Captures,
    ) -> Result<()> {
        if caps.is_empty() {
            return Ok(());
        }
        if !self.pinned.iter().any(|d| Arc::ptr_eq(d, desc)) {
            desc.txref_inc();
            self.pinned.push(Arc::clone(desc));
        }
        let frame = desc.frame(seg)?;
        for cap in caps {
            let off = cap.off as usize;
            let len = cap.len as usize;
            self.sink.capture(desc.addr(), cap.off, &frame[off..off + len]);
        }
        Ok(())
    }

    /// Commits the transaction: the sink is notified and every pin released.
    pub fn commit(mut self) {
        self.sink.commit();
        self.release();
    }

    fn release(&mut self) {
        for desc in self.pinned.drain(..) {
            desc.txref_dec();
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // Dropping without commit is an abort: pins release, the sink never
        // sees a commit for these captures.
        self.release();
    }
}

/// One captured region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRec {
    pub addr: SegAddr,
    pub off: u32,
    pub bytes: Vec<u8>,
}

/// In-memory capture log with commit watermark and replay.
#[derive(Default)]
pub struct MemLog {
    records: Vec<CaptureRec>,
    committed: usize,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captures, committed or not.
    pub fn records(&self) -> &[CaptureRec] {
        &self.records
    }

    /// Captures covered by a commit.
    pub fn committed(&self) -> &[CaptureRec] {
        &self.records[..self.committed]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Applies every committed capture, in order, to `seg`. The target is
    /// expected to be a blank segment of the same geometry; afterwards it
    /// holds the same frame contents the captured operations produced.
    pub fn replay_into(&self, seg: &Segment) -> Result<()> {
        for rec in self.committed() {
            seg.reserve_through(rec.addr)?;
            seg.write_frame_region(rec.addr, rec.off, &rec.bytes)?;
        }
        Ok(())
    }
}

impl CaptureSink for MemLog {
    fn capture(&mut self, addr: SegAddr, off: u32, bytes: &[u8]) {
        self.records.push(CaptureRec {
            addr,
            off,
            bytes: bytes.to_vec(),
        });
    }

    fn commit(&mut self) {
        self.committed = self.records.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::desc::{NodeCache, TreeRegistry};
    use crate::btree::fixed::FIXED_FORMAT;
    use crate::btree::node::{CapRange, NodeTypeRegistry};
    use smallvec::smallvec;
    use tempfile::tempdir;

    #[test]
    fn credit_accumulates() {
        let mut credit = Credit::default();
        credit.add(3, 1536);
        credit.add(1, 512);
        assert_eq!(credit, Credit { regions: 4, bytes: 2048 });
    }

    #[test]
    fn tx_pins_each_node_once_and_releases_on_commit() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(dir.path().join("t.seg"), 1 << 20).unwrap();
        let cache = NodeCache::new();
        let ntypes = NodeTypeRegistry::new();
        let trees = TreeRegistry::new();
        let tree = trees.get(&cache, &seg, &ntypes, None).unwrap();
        let (desc, init_caps) = cache
            .alloc(&seg, &ntypes, &tree, 9, &FIXED_FORMAT, 8, 8, 1)
            .unwrap();

        let mut log = MemLog::new();
        {
            let mut tx = Tx::new(&mut log);
            tx.capture_node(&seg, &desc, &init_caps).unwrap();
            let more: Captures = smallvec![CapRange::new(24, 2)];
            tx.capture_node(&seg, &desc, &more).unwrap();

            // Pinned: the descriptor survives a purge while the tx is open.
            cache.put(&seg, &desc);
            assert_eq!(cache.purge(&seg, 10), 0);
            tx.commit();
        }
        assert_eq!(cache.purge(&seg, 10), 1);

        assert_eq!(log.committed().len(), 2);
        assert_eq!(log.committed()[0].addr, desc.addr());
        assert_eq!(log.committed()[0].bytes.len(), 40);
    }

    #[test]
    fn dropping_a_tx_aborts_without_commit() {
        let mut log = MemLog::new();
        {
            let mut tx = Tx::new(&mut log);
            let _ = &mut tx;
        }
        assert!(log.committed().is_empty());

        log.capture(SegAddr::build(512, 9), 0, &[1, 2, 3]);
        assert_eq!(log.len(), 1);
        assert!(log.committed().is_empty());
    }

    #[test]
    fn replay_reproduces_frame_bytes() {
        let dir = tempdir().unwrap();
        let live = Segment::create(dir.path().join("live.seg"), 1 << 16).unwrap();
        let addr = live.alloc_frame(9).unwrap();
        live.frame_mut(addr).unwrap()[0..4].copy_from_slice(&[9, 8, 7, 6]);

        let mut log = MemLog::new();
        log.capture(addr, 0, &live.frame(addr).unwrap()[0..4]);
        log.commit();

        let blank = Segment::create(dir.path().join("blank.seg"), 1 << 16).unwrap();
        log.replay_into(&blank).unwrap();
        assert_eq!(&blank.frame(addr).unwrap()[0..4], &[9, 8, 7, 6]);
    }
}
