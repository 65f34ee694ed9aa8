//! # Node and Tree Descriptors
//!
//! In-memory handles for on-segment state. A [`NodeDesc`] exists for every
//! node frame some operation currently uses (or used recently); a
//! [`TreeDesc`] exists for every open tree.
//!
//! ## Descriptor Cache
//!
//! Descriptors live in a slab inside [`NodeCache`]. Each frame's header has
//! an opaque 8-byte slot caching the descriptor's slab token, so resolving an
//! address to its descriptor is O(1): read the token, index the slab, confirm
//! the addresses match. Stale tokens (left over from a previous process
//! lifetime or a purged descriptor) fail the address comparison and fall
//! through to allocation. Token installation and removal happen under the
//! cache lock, which doubles as the LRU lock.
//!
//! ## Reference Counting and the LRU
//!
//! A descriptor's `refs` counts descent holders. While nonzero the descriptor
//! sits on its owning tree's active list; at zero it moves to the global LRU
//! and its tree back-pointer is cleared (the tree may be closed while the
//! descriptor idles). A later access revives it from the LRU and rebinds the
//! tree. `purge` trims the LRU oldest-first, skipping descriptors pinned by
//! open transactions (`txrefs`). A descriptor is on exactly one of the two
//! lists at any moment.
//!
//! `delayed_free` marks a node whose frame should return to the segment
//! allocator once the last reference drops; accessing such a node is refused.
//!
//! ## Tree Registry
//!
//! Open trees draw descriptors from a fixed pool of `MAX_TREE_COUNT` slots
//! tracked by a bitmap. Opening a root address that is already open bumps the
//! existing descriptor's refcount. Exhausting the pool is a hard error.
//!
//! ## Lock Order
//!
//! registry lock → cache lock → descriptor lock → tree state lock. The
//! per-tree *commit* lock ([`TreeLock`]) is outside this hierarchy: it is
//! taken by the operation engine around structural mutations and is never
//! acquired while holding any of the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use eyre::Result;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::config::MAX_TREE_COUNT;
use crate::storage::{SegAddr, Segment};
use super::node::{ntype_of, Captures, NodeOps, NodeTypeRegistry};
use super::BtreeError;

/// Per-tree commit lock, held across engine phases (taken at LOCK, released
/// at the end of ACT), which rules out a guard object tied to a single scope.
pub(crate) struct TreeLock {
    raw: RawRwLock,
}

impl TreeLock {
    fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
        }
    }

    pub(crate) fn lock_write(&self) {
        self.raw.lock_exclusive();
    }

    pub(crate) fn unlock_write(&self) {
        // SAFETY: callers pair every unlock with a prior lock_write on the
        // same TreeLock; the engine tracks ownership in its phase state.
        unsafe { self.raw.unlock_exclusive() }
    }
}

struct NdState {
    /// Owning tree while on the active list; cleared on the LRU.
    tree: Option<Weak<TreeDesc>>,
    /// Descent holders.
    refs: u32,
    /// Open-transaction holders; nonzero blocks LRU purge.
    txrefs: u32,
    /// Frame returns to the allocator when the last reference drops.
    delayed_free: bool,
}

/// In-memory handle for a live on-segment node.
pub struct NodeDesc {
    token: u32,
    addr: SegAddr,
    ops: &'static dyn NodeOps,
    /// Bumped on every mutation; the foundation of optimistic validation.
    seq: AtomicU64,
    state: RwLock<NdState>,
}

impl NodeDesc {
    pub fn addr(&self) -> SegAddr {
        self.addr
    }

    pub fn ops(&self) -> &'static dyn NodeOps {
        self.ops
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Records a mutation. Call under the owning tree's commit lock.
    pub fn bump_seq(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    pub fn frame<'a>(&self, seg: &'a Segment) -> Result<&'a [u8]> {
        seg.frame(self.addr)
    }

    pub(crate) fn frame_mut<'a>(&self, seg: &'a Segment) -> Result<&'a mut [u8]> {
        seg.frame_mut(self.addr)
    }

    pub(crate) fn txref_inc(&self) {
        self.state.write().txrefs += 1;
    }

    pub(crate) fn txref_dec(&self) {
        let mut st = self.state.write();
        debug_assert!(st.txrefs > 0, "transaction reference underflow");
        st.txrefs -= 1;
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> u32 {
        self.state.read().refs
    }
}

impl std::fmt::Debug for NodeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDesc")
            .field("addr", &self.addr)
            .field("seq", &self.seq())
            .finish()
    }
}

pub(crate) struct TreeState {
    pub refs: u32,
    pub root: Option<Arc<NodeDesc>>,
    /// Descriptors currently referenced by operations on this tree.
    pub active: Vec<Arc<NodeDesc>>,
    /// Set when a close starts waiting for stragglers.
    pub starttime: Option<Instant>,
}

/// In-memory handle for an open tree.
pub struct TreeDesc {
    slot: u32,
    pub(crate) wlock: TreeLock,
    height: AtomicU32,
    pub(crate) state: Mutex<TreeState>,
}

impl TreeDesc {
    fn new(slot: u32) -> Arc<Self> {
        Arc::new(Self {
            slot,
            wlock: TreeLock::new(),
            height: AtomicU32::new(0),
            state: Mutex::new(TreeState {
                refs: 1,
                root: None,
                active: Vec::new(),
                starttime: None,
            }),
        })
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Call under the commit lock.
    pub(crate) fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::Release);
    }

    pub fn root(&self) -> Option<Arc<NodeDesc>> {
        self.state.lock().root.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub(crate) fn slot(&self) -> u32 {
        self.slot
    }
}

impl std::fmt::Debug for TreeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeDesc")
            .field("slot", &self.slot)
            .field("height", &self.height())
            .finish()
    }
}

struct CacheInner {
    slots: Vec<Option<Arc<NodeDesc>>>,
    free: Vec<u32>,
    /// Zero-reference descriptors, oldest at the front.
    lru: VecDeque<u32>,
}

/// Slab of node descriptors plus the global LRU.
pub struct NodeCache {
    lock: RwLock<CacheInner>,
    /// Seed for sequence counters. Monotonic across the whole cache so a
    /// revived or recreated descriptor can never repeat a snapshot an old
    /// operation might still compare against.
    epoch: AtomicU64,
}

impl NodeCache {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(CacheInner {
                slots: Vec::new(),
                free: Vec::new(),
                lru: VecDeque::new(),
            }),
            epoch: AtomicU64::new(1),
        }
    }

    /// Resolves `addr` to a descriptor, creating and caching one on first
    /// access. Bumps the reference count; every `get` is paired with a `put`.
    pub fn get(
        &self,
        seg: &Segment,
        ntypes: &NodeTypeRegistry,
        tree: &Arc<TreeDesc>,
        addr: SegAddr,
    ) -> Result<Arc<NodeDesc>> {
        if !seg.contains(addr) {
            return Err(BtreeError::BadAddress(addr.raw()).into());
        }
        let ops = ntypes
            .lookup(ntype_of(seg.frame(addr)?))
            .map_err(|_| BtreeError::BadFormat)?;

        let mut inner = self.lock.write();

        let token = ops.opaque(seg.frame(addr)?);
        if let Some(desc) = Self::resolve(&inner, token, addr) {
            let mut st = desc.state.write();
            if st.delayed_free {
                return Err(BtreeError::AccessDenied(addr.raw()).into());
            }
            let revived = st.refs == 0;
            st.refs += 1;
            if revived {
                let pos = inner
                    .lru
                    .iter()
                    .position(|t| *t == desc.token)
                    .expect("zero-reference descriptor missing from LRU");
                inner.lru.remove(pos);
                st.tree = Some(Arc::downgrade(tree));
                tree.state.lock().active.push(Arc::clone(&desc));
            }
            drop(st);
            return Ok(desc);
        }

        let token = inner.free.pop().unwrap_or_else(|| {
            inner.slots.push(None);
            inner.slots.len() as u32 - 1
        });
        let desc = Arc::new(NodeDesc {
            token,
            addr,
            ops,
            seq: AtomicU64::new(self.epoch.fetch_add(1, Ordering::Relaxed)),
            state: RwLock::new(NdState {
                tree: Some(Arc::downgrade(tree)),
                refs: 1,
                txrefs: 0,
                delayed_free: false,
            }),
        });
        inner.slots[token as usize] = Some(Arc::clone(&desc));
        // SAFETY of frame_mut: the opaque slot is only ever written under the
        // cache lock, and record writers never touch the header's opaque
        // bytes, so no aliasing write exists.
        ops.set_opaque(seg.frame_mut(addr)?, u64::from(token) + 1);
        tree.state.lock().active.push(Arc::clone(&desc));

        Ok(desc)
    }

    /// Drops one reference. At zero the descriptor leaves its tree's active
    /// list for the LRU, or dies immediately when a delayed free is pending.
    pub fn put(&self, seg: &Segment, desc: &Arc<NodeDesc>) {
        let mut inner = self.lock.write();
        let mut st = desc.state.write();
        debug_assert!(st.refs > 0, "node reference underflow");
        st.refs -= 1;
        if st.refs > 0 {
            return;
        }

        Self::unlink_tree(&mut st, desc);
        if st.delayed_free {
            drop(st);
            Self::drop_desc(&mut inner, seg, desc, true);
        } else {
            inner.lru.push_back(desc.token);
        }
    }

    /// Allocates and formats a fresh frame, returning its descriptor (one
    /// reference held) and the init capture ranges.
    pub fn alloc(
        &self,
        seg: &Segment,
        ntypes: &NodeTypeRegistry,
        tree: &Arc<TreeDesc>,
        shift: u8,
        ops: &'static dyn NodeOps,
        ksize: u16,
        vsize: u16,
        ttype: u32,
    ) -> Result<(Arc<NodeDesc>, Captures)> {
        let addr = seg.alloc_frame(shift)?;
        // The frame is unreachable until linked into the tree, so the
        // allocator discipline covers this write.
        let caps = ops.init(seg.frame_mut(addr)?, shift, ksize, vsize, ops.id(), ttype);
        let desc = self.get(seg, ntypes, tree, addr)?;
        Ok((desc, caps))
    }

    /// Consumes one reference and marks the node for freeing; the frame is
    /// invalidated now and returns to the allocator when the last reference
    /// drops.
    pub fn free(&self, seg: &Segment, desc: &Arc<NodeDesc>) -> Result<()> {
        desc.ops.fini(desc.frame_mut(seg)?);

        let mut inner = self.lock.write();
        let mut st = desc.state.write();
        debug_assert!(st.refs > 0, "freeing an unreferenced node");
        st.refs -= 1;
        st.delayed_free = true;
        if st.refs == 0 {
            Self::unlink_tree(&mut st, desc);
            drop(st);
            Self::drop_desc(&mut inner, seg, desc, true);
        }
        Ok(())
    }

    /// Evicts up to `count` of the oldest zero-reference descriptors, skipping
    /// any pinned by open transactions. Returns how many were evicted.
    pub fn purge(&self, seg: &Segment, count: usize) -> usize {
        let mut inner = self.lock.write();
        let mut evicted = 0;
        let mut pos = 0;
        while evicted < count && pos < inner.lru.len() {
            let token = inner.lru[pos];
            let desc = inner.slots[token as usize]
                .clone()
                .expect("LRU entry without slab slot");
            {
                let st = desc.state.read();
                debug_assert!(st.refs == 0);
                if st.txrefs != 0 {
                    pos += 1;
                    continue;
                }
            }
            inner.lru.remove(pos);
            Self::drop_desc(&mut inner, seg, &desc, false);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, "purged node descriptors from LRU");
        }
        evicted
    }

    pub fn lru_len(&self) -> usize {
        self.lock.read().lru.len()
    }

    fn resolve(inner: &CacheInner, token: u64, addr: SegAddr) -> Option<Arc<NodeDesc>> {
        if token == 0 {
            return None;
        }
        let idx = (token - 1) as usize;
        inner
            .slots
            .get(idx)
            .and_then(|slot| slot.clone())
            .filter(|desc| desc.addr == addr)
    }

    fn unlink_tree(st: &mut NdState, desc: &Arc<NodeDesc>) {
        if let Some(tree) = st.tree.take().and_then(|w| w.upgrade()) {
            let mut ts = tree.state.lock();
            if let Some(pos) = ts.active.iter().position(|n| n.token == desc.token) {
                ts.active.swap_remove(pos);
            }
        }
    }

    /// Removes a descriptor from the slab, clears its frame token, and
    /// optionally returns the frame to the segment allocator.
    fn drop_desc(inner: &mut CacheInner, seg: &Segment, desc: &Arc<NodeDesc>, free_frame: bool) {
        inner.slots[desc.token as usize] = None;
        inner.free.push(desc.token);
        if let Ok(frame) = seg.frame_mut(desc.addr) {
            desc.ops.set_opaque(frame, 0);
        }
        if free_frame {
            if let Err(err) = seg.free_frame(desc.addr) {
                tracing::warn!(?err, addr = ?desc.addr, "failed to free node frame");
            }
        }
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

struct RegistryInner {
    slots: Vec<Option<Arc<TreeDesc>>>,
    in_use: u32,
}

/// Fixed pool of tree descriptors keyed by root address.
pub struct TreeRegistry {
    lock: RwLock<RegistryInner>,
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(RegistryInner {
                slots: vec![None; MAX_TREE_COUNT],
                in_use: 0,
            }),
        }
    }

    /// Returns the tree descriptor for `root`, loading the root node on first
    /// open. With `root == None` a fresh descriptor is claimed without a root
    /// (tree creation assigns one after allocating the root frame).
    pub fn get(
        &self,
        cache: &NodeCache,
        seg: &Segment,
        ntypes: &NodeTypeRegistry,
        root: Option<SegAddr>,
    ) -> Result<Arc<TreeDesc>> {
        let mut inner = self.lock.write();

        if let Some(addr) = root {
            for slot in inner.slots.iter().flatten() {
                let mut st = slot.state.lock();
                if st.root.as_ref().is_some_and(|r| r.addr() == addr) {
                    st.refs += 1;
                    drop(st);
                    return Ok(Arc::clone(slot));
                }
            }
        }

        let free = (!inner.in_use).trailing_zeros() as usize;
        if free >= MAX_TREE_COUNT {
            return Err(BtreeError::PoolExhausted.into());
        }
        inner.in_use |= 1 << free;
        let tree = TreeDesc::new(free as u32);
        inner.slots[free] = Some(Arc::clone(&tree));

        // Held through the root load so a concurrent open of the same root
        // finds this slot instead of claiming a second one.
        if let Some(addr) = root {
            match cache.get(seg, ntypes, &tree, addr) {
                Ok(node) => {
                    let frame = node.frame(seg).expect("root frame bounds checked by get");
                    let level = node.ops().level(frame);
                    tree.set_height(u32::from(level) + 1);
                    tree.state.lock().root = Some(node);
                }
                Err(err) => {
                    inner.slots[free] = None;
                    inner.in_use &= !(1 << free);
                    return Err(err);
                }
            }
        }

        Ok(tree)
    }

    /// Drops one reference; the last one returns the slot to the pool.
    pub fn put(&self, tree: &Arc<TreeDesc>) {
        let mut inner = self.lock.write();
        let mut st = tree.state.lock();
        debug_assert!(st.refs > 0, "tree reference underflow");
        st.refs -= 1;
        if st.refs == 0 {
            debug_assert!(
                st.active.is_empty(),
                "tree released with {} active nodes",
                st.active.len()
            );
            drop(st);
            inner.slots[tree.slot() as usize] = None;
            inner.in_use &= !(1 << tree.slot());
        }
    }

    pub fn loaded(&self) -> usize {
        self.lock.read().in_use.count_ones() as usize
    }
}

impl Default for TreeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
