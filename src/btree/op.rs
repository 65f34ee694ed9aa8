//! # Operation Engine
//!
//! Every public tree operation runs as an explicit state machine: a [`Phase`]
//! value advanced one step at a time over a per-operation context. The phase
//! enum *is* the design: long-running steps (node loads, frame allocation,
//! lock acquisition) sit on phase boundaries, so an implementation backed by
//! a blocking pager could suspend between any two phases without restructuring
//! the engine. With the mmap-backed segment nothing blocks, and each
//! operation ticks to completion on the calling thread.
//!
//! ## Phase Graph
//!
//! ```text
//! INIT → COOKIE → SETUP → LOCKALL → DOWN → NEXTDOWN* →
//!   { ALLOC* (put) | SIBLING* (iter) | STORE_CHILD (del) | LOCK }
//!   → CHECK → { MAKESPACE (put) | ACT } → FREENODE* (del) → CLEANUP → FINI
//! ```
//!
//! ## Optimistic Descent, Pessimistic Commit
//!
//! Descent takes no locks. Each visited node's sequence counter is
//! snapshotted into the per-level stack; at LOCK the tree's commit lock is
//! taken and CHECK replays the snapshots. Any mismatch (a node mutated,
//! freed, or the tree height changed) restarts the operation: from SETUP
//! when the height moved (the level stack must be resized), from LOCKALL
//! otherwise. After [`MAX_TRIALS`] failed validations the operation escalates
//! to whole-tree locking (the LOCKALL flag), which guarantees progress at the
//! cost of concurrency; failing validation *with* the whole-tree lock held is
//! a hard error. Node frames that fail format validation during descent are
//! retried the same way and become fatal after [`MAX_TRIALS`].
//!
//! ## Mutation Discipline
//!
//! All frame writes happen between LOCK and the end of ACT, under the
//! exclusive commit lock. Every mutating primitive's touched ranges are
//! forwarded to the transaction (with the bytes) immediately after the
//! mutation, including the ranges of undo mutations on a callback failure, so
//! a capture replay always lands on the operation's net effect. Sequence
//! counters bump once per mutated node per phase.
//!
//! ## Cookie Fast Path
//!
//! The COOKIE phase is wired but its validator is conservative: it never
//! accepts, so every operation takes the full descent. The contract, a leaf
//! hint from a previous operation short-circuits descent when the leaf still
//! hint short-circuiting descent while the leaf still covers the key, is
//! kept for a future validator.

use std::sync::Arc;

use eyre::{eyre, Result};

use crate::config::{ADDR_VSIZE, MAX_TRIALS};
use crate::storage::SegAddr;
use crate::tx::Tx;
use super::desc::{NodeDesc, TreeDesc};
use super::node::{find, move_recs, Captures, Dir, MoveCount};
use super::{BtreeError, OpFlags, OpStatus, Rec, RecMut, Store};

pub(crate) type RecCb<'a> = &'a mut dyn FnMut(&Rec<'_>) -> Result<()>;
pub(crate) type PutCb<'a> = &'a mut dyn FnMut(&mut RecMut<'_>) -> Result<()>;

/// Engine phases. Names follow the operation protocol; each engine visits
/// the subset that applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Cookie,
    Setup,
    LockAll,
    Down,
    NextDown,
    Alloc,
    StoreChild,
    Sibling,
    Lock,
    Check,
    MakeSpace,
    Act,
    FreeNode,
    Cleanup,
    Fini,
    Done,
}

/// Leaf hint from a previous operation. The validator is conservative and
/// never accepts, so holders always fall back to a full descent.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cookie {
    set: bool,
}

impl Cookie {
    pub fn is_set(&self) -> bool {
        self.set
    }
}

#[derive(Default)]
struct Level {
    node: Option<Arc<NodeDesc>>,
    seq: u64,
    sibling: Option<Arc<NodeDesc>>,
    sib_seq: u64,
    idx: i32,
    alloc: Option<Arc<NodeDesc>>,
    freenode: bool,
}

/// Outcome of one NEXTDOWN tick.
enum NextStep {
    Descend,
    Leaf,
    Restart,
}

struct OpContext<'s> {
    store: &'s Store,
    tree: Arc<TreeDesc>,
    flags: OpFlags,
    cookie: Cookie,
    /// Height snapshot taken at SETUP; part of the validation epoch.
    height: u32,
    levels: Vec<Level>,
    used: usize,
    /// Deepest internal level with a usable neighbor in the iteration
    /// direction; -1 when none.
    pivot: i32,
    key_found: bool,
    /// Second spare for a root split.
    extra: Option<Arc<NodeDesc>>,
    /// Node loaded by DOWN/NEXTDOWN/SIBLING, not yet bound to a level.
    cursor: Option<Arc<NodeDesc>>,
    trial: u32,
    vtrial: u32,
    lock_held: bool,
    status: OpStatus,
}

impl<'s> OpContext<'s> {
    fn new(store: &'s Store, tree: Arc<TreeDesc>, flags: OpFlags) -> Self {
        Self {
            store,
            tree,
            flags,
            cookie: Cookie::default(),
            height: 0,
            levels: Vec::new(),
            used: 0,
            pivot: -1,
            key_found: false,
            extra: None,
            cursor: None,
            trial: 0,
            vtrial: 0,
            lock_held: false,
            status: OpStatus::Success,
        }
    }

    fn init_phase(&self) -> Phase {
        if self.flags.contains(OpFlags::COOKIE) && self.cookie.is_set() {
            Phase::Cookie
        } else {
            Phase::Setup
        }
    }

    fn cookie_valid(&self, _key: &[u8]) -> bool {
        false
    }

    fn setup(&mut self) {
        self.height = self.tree.height();
        let depth = self.height.max(1) as usize;
        self.levels.clear();
        self.levels.resize_with(depth, Level::default);
        self.used = 0;
        self.pivot = -1;
        self.key_found = false;
    }

    fn lockall(&mut self) {
        if self.flags.contains(OpFlags::LOCKALL) {
            self.lock();
        }
    }

    fn lock(&mut self) {
        if !self.lock_held {
            self.tree.wlock.lock_write();
            self.lock_held = true;
        }
    }

    fn unlock(&mut self) {
        if self.lock_held {
            self.tree.wlock.unlock_write();
            self.lock_held = false;
        }
    }

    fn node_get(&self, addr: SegAddr) -> Result<Arc<NodeDesc>> {
        self.store
            .cache
            .get(&self.store.seg, &self.store.ntypes, &self.tree, addr)
    }

    /// DOWN: reset the cursor to the root.
    fn down(&mut self) -> Result<()> {
        self.used = 0;
        self.pivot = -1;
        let root = self
            .tree
            .root()
            .ok_or_else(|| eyre!("operation on a tree without a root"))?;
        self.cursor = Some(self.node_get(root.addr())?);
        Ok(())
    }

    /// NEXTDOWN: bind the cursor node to the current level, search it, and
    /// either step into a child or stop at the leaf.
    fn next_down(&mut self, key: &[u8], track_pivot: bool) -> Result<NextStep> {
        let node = self.cursor.take().expect("NEXTDOWN without a loaded node");
        self.levels[self.used].seq = node.seq();
        self.levels[self.used].node = Some(Arc::clone(&node));
        let ops = node.ops();

        enum Step {
            Bad,
            Leaf(i32, bool),
            Child(SegAddr, i32, bool, bool),
        }

        let step = {
            let frame = node.frame(&self.store.seg)?;
            if !ops.is_valid(frame) || !ops.verify(frame) {
                Step::Bad
            } else {
                let (idx, found) = find(ops, frame, key);
                if ops.level(frame) > 0 {
                    // An exact match on a delimiting key sends the descent
                    // into the right child.
                    let cidx = if found { idx + 1 } else { idx };
                    let pivot_here = (self.flags.contains(OpFlags::NEXT)
                        && cidx < ops.count(frame))
                        || (self.flags.contains(OpFlags::PREV) && cidx > 0);
                    Step::Child(ops.child(frame, cidx), cidx as i32, found, pivot_here)
                } else {
                    Step::Leaf(idx as i32, found)
                }
            }
        };

        match step {
            Step::Bad => Ok(NextStep::Restart),
            Step::Leaf(idx, found) => {
                self.levels[self.used].idx = idx;
                self.key_found = found;
                Ok(NextStep::Leaf)
            }
            Step::Child(child, cidx, found, pivot_here) => {
                self.levels[self.used].idx = cidx;
                self.key_found = found;
                if !child.is_valid() || !self.store.seg.contains(child) {
                    // Read without the lock this may be a torn pointer;
                    // read under it the frame really is damaged.
                    if self.lock_held {
                        return Err(BtreeError::BadAddress(child.raw()).into());
                    }
                    return Ok(NextStep::Restart);
                }
                if track_pivot && pivot_here {
                    self.pivot = self.used as i32;
                }
                if self.used + 1 >= self.levels.len() {
                    // The tree grew past the height snapshot.
                    return Ok(NextStep::Restart);
                }
                self.used += 1;
                match self.node_get(child) {
                    Ok(n) => {
                        self.cursor = Some(n);
                        Ok(NextStep::Descend)
                    }
                    Err(e) => match e.downcast_ref::<BtreeError>() {
                        Some(BtreeError::AccessDenied(_)) | Some(BtreeError::BadFormat) => {
                            Ok(NextStep::Restart)
                        }
                        _ => Err(e),
                    },
                }
            }
        }
    }

    /// Restart after a descent-validity failure. A torn optimistic read is
    /// indistinguishable from corruption, so after the retry budget the
    /// operation re-runs under the whole-tree lock, where a failure is
    /// authoritative and fatal.
    fn descent_restart(&mut self) -> Result<()> {
        self.vtrial += 1;
        self.release_all();
        if self.vtrial >= MAX_TRIALS {
            if self.flags.contains(OpFlags::LOCKALL) {
                return Err(BtreeError::BadFormat.into());
            }
            self.flags |= OpFlags::LOCKALL;
        }
        tracing::debug!(vtrial = self.vtrial, "descent validation failed, restarting");
        Ok(())
    }

    /// CHECK: the descent path is still live and unchanged.
    fn path_check(&self) -> Result<bool> {
        for lev in self.levels.iter().take(self.used + 1) {
            let node = lev.node.as_ref().expect("level bound during descent");
            let frame = node.frame(&self.store.seg)?;
            if !node.ops().is_valid(frame) || node.seq() != lev.seq {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// CHECK companion for siblings loaded during descent (iteration) and
    /// the root child loaded for a possible demotion (deletion).
    fn sibling_check(&self) -> Result<bool> {
        for lev in &self.levels {
            if let Some(sib) = &lev.sibling {
                let frame = sib.frame(&self.store.seg)?;
                if !sib.ops().is_valid(frame) || sib.seq() != lev.sib_seq {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Failed CHECK: drop the lock, count the trial, escalate or fail, and
    /// pick the restart entry phase.
    fn check_restart(&mut self) -> Result<Phase> {
        self.unlock();
        self.trial += 1;
        if self.trial >= MAX_TRIALS {
            if self.flags.contains(OpFlags::LOCKALL) {
                return Err(BtreeError::RetryExhausted.into());
            }
            tracing::debug!(trial = self.trial, "escalating to whole-tree lock");
            self.flags |= OpFlags::LOCKALL;
        }
        let height_changed = self.tree.height() != self.height;
        self.release_all();
        Ok(if height_changed {
            Phase::Setup
        } else {
            Phase::LockAll
        })
    }

    /// CLEANUP: release every node held across the level stack, spare and
    /// extra nodes included. Idempotent.
    fn release_all(&mut self) {
        let seg = &self.store.seg;
        let cache = &self.store.cache;
        for lev in &mut self.levels {
            if let Some(n) = lev.node.take() {
                cache.put(seg, &n);
            }
            if let Some(n) = lev.sibling.take() {
                cache.put(seg, &n);
            }
            if let Some(n) = lev.alloc.take() {
                if let Err(err) = cache.free(seg, &n) {
                    tracing::warn!(?err, "failed to free unused spare node");
                }
            }
            lev.seq = 0;
            lev.sib_seq = 0;
            lev.idx = 0;
            lev.freenode = false;
        }
        if let Some(n) = self.extra.take() {
            if let Err(err) = cache.free(seg, &n) {
                tracing::warn!(?err, "failed to free unused extra node");
            }
        }
        if let Some(n) = self.cursor.take() {
            cache.put(seg, &n);
        }
        self.used = 0;
    }

    fn capture(&self, tx: &mut Tx<'_>, node: &Arc<NodeDesc>, caps: &Captures) -> Result<()> {
        tx.capture_node(&self.store.seg, node, caps)
    }

    /// ALLOC: walking up from the leaf, allocate one spare per level whose
    /// node would overflow, plus the extra root-split node. Returns false
    /// when a node failed validation and the operation must restart.
    fn alloc_spares(&mut self, tx: &mut Tx<'_>) -> Result<bool> {
        let seg = &self.store.seg;
        let mut i = self.used;
        loop {
            let node = self.levels[i].node.clone().expect("level bound");
            let ops = node.ops();
            let params = {
                let frame = node.frame(seg)?;
                if !ops.is_valid(frame) {
                    None
                } else {
                    Some((
                        ops.shift(frame),
                        ops.keysize(frame) as u16,
                        ops.valsize(frame) as u16,
                        ops.tree_type(frame),
                        ops.is_overflow(frame),
                    ))
                }
            };
            let Some((shift, ksize, vsize, ttype, overflow)) = params else {
                return Ok(false);
            };
            if !overflow {
                break;
            }
            if i == 0 {
                if self.extra.is_none() {
                    let (d, caps) = self.store.cache.alloc(
                        seg,
                        &self.store.ntypes,
                        &self.tree,
                        shift,
                        ops,
                        ksize,
                        vsize,
                        ttype,
                    )?;
                    self.capture(tx, &d, &caps)?;
                    self.extra = Some(d);
                }
                if self.levels[0].alloc.is_none() {
                    let (d, caps) = self.store.cache.alloc(
                        seg,
                        &self.store.ntypes,
                        &self.tree,
                        shift,
                        ops,
                        ksize,
                        vsize,
                        ttype,
                    )?;
                    self.capture(tx, &d, &caps)?;
                    self.levels[0].alloc = Some(d);
                }
                break;
            }
            if self.levels[i].alloc.is_none() {
                let (d, caps) = self.store.cache.alloc(
                    seg,
                    &self.store.ntypes,
                    &self.tree,
                    shift,
                    ops,
                    ksize,
                    vsize,
                    ttype,
                )?;
                self.capture(tx, &d, &caps)?;
                self.levels[i].alloc = Some(d);
            }
            i -= 1;
        }
        Ok(true)
    }

    /// Splits `node` by moving its lower half into `spare`, then picks the
    /// node and index where a record with `key` belongs. Runs under the
    /// commit lock.
    fn split_and_find(
        &self,
        spare: &Arc<NodeDesc>,
        node: &Arc<NodeDesc>,
        key: &[u8],
        tx: &mut Tx<'_>,
    ) -> Result<(bool, usize)> {
        let seg = &self.store.seg;
        let (spare_caps, node_caps, into_spare, idx);
        {
            let (sframe, nframe) = seg.frame_pair_mut(spare.addr(), node.addr())?;
            let mut scaps = spare.ops().set_level(sframe, node.ops().level(nframe));
            let (ncaps, moved) = move_recs(
                node.ops(),
                nframe,
                spare.ops(),
                sframe,
                Dir::Left,
                MoveCount::Even,
            );
            scaps.extend(moved);

            into_spare = key < node.ops().key(nframe, 0);
            idx = if into_spare {
                let sops = spare.ops();
                // A record that sorts above every delimiting key of an
                // internal left node lands after its sentinel slot.
                if sops.level(sframe) > 0 && key > sops.key(sframe, sops.count(sframe)) {
                    sops.count(sframe) + 1
                } else {
                    find(sops, sframe, key).0
                }
            } else {
                find(node.ops(), nframe, key).0
            };
            (spare_caps, node_caps) = (scaps, ncaps);
        }
        spare.bump_seq();
        node.bump_seq();
        self.capture(tx, spare, &spare_caps)?;
        self.capture(tx, node, &node_caps)?;
        Ok((into_spare, idx))
    }

    /// MAKESPACE with a split chain: split the leaf, place the new record,
    /// and push promoted keys upward, splitting each full ancestor, up to and
    /// including a root split.
    fn put_makespace(&mut self, key: &[u8], tx: &mut Tx<'_>, cb: PutCb<'_>) -> Result<()> {
        let seg = &self.store.seg;
        let leaf_level = self.used;
        let leaf = self.levels[leaf_level].node.clone().expect("leaf bound");
        let spare = self.levels[leaf_level]
            .alloc
            .clone()
            .expect("spare allocated for overflowing leaf");

        let (into_spare, tgt_idx) = self.split_and_find(&spare, &leaf, key, tx)?;
        let tgt = if into_spare { &spare } else { &leaf };

        let mut caps;
        let fill_err;
        {
            let frame = tgt.frame_mut(seg)?;
            let ops = tgt.ops();
            caps = ops.make(frame, tgt_idx);
            let (kbuf, vbuf) = ops.rec_mut(frame, tgt_idx);
            let mut rec = RecMut {
                status: OpStatus::Success,
                key: kbuf,
                val: vbuf,
            };
            fill_err = cb(&mut rec).err();
            if fill_err.is_none() {
                caps.extend(ops.fix(frame));
            }
        }
        if let Some(e) = fill_err {
            // Undo the slot, then the split itself.
            let mut undo;
            {
                let frame = tgt.frame_mut(seg)?;
                undo = tgt.ops().del(frame, tgt_idx);
                undo.extend(tgt.ops().fix(frame));
            }
            tgt.bump_seq();
            self.capture(tx, tgt, &undo)?;
            let (scaps, lcaps);
            {
                let (sframe, lframe) = seg.frame_pair_mut(spare.addr(), leaf.addr())?;
                (scaps, lcaps) = move_recs(
                    spare.ops(),
                    sframe,
                    leaf.ops(),
                    lframe,
                    Dir::Right,
                    MoveCount::Max,
                );
            }
            spare.bump_seq();
            leaf.bump_seq();
            self.capture(tx, &spare, &scaps)?;
            self.capture(tx, &leaf, &lcaps)?;
            self.unlock();
            return Err(e);
        }
        tgt.bump_seq();
        self.capture(tx, tgt, &caps)?;

        // The split-off spare holds the keys below the right node's first
        // key; that first key is promoted with the spare as its child.
        let mut promo_key = {
            let frame = leaf.frame(seg)?;
            leaf.ops().key(frame, 0).to_vec()
        };
        let mut promo_child = spare.addr();

        let mut i = leaf_level;
        while i > 0 {
            // The child level's spare is reachable from the tree now (or
            // never will be); drop this operation's reference.
            if let Some(consumed) = self.levels[i].alloc.take() {
                self.store.cache.put(seg, &consumed);
            }
            i -= 1;
            let parent = self.levels[i].node.clone().expect("level bound");
            let pidx = self.levels[i].idx as usize;
            let fits = {
                let frame = parent.frame(seg)?;
                parent
                    .ops()
                    .is_fit(frame, promo_key.len(), ADDR_VSIZE)
            };
            if fits {
                let mut pcaps;
                {
                    let frame = parent.frame_mut(seg)?;
                    let ops = parent.ops();
                    pcaps = ops.make(frame, pidx);
                    let (kbuf, vbuf) = ops.rec_mut(frame, pidx);
                    kbuf.copy_from_slice(&promo_key);
                    vbuf.copy_from_slice(&promo_child.raw().to_le_bytes());
                    pcaps.extend(ops.fix(frame));
                }
                parent.bump_seq();
                self.capture(tx, &parent, &pcaps)?;
                self.unlock();
                return Ok(());
            }

            let pspare = self.levels[i]
                .alloc
                .clone()
                .expect("spare allocated for overflowing ancestor");
            let (into_spare, tgt_idx) = self.split_and_find(&pspare, &parent, &promo_key, tx)?;
            let tgt = if into_spare { &pspare } else { &parent };
            let mut tcaps;
            {
                let frame = tgt.frame_mut(seg)?;
                let ops = tgt.ops();
                tcaps = ops.make(frame, tgt_idx);
                let (kbuf, vbuf) = ops.rec_mut(frame, tgt_idx);
                kbuf.copy_from_slice(&promo_key);
                vbuf.copy_from_slice(&promo_child.raw().to_le_bytes());
                tcaps.extend(ops.fix(frame));
            }
            tgt.bump_seq();
            self.capture(tx, tgt, &tcaps)?;

            // The key stranded in the spare's sentinel slot moves up.
            promo_key = {
                let frame = pspare.frame(seg)?;
                let ops = pspare.ops();
                ops.key(frame, ops.count(frame)).to_vec()
            };
            promo_child = pspare.addr();
        }

        self.put_root_split(&promo_key, promo_child, tx)
    }

    /// Root split: the old root's remaining records move into the extra
    /// node, and the root is rebuilt as an internal node with exactly two
    /// children: the promoted record and a sentinel pointing at the extra
    /// node. The root address never changes; the height grows by one.
    fn put_root_split(
        &mut self,
        promo_key: &[u8],
        promo_child: SegAddr,
        tx: &mut Tx<'_>,
    ) -> Result<()> {
        let seg = &self.store.seg;
        let root = self.levels[0].node.clone().expect("root bound");
        let extra = self.extra.take().expect("extra node allocated for root split");
        let rops = root.ops();
        let eops = extra.ops();

        let (rcaps, ecaps);
        {
            let (eframe, rframe) = seg.frame_pair_mut(extra.addr(), root.addr())?;
            let root_level = rops.level(rframe);
            let mut ec = eops.set_level(eframe, root_level);
            // Move while the root still has its old level so both frames
            // agree on the slot stride, then raise the root.
            let (rc_move, ec_move) =
                move_recs(rops, rframe, eops, eframe, Dir::Right, MoveCount::Max);
            ec.extend(ec_move);
            let mut rc = rc_move;
            rc.extend(rops.set_level(rframe, root_level + 1));

            rc.extend(rops.make(rframe, 0));
            let (kbuf, vbuf) = rops.rec_mut(rframe, 0);
            kbuf.copy_from_slice(promo_key);
            vbuf.copy_from_slice(&promo_child.raw().to_le_bytes());

            rc.extend(rops.make(rframe, 1));
            let (kbuf, vbuf) = rops.rec_mut(rframe, 1);
            kbuf.fill(0);
            vbuf.copy_from_slice(&extra.addr().raw().to_le_bytes());

            rc.extend(rops.fix(rframe));
            (rcaps, ecaps) = (rc, ec);
        }
        root.bump_seq();
        extra.bump_seq();
        self.capture(tx, &root, &rcaps)?;
        self.capture(tx, &extra, &ecaps)?;
        self.tree.set_height(self.tree.height() + 1);

        if let Some(consumed) = self.levels[0].alloc.take() {
            self.store.cache.put(seg, &consumed);
        }
        self.store.cache.put(seg, &extra);
        self.unlock();
        Ok(())
    }

    /// Underflow resolution: walk upward deleting the emptied child's entry
    /// from each parent, collapsing the tree and possibly demoting the root.
    /// Enters with the commit lock held, leaves with it released; emptied
    /// frames are marked for FREENODE.
    fn del_resolve_underflow(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        let seg = &self.store.seg;
        let mut used = self.used;
        self.levels[used].freenode = true;
        loop {
            used -= 1;
            let node = self.levels[used].node.clone().expect("level bound");
            let ops = node.ops();
            let idx = self.levels[used].idx as usize;

            let mut caps;
            let count_after = {
                let frame = node.frame_mut(seg)?;
                caps = ops.del(frame, idx);
                ops.count_rec(frame)
            };

            if used == 0 && count_after == 1 {
                // One child left under the root: demotion takes over.
                self.capture(tx, &node, &caps)?;
                return self.del_root_demote(tx);
            }

            let mut done = false;
            if used == 0 {
                if count_after > 1 {
                    done = true;
                } else {
                    // The root emptied: the tree collapses to a single
                    // empty leaf.
                    let frame = node.frame_mut(seg)?;
                    caps.extend(ops.set_level(frame, 0));
                    self.tree.set_height(1);
                    done = true;
                }
            }
            {
                let frame = node.frame_mut(seg)?;
                caps.extend(ops.fix(frame));
            }
            node.bump_seq();
            self.capture(tx, &node, &caps)?;

            let underflow = {
                let frame = node.frame(seg)?;
                ops.is_underflow(frame, false)
            };
            if done || !underflow {
                self.unlock();
                return Ok(());
            }
            self.levels[used].freenode = true;
        }
    }

    /// Root demotion: the root's only remaining child is copied into the
    /// root frame itself and its frame is freed; the height shrinks by one.
    fn del_root_demote(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        let seg = &self.store.seg;
        let root = self.levels[0].node.clone().expect("root bound");
        let child = self.levels[1]
            .sibling
            .take()
            .expect("root child loaded at STORE_CHILD");
        let rops = root.ops();
        let cops = child.ops();

        let (rcaps, ccaps);
        {
            let (rframe, cframe) = seg.frame_pair_mut(root.addr(), child.addr())?;
            let root_level = rops.level(rframe);
            let mut rc = rops.del(rframe, 0);
            rc.extend(rops.set_level(rframe, root_level - 1));
            let (cc, rc_move) =
                move_recs(cops, cframe, rops, rframe, Dir::Right, MoveCount::Max);
            rc.extend(rc_move);
            (rcaps, ccaps) = (rc, cc);
        }
        root.bump_seq();
        child.bump_seq();
        self.capture(tx, &root, &rcaps)?;
        self.capture(tx, &child, &ccaps)?;
        self.tree.set_height(self.tree.height() - 1);
        self.unlock();

        self.store.cache.free(seg, &child)?;
        Ok(())
    }

    /// FREENODE: return every frame emptied by the collapse to the segment.
    fn del_freenode(&mut self) -> Result<()> {
        let seg = &self.store.seg;
        let mut i = self.used;
        while i > 0 && self.levels[i].freenode {
            let node = self.levels[i].node.take().expect("marked level bound");
            self.store.cache.free(seg, &node)?;
            self.levels[i].freenode = false;
            i -= 1;
        }
        Ok(())
    }

    /// GET with slant: the key's successor lies in the next subtree over.
    /// Walks up to the deepest ancestor with a right neighbor and descends
    /// that neighbor's leftmost spine. Runs under the commit lock; loaded
    /// nodes are parked as siblings for CLEANUP.
    fn slant_descend(&mut self) -> Result<Option<(Arc<NodeDesc>, usize)>> {
        let seg = &self.store.seg;
        for i in (0..self.used).rev() {
            let node = self.levels[i].node.clone().expect("level bound");
            let count = {
                let frame = node.frame(seg)?;
                node.ops().count(frame)
            };
            let idx = self.levels[i].idx as usize;
            if idx >= count {
                continue;
            }
            let mut cur = node;
            let mut cidx = idx + 1;
            for j in (i + 1)..=self.used {
                let child = {
                    let frame = cur.frame(seg)?;
                    cur.ops().child(frame, cidx)
                };
                if !child.is_valid() || !seg.contains(child) {
                    return Err(BtreeError::BadAddress(child.raw()).into());
                }
                let n = self.node_get(child)?;
                self.levels[j].sibling = Some(Arc::clone(&n));
                self.levels[j].sib_seq = n.seq();
                cur = n;
                cidx = 0;
            }
            return Ok(Some((cur, 0)));
        }
        Ok(None)
    }

    fn leaf_index_valid(&self) -> Result<bool> {
        let lev = &self.levels[self.used];
        let node = lev.node.as_ref().expect("leaf bound");
        let count = {
            let frame = node.frame(&self.store.seg)?;
            node.ops().count(frame)
        };
        Ok(lev.idx >= 0 && (lev.idx as usize) < count)
    }
}

/// Sibling index relative to `idx` in the iteration direction; for NEXT an
/// exact match steps over the matching record itself.
fn sibling_index(idx: i32, flags: OpFlags, key_exists: bool) -> i32 {
    if flags.contains(OpFlags::NEXT) {
        if key_exists {
            idx + 1
        } else {
            idx
        }
    } else {
        idx - 1
    }
}

fn invoke_empty(cb: RecCb<'_>, status: OpStatus) -> Result<()> {
    let rec = Rec {
        status,
        key: &[],
        val: &[],
    };
    cb(&rec)
}

/// PUT engine.
pub(crate) fn put_tick(
    store: &Store,
    tree: &Arc<TreeDesc>,
    key: &[u8],
    flags: OpFlags,
    tx: &mut Tx<'_>,
    cb: PutCb<'_>,
) -> Result<OpStatus> {
    let mut ctx = OpContext::new(store, Arc::clone(tree), flags);
    let res = put_phases(&mut ctx, key, tx, cb);
    ctx.unlock();
    ctx.release_all();
    res
}

fn put_phases(
    ctx: &mut OpContext<'_>,
    key: &[u8],
    tx: &mut Tx<'_>,
    cb: PutCb<'_>,
) -> Result<OpStatus> {
    let seg = &ctx.store.seg;
    let mut phase = Phase::Init;
    loop {
        phase = match phase {
            Phase::Init => ctx.init_phase(),
            Phase::Cookie => {
                if ctx.cookie_valid(key) {
                    Phase::Lock
                } else {
                    Phase::Setup
                }
            }
            Phase::Setup => {
                ctx.setup();
                Phase::LockAll
            }
            Phase::LockAll => {
                ctx.lockall();
                Phase::Down
            }
            Phase::Down => {
                ctx.down()?;
                Phase::NextDown
            }
            Phase::NextDown => match ctx.next_down(key, false)? {
                NextStep::Descend => Phase::NextDown,
                NextStep::Restart => {
                    ctx.descent_restart()?;
                    Phase::Setup
                }
                NextStep::Leaf => {
                    if ctx.key_found {
                        Phase::Lock
                    } else {
                        Phase::Alloc
                    }
                }
            },
            Phase::Alloc => {
                if ctx.alloc_spares(tx)? {
                    Phase::Lock
                } else {
                    ctx.descent_restart()?;
                    Phase::Setup
                }
            }
            Phase::Lock => {
                ctx.lock();
                Phase::Check
            }
            Phase::Check => {
                if ctx.path_check()? {
                    Phase::MakeSpace
                } else {
                    ctx.check_restart()?
                }
            }
            Phase::MakeSpace => {
                if ctx.key_found {
                    let mut empty_k = [0u8; 0];
                    let mut empty_v = [0u8; 0];
                    let mut rec = RecMut {
                        status: OpStatus::KeyExists,
                        key: &mut empty_k,
                        val: &mut empty_v,
                    };
                    let res = cb(&mut rec);
                    ctx.unlock();
                    res?;
                    ctx.status = OpStatus::KeyExists;
                    Phase::Cleanup
                } else {
                    let leaf = ctx.levels[ctx.used].node.clone().expect("leaf bound");
                    let idx = ctx.levels[ctx.used].idx as usize;
                    let fits = {
                        let frame = leaf.frame(seg)?;
                        let ops = leaf.ops();
                        ops.is_fit(frame, ops.keysize(frame), ops.valsize(frame))
                    };
                    if fits {
                        // ACT: open the slot and let the callback fill it.
                        let mut caps;
                        let fill_err;
                        {
                            let frame = leaf.frame_mut(seg)?;
                            let ops = leaf.ops();
                            caps = ops.make(frame, idx);
                            let (kbuf, vbuf) = ops.rec_mut(frame, idx);
                            let mut rec = RecMut {
                                status: OpStatus::Success,
                                key: kbuf,
                                val: vbuf,
                            };
                            fill_err = cb(&mut rec).err();
                            if fill_err.is_none() {
                                caps.extend(ops.fix(frame));
                            }
                        }
                        if let Some(e) = fill_err {
                            let mut undo;
                            {
                                let frame = leaf.frame_mut(seg)?;
                                undo = leaf.ops().del(frame, idx);
                                undo.extend(leaf.ops().fix(frame));
                            }
                            leaf.bump_seq();
                            ctx.capture(tx, &leaf, &undo)?;
                            ctx.unlock();
                            return Err(e);
                        }
                        leaf.bump_seq();
                        ctx.capture(tx, &leaf, &caps)?;
                        ctx.unlock();
                        ctx.status = OpStatus::Success;
                        Phase::Cleanup
                    } else {
                        ctx.put_makespace(key, tx, cb)?;
                        ctx.status = OpStatus::Success;
                        Phase::Cleanup
                    }
                }
            }
            Phase::Cleanup => {
                ctx.release_all();
                Phase::Fini
            }
            Phase::Fini => Phase::Done,
            Phase::Done => return Ok(ctx.status),
            _ => unreachable!("phase {:?} not reachable in put", phase),
        }
    }
}

/// GET engine.
pub(crate) fn get_tick(
    store: &Store,
    tree: &Arc<TreeDesc>,
    key: &[u8],
    flags: OpFlags,
    cb: RecCb<'_>,
) -> Result<OpStatus> {
    let mut ctx = OpContext::new(store, Arc::clone(tree), flags);
    let res = get_phases(&mut ctx, key, cb);
    ctx.unlock();
    ctx.release_all();
    res
}

fn get_phases(ctx: &mut OpContext<'_>, key: &[u8], cb: RecCb<'_>) -> Result<OpStatus> {
    let seg = &ctx.store.seg;
    let mut phase = Phase::Init;
    loop {
        phase = match phase {
            Phase::Init => ctx.init_phase(),
            Phase::Cookie => {
                if ctx.cookie_valid(key) {
                    Phase::Lock
                } else {
                    Phase::Setup
                }
            }
            Phase::Setup => {
                ctx.setup();
                Phase::LockAll
            }
            Phase::LockAll => {
                ctx.lockall();
                Phase::Down
            }
            Phase::Down => {
                ctx.down()?;
                Phase::NextDown
            }
            Phase::NextDown => match ctx.next_down(key, false)? {
                NextStep::Descend => Phase::NextDown,
                NextStep::Restart => {
                    ctx.descent_restart()?;
                    Phase::Setup
                }
                NextStep::Leaf => Phase::Lock,
            },
            Phase::Lock => {
                ctx.lock();
                Phase::Check
            }
            Phase::Check => {
                if ctx.path_check()? {
                    Phase::Act
                } else {
                    ctx.check_restart()?
                }
            }
            Phase::Act => {
                let leaf = ctx.levels[ctx.used].node.clone().expect("leaf bound");
                let idx = ctx.levels[ctx.used].idx as usize;
                let res;
                if !ctx.flags.contains(OpFlags::SLANT) {
                    if ctx.key_found {
                        let frame = leaf.frame(seg)?;
                        let rec = Rec {
                            status: OpStatus::Success,
                            key: leaf.ops().key(frame, idx),
                            val: leaf.ops().val(frame, idx),
                        };
                        ctx.status = OpStatus::Success;
                        res = cb(&rec);
                    } else {
                        ctx.status = OpStatus::KeyNotFound;
                        res = invoke_empty(cb, OpStatus::KeyNotFound);
                    }
                } else if ctx.leaf_index_valid()? {
                    let frame = leaf.frame(seg)?;
                    let rec = Rec {
                        status: OpStatus::Success,
                        key: leaf.ops().key(frame, idx),
                        val: leaf.ops().val(frame, idx),
                    };
                    ctx.status = OpStatus::Success;
                    res = cb(&rec);
                } else {
                    match ctx.slant_descend()? {
                        Some((node, sidx)) => {
                            let frame = node.frame(seg)?;
                            let rec = Rec {
                                status: OpStatus::Success,
                                key: node.ops().key(frame, sidx),
                                val: node.ops().val(frame, sidx),
                            };
                            ctx.status = OpStatus::Success;
                            res = cb(&rec);
                        }
                        None => {
                            ctx.status = OpStatus::BtreeBoundary;
                            res = invoke_empty(cb, OpStatus::BtreeBoundary);
                        }
                    }
                }
                ctx.unlock();
                res?;
                Phase::Cleanup
            }
            Phase::Cleanup => {
                ctx.release_all();
                Phase::Fini
            }
            Phase::Fini => Phase::Done,
            Phase::Done => return Ok(ctx.status),
            _ => unreachable!("phase {:?} not reachable in get", phase),
        }
    }
}

/// DEL engine.
pub(crate) fn del_tick(
    store: &Store,
    tree: &Arc<TreeDesc>,
    key: &[u8],
    flags: OpFlags,
    tx: &mut Tx<'_>,
    cb: RecCb<'_>,
) -> Result<OpStatus> {
    let mut ctx = OpContext::new(store, Arc::clone(tree), flags);
    let res = del_phases(&mut ctx, key, tx, cb);
    ctx.unlock();
    ctx.release_all();
    res
}

fn del_phases(
    ctx: &mut OpContext<'_>,
    key: &[u8],
    tx: &mut Tx<'_>,
    cb: RecCb<'_>,
) -> Result<OpStatus> {
    let seg = &ctx.store.seg;
    let mut phase = Phase::Init;
    loop {
        phase = match phase {
            Phase::Init => ctx.init_phase(),
            Phase::Cookie => {
                if ctx.cookie_valid(key) {
                    Phase::Lock
                } else {
                    Phase::Setup
                }
            }
            Phase::Setup => {
                ctx.setup();
                Phase::LockAll
            }
            Phase::LockAll => {
                ctx.lockall();
                Phase::Down
            }
            Phase::Down => {
                ctx.down()?;
                Phase::NextDown
            }
            Phase::NextDown => match ctx.next_down(key, false)? {
                NextStep::Descend => Phase::NextDown,
                NextStep::Restart => {
                    ctx.descent_restart()?;
                    Phase::Setup
                }
                NextStep::Leaf => {
                    if !ctx.key_found {
                        Phase::Lock
                    } else {
                        // A two-record internal root may demote; decide
                        // whether its other child must be loaded too.
                        match del_root_child(ctx)? {
                            RootChild::Restart => {
                                ctx.descent_restart()?;
                                Phase::Setup
                            }
                            RootChild::No => Phase::Lock,
                            RootChild::Load(addr) => {
                                match ctx.node_get(addr) {
                                    Ok(n) => {
                                        ctx.cursor = Some(n);
                                        Phase::StoreChild
                                    }
                                    Err(e) => match e.downcast_ref::<BtreeError>() {
                                        Some(BtreeError::AccessDenied(_))
                                        | Some(BtreeError::BadFormat) => {
                                            ctx.descent_restart()?;
                                            Phase::Setup
                                        }
                                        _ => return Err(e),
                                    },
                                }
                            }
                        }
                    }
                }
            },
            Phase::StoreChild => {
                let child = ctx.cursor.take().expect("STORE_CHILD without a loaded node");
                ctx.levels[1].sib_seq = child.seq();
                ctx.levels[1].sibling = Some(Arc::clone(&child));
                let valid = {
                    let frame = child.frame(seg)?;
                    child.ops().is_valid(frame)
                };
                if valid {
                    Phase::Lock
                } else {
                    ctx.descent_restart()?;
                    Phase::Setup
                }
            }
            Phase::Lock => {
                ctx.lock();
                Phase::Check
            }
            Phase::Check => {
                if ctx.path_check()? && ctx.sibling_check()? {
                    Phase::Act
                } else {
                    ctx.check_restart()?
                }
            }
            Phase::Act => {
                if !ctx.key_found {
                    let res = invoke_empty(cb, OpStatus::KeyNotFound);
                    ctx.unlock();
                    res?;
                    ctx.status = OpStatus::KeyNotFound;
                    Phase::Cleanup
                } else {
                    let leaf = ctx.levels[ctx.used].node.clone().expect("leaf bound");
                    let idx = ctx.levels[ctx.used].idx as usize;
                    // The callback observes the record before it goes; an
                    // error aborts with the tree untouched.
                    {
                        let frame = leaf.frame(seg)?;
                        let rec = Rec {
                            status: OpStatus::Success,
                            key: leaf.ops().key(frame, idx),
                            val: leaf.ops().val(frame, idx),
                        };
                        if let Err(e) = cb(&rec) {
                            ctx.unlock();
                            return Err(e);
                        }
                    }
                    let mut caps;
                    {
                        let frame = leaf.frame_mut(seg)?;
                        caps = leaf.ops().del(frame, idx);
                        caps.extend(leaf.ops().fix(frame));
                    }
                    leaf.bump_seq();
                    ctx.capture(tx, &leaf, &caps)?;

                    let underflow = {
                        let frame = leaf.frame(seg)?;
                        leaf.ops().is_underflow(frame, false)
                    };
                    ctx.status = OpStatus::Success;
                    if ctx.used == 0 || !underflow {
                        ctx.unlock();
                        Phase::Cleanup
                    } else {
                        ctx.del_resolve_underflow(tx)?;
                        Phase::FreeNode
                    }
                }
            }
            Phase::FreeNode => {
                ctx.del_freenode()?;
                Phase::Cleanup
            }
            Phase::Cleanup => {
                ctx.release_all();
                Phase::Fini
            }
            Phase::Fini => Phase::Done,
            Phase::Done => return Ok(ctx.status),
            _ => unreachable!("phase {:?} not reachable in del", phase),
        }
    }
}

enum RootChild {
    No,
    Load(SegAddr),
    Restart,
}

/// Whether deleting this key can collapse the tree into the root, which
/// requires the root's other child in hand before the lock is taken.
fn del_root_child(ctx: &OpContext<'_>) -> Result<RootChild> {
    if ctx.used == 0 {
        return Ok(RootChild::No);
    }
    let seg = &ctx.store.seg;
    let mut k = ctx.used;
    loop {
        let node = ctx.levels[k].node.as_ref().expect("level bound");
        let ops = node.ops();
        let frame = node.frame(seg)?;
        if !ops.is_valid(frame) {
            return Ok(RootChild::Restart);
        }
        if k == 0 {
            if ops.count_rec(frame) != 2 {
                return Ok(RootChild::No);
            }
            let other = if ctx.levels[0].idx == 0 { 1 } else { 0 };
            let child = ops.child(frame, other);
            if !child.is_valid() || !seg.contains(child) {
                if ctx.lock_held {
                    return Err(BtreeError::BadAddress(child.raw()).into());
                }
                return Ok(RootChild::Restart);
            }
            return Ok(RootChild::Load(child));
        }
        if !ops.is_underflow(frame, true) {
            return Ok(RootChild::No);
        }
        k -= 1;
    }
}

/// ITER engine.
pub(crate) fn iter_tick(
    store: &Store,
    tree: &Arc<TreeDesc>,
    key: &[u8],
    flags: OpFlags,
    cb: RecCb<'_>,
) -> Result<OpStatus> {
    let mut ctx = OpContext::new(store, Arc::clone(tree), flags);
    let res = iter_phases(&mut ctx, key, cb);
    ctx.unlock();
    ctx.release_all();
    res
}

fn iter_phases(ctx: &mut OpContext<'_>, key: &[u8], cb: RecCb<'_>) -> Result<OpStatus> {
    let seg = &ctx.store.seg;
    let mut phase = Phase::Init;
    loop {
        phase = match phase {
            Phase::Init => ctx.init_phase(),
            Phase::Cookie => {
                if ctx.cookie_valid(key) {
                    Phase::Lock
                } else {
                    Phase::Setup
                }
            }
            Phase::Setup => {
                ctx.setup();
                Phase::LockAll
            }
            Phase::LockAll => {
                ctx.lockall();
                Phase::Down
            }
            Phase::Down => {
                ctx.down()?;
                Phase::NextDown
            }
            Phase::NextDown => match ctx.next_down(key, true)? {
                NextStep::Descend => Phase::NextDown,
                NextStep::Restart => {
                    ctx.descent_restart()?;
                    Phase::Setup
                }
                NextStep::Leaf => {
                    let lev = &mut ctx.levels[ctx.used];
                    lev.idx = sibling_index(lev.idx, ctx.flags, ctx.key_found);
                    if ctx.leaf_index_valid()? || ctx.pivot == -1 {
                        Phase::Lock
                    } else {
                        // The target record lives in a neighboring subtree;
                        // descend it from the pivot, validating as we go.
                        let p = ctx.pivot as usize;
                        let node = ctx.levels[p].node.clone().expect("pivot bound");
                        let ok = {
                            let frame = node.frame(seg)?;
                            node.ops().is_valid(frame) && node.ops().verify(frame)
                        } && node.seq() == ctx.levels[p].seq;
                        if !ok {
                            ctx.flags |= OpFlags::LOCKALL;
                            ctx.release_all();
                            Phase::Setup
                        } else {
                            let sidx = sibling_index(ctx.levels[p].idx, ctx.flags, true);
                            let child = {
                                let frame = node.frame(seg)?;
                                node.ops().child(frame, sidx as usize)
                            };
                            if !child.is_valid() || !seg.contains(child) {
                                if ctx.lock_held {
                                    return Err(BtreeError::BadAddress(child.raw()).into());
                                }
                                ctx.descent_restart()?;
                                phase = Phase::Setup;
                                continue;
                            }
                            match ctx.node_get(child) {
                                Ok(n) => {
                                    ctx.cursor = Some(n);
                                    ctx.pivot += 1;
                                    Phase::Sibling
                                }
                                Err(e) => match e.downcast_ref::<BtreeError>() {
                                    Some(BtreeError::AccessDenied(_))
                                    | Some(BtreeError::BadFormat) => {
                                        ctx.descent_restart()?;
                                        Phase::Setup
                                    }
                                    _ => return Err(e),
                                },
                            }
                        }
                    }
                }
            },
            Phase::Sibling => {
                let node = ctx.cursor.take().expect("SIBLING without a loaded node");
                let p = ctx.pivot as usize;
                ctx.levels[p].sib_seq = node.seq();
                ctx.levels[p].sibling = Some(Arc::clone(&node));

                enum Step {
                    Bad,
                    Leaf,
                    Child(SegAddr),
                }
                let step = {
                    let frame = node.frame(seg)?;
                    let ops = node.ops();
                    if !ops.is_valid(frame) || !ops.verify(frame) {
                        Step::Bad
                    } else if ops.level(frame) > 0 {
                        let sidx = if ctx.flags.contains(OpFlags::NEXT) {
                            0
                        } else {
                            ops.count(frame)
                        };
                        Step::Child(ops.child(frame, sidx))
                    } else {
                        Step::Leaf
                    }
                };
                match step {
                    Step::Bad => {
                        ctx.descent_restart()?;
                        Phase::Setup
                    }
                    Step::Leaf => Phase::Lock,
                    Step::Child(child) => {
                        if !child.is_valid() || !seg.contains(child) {
                            if ctx.lock_held {
                                return Err(BtreeError::BadAddress(child.raw()).into());
                            }
                            ctx.descent_restart()?;
                            phase = Phase::Setup;
                            continue;
                        }
                        if ctx.pivot as usize + 1 >= ctx.levels.len() {
                            // The sibling spine ran deeper than the height
                            // snapshot; the tree changed under us.
                            ctx.descent_restart()?;
                            phase = Phase::Setup;
                            continue;
                        }
                        match ctx.node_get(child) {
                            Ok(n) => {
                                ctx.cursor = Some(n);
                                ctx.pivot += 1;
                                Phase::Sibling
                            }
                            Err(e) => match e.downcast_ref::<BtreeError>() {
                                Some(BtreeError::AccessDenied(_))
                                | Some(BtreeError::BadFormat) => {
                                    ctx.descent_restart()?;
                                    Phase::Setup
                                }
                                _ => return Err(e),
                            },
                        }
                    }
                }
            }
            Phase::Lock => {
                ctx.lock();
                Phase::Check
            }
            Phase::Check => {
                if ctx.path_check()? && ctx.sibling_check()? {
                    Phase::Act
                } else {
                    ctx.check_restart()?
                }
            }
            Phase::Act => {
                let res;
                if ctx.leaf_index_valid()? {
                    let leaf = ctx.levels[ctx.used].node.clone().expect("leaf bound");
                    let idx = ctx.levels[ctx.used].idx as usize;
                    let frame = leaf.frame(seg)?;
                    let rec = Rec {
                        status: OpStatus::Success,
                        key: leaf.ops().key(frame, idx),
                        val: leaf.ops().val(frame, idx),
                    };
                    ctx.status = OpStatus::Success;
                    res = cb(&rec);
                } else if ctx.pivot == -1 {
                    // The search key sits at the tree's boundary in the
                    // iteration direction.
                    ctx.status = OpStatus::BtreeBoundary;
                    res = invoke_empty(cb, OpStatus::BtreeBoundary);
                } else {
                    let sib = ctx.levels[ctx.used]
                        .sibling
                        .clone()
                        .expect("sibling leaf loaded");
                    let frame = sib.frame(seg)?;
                    let ops = sib.ops();
                    let idx = if ctx.flags.contains(OpFlags::NEXT) {
                        0
                    } else {
                        ops.count(frame) - 1
                    };
                    let rec = Rec {
                        status: OpStatus::Success,
                        key: ops.key(frame, idx),
                        val: ops.val(frame, idx),
                    };
                    ctx.status = OpStatus::Success;
                    res = cb(&rec);
                }
                ctx.unlock();
                res?;
                Phase::Cleanup
            }
            Phase::Cleanup => {
                ctx.release_all();
                Phase::Fini
            }
            Phase::Fini => Phase::Done,
            Phase::Done => return Ok(ctx.status),
            _ => unreachable!("phase {:?} not reachable in iter", phase),
        }
    }
}
