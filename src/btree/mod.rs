//! # B+Tree Module
//!
//! Persistent B+-trees over a memory-mapped segment, built for use as the
//! indexing and metadata substrate of an object store. Keys and values are
//! opaque byte strings of sizes fixed per tree; records live in power-of-2
//! node frames addressed by packed segment addresses.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   Public API (Store, Btree, callbacks)    │
//! ├───────────────────────────────────────────┤
//! │   Operation engine (phase state machine)  │   op
//! ├──────────────────────┬────────────────────┤
//! │  Node/tree registry  │  Node descriptor   │   desc
//! │  (fixed pool)        │  cache + LRU       │
//! ├──────────────────────┴────────────────────┤
//! │  Node formats (NodeOps vtable, fixed)     │   node, fixed
//! ├───────────────────────────────────────────┤
//! │  Segment (mmap, frames, addresses)        │   storage
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Any number of operations may run against one tree from any number of
//! threads. Descent is optimistic and lock-free; the commit point takes the
//! tree's write lock and re-validates every node it depends on through
//! per-node sequence counters. Operations that keep losing validation races
//! escalate to whole-tree locking. See the `op` module docs for the phase
//! protocol.
//!
//! ## Durability Model
//!
//! The tree does not write a log of its own. Mutating operations take a
//! [`Tx`] whose capture sink receives every modified byte range; replaying a
//! committed capture stream onto a blank segment reproduces the tree (see the
//! `tx` module). Readers need no transaction.
//!
//! ## Keys
//!
//! Keys compare as raw bytes. Integer keys must be stored in big-endian
//! form for numeric order to match byte order.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::create("meta.seg", 1 << 24)?;
//! let mut sink = NullSink;
//! let mut tx = Tx::new(&mut sink);
//! let bt = store.btree_create(1024, BtreeType { id: 1, ksize: 8, vsize: 8 }, NTYPE_FIXED, &mut tx)?;
//!
//! let key = 42u64.to_be_bytes();
//! bt.put(&key, OpFlags::NONE, &mut tx, |rec| {
//!     if rec.status == OpStatus::Success {
//!         rec.key.copy_from_slice(&key);
//!         rec.val.copy_from_slice(&7u64.to_le_bytes());
//!     }
//!     Ok(())
//! })?;
//! tx.commit();
//! ```

pub mod desc;
pub mod fixed;
pub mod node;
pub(crate) mod op;

use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, eyre, Result};

use crate::config::{ADDR_VSIZE, CLOSE_GRACE_MS};
use crate::storage::{size_to_shift, shift_is_valid, SegAddr, Segment};
use crate::tx::{Credit, CreditOp, Tx};
use desc::{NodeCache, TreeDesc, TreeRegistry};
use fixed::NODE_HEADER_SIZE;
use node::{ntype_of, NodeTypeRegistry};

pub use fixed::NTYPE_FIXED;
pub use op::Cookie;

/// Typed error kinds of the tree substrate, carried inside `eyre::Report`
/// and recoverable via `Report::downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum BtreeError {
    #[error("segment address {0:#x} is invalid or out of bounds")]
    BadAddress(u64),
    #[error("node frame failed format validation")]
    BadFormat,
    #[error("validation kept failing with the whole tree locked")]
    RetryExhausted,
    #[error("node {0:#x} is scheduled for delayed free")]
    AccessDenied(u64),
    #[error("tree descriptor pool exhausted")]
    PoolExhausted,
    #[error("close timed out waiting for active node references")]
    CloseTimeout,
}

/// Result reported to operation callbacks and returned by operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    KeyExists,
    KeyNotFound,
    /// Iteration or slant lookup ran off the edge of the tree.
    BtreeBoundary,
}

/// Operation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(u32);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Try the fast-path cookie before a full descent.
    pub const COOKIE: OpFlags = OpFlags(1 << 0);
    /// Take the whole-tree lock before descending.
    pub const LOCKALL: OpFlags = OpFlags(1 << 1);
    /// Lookup matches exactly or reports `KeyNotFound`.
    pub const EQUAL: OpFlags = OpFlags(1 << 2);
    /// Lookup returns the key or its successor.
    pub const SLANT: OpFlags = OpFlags(1 << 3);
    /// Iterate toward greater keys.
    pub const NEXT: OpFlags = OpFlags(1 << 4);
    /// Iterate toward smaller keys.
    pub const PREV: OpFlags = OpFlags(1 << 5);

    pub fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;
    fn bitor(self, rhs: OpFlags) -> OpFlags {
        OpFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OpFlags {
    fn bitor_assign(&mut self, rhs: OpFlags) {
        self.0 |= rhs.0;
    }
}

/// Read-only record view handed to GET/ITER/DEL callbacks. The buffers alias
/// the node frame and must not be retained past the callback.
pub struct Rec<'a> {
    pub status: OpStatus,
    pub key: &'a [u8],
    pub val: &'a [u8],
}

/// Writable record slot handed to PUT callbacks. On `Success` the callback
/// must fill both buffers; the key written must be the key that was
/// searched. On `KeyExists` the buffers are empty.
pub struct RecMut<'a> {
    pub status: OpStatus,
    pub key: &'a mut [u8],
    pub val: &'a mut [u8],
}

/// Tree-type metadata: an application-chosen id plus the record geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeType {
    pub id: u32,
    pub ksize: u16,
    pub vsize: u16,
}

/// A segment plus the process-wide state of the tree module: the tree
/// descriptor pool, the node descriptor cache with its LRU, and the table of
/// registered node formats.
pub struct Store {
    pub(crate) seg: Segment,
    pub(crate) cache: NodeCache,
    pub(crate) trees: TreeRegistry,
    pub(crate) ntypes: NodeTypeRegistry,
}

impl Store {
    pub fn create<P: AsRef<std::path::Path>>(path: P, size: u64) -> Result<Store> {
        Ok(Self::wrap(Segment::create(path, size)?))
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Store> {
        Ok(Self::wrap(Segment::open(path)?))
    }

    fn wrap(seg: Segment) -> Store {
        Store {
            seg,
            cache: NodeCache::new(),
            trees: TreeRegistry::new(),
            ntypes: NodeTypeRegistry::new(),
        }
    }

    /// Creates a tree: allocates and formats a root frame of roughly
    /// `node_size` bytes (rounded up to a power of two) and claims a tree
    /// descriptor. The root address is fixed for the tree's lifetime; reach
    /// it via [`Btree::root_addr`] and reopen with [`Store::btree_open`].
    pub fn btree_create(
        &self,
        node_size: usize,
        ttype: BtreeType,
        ntype: u32,
        tx: &mut Tx<'_>,
    ) -> Result<Btree<'_>> {
        let shift = size_to_shift(node_size);
        ensure!(shift_is_valid(shift), "node size {} out of range", node_size);
        ensure!(ttype.ksize > 0 && ttype.vsize > 0, "zero key or value size");
        let body = (1usize << shift) - NODE_HEADER_SIZE;
        let leaf_cap = body / (ttype.ksize as usize + ttype.vsize as usize);
        // An internal node must split into halves that each keep a real
        // delimiting key beside the sentinel.
        let internal_cap = body / (ttype.ksize as usize + ADDR_VSIZE);
        ensure!(
            leaf_cap >= 2 && internal_cap >= 4,
            "node size {} too small for {}+{} byte records",
            1usize << shift,
            ttype.ksize,
            ttype.vsize
        );

        let ops = self.ntypes.lookup(ntype)?;
        let tree = self.trees.get(&self.cache, &self.seg, &self.ntypes, None)?;
        let (root, caps) = match self.cache.alloc(
            &self.seg,
            &self.ntypes,
            &tree,
            shift,
            ops,
            ttype.ksize,
            ttype.vsize,
            ttype.id,
        ) {
            Ok(allocated) => allocated,
            Err(err) => {
                self.trees.put(&tree);
                return Err(err);
            }
        };
        tx.capture_node(&self.seg, &root, &caps)?;
        tree.state.lock().root = Some(root);
        tree.set_height(1);

        Ok(Btree {
            store: self,
            tree,
            ttype,
            shift,
            released: false,
        })
    }

    /// Opens the tree rooted at `root`. `node_size` must agree with the size
    /// class packed into the address.
    pub fn btree_open(&self, root: SegAddr, node_size: usize) -> Result<Btree<'_>> {
        ensure!(
            size_to_shift(node_size) == root.shift(),
            "node size {} does not match root address size class {}",
            node_size,
            root.shift()
        );
        self.seg.prefetch(root);
        let tree = self
            .trees
            .get(&self.cache, &self.seg, &self.ntypes, Some(root))?;

        let (ttype, shift) = {
            let node = tree.root().ok_or_else(|| eyre!("opened tree lost its root"))?;
            let frame = node.frame(&self.seg)?;
            let ops = node.ops();
            (
                BtreeType {
                    id: ops.tree_type(frame),
                    ksize: ops.keysize(frame) as u16,
                    vsize: ops.leaf_valsize(frame) as u16,
                },
                ops.shift(frame),
            )
        };

        Ok(Btree {
            store: self,
            tree,
            ttype,
            shift,
            released: false,
        })
    }

    /// Daemon-style LRU reclaim: drops up to `count` idle node descriptors.
    pub fn lrulist_purge(&self, count: usize) -> usize {
        self.cache.purge(&self.seg, count)
    }

    pub fn sync(&self) -> Result<()> {
        self.seg.sync()
    }

    pub fn segment(&self) -> &Segment {
        &self.seg
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("segment", &self.seg)
            .field("trees_loaded", &self.trees.loaded())
            .finish()
    }
}

/// Handle to one open tree. Cheap to use from many threads at once; all
/// internal synchronization is per-operation.
pub struct Btree<'s> {
    store: &'s Store,
    tree: Arc<TreeDesc>,
    ttype: BtreeType,
    shift: u8,
    released: bool,
}

impl<'s> Btree<'s> {
    pub fn root_addr(&self) -> SegAddr {
        self.tree
            .root()
            .map(|r| r.addr())
            .unwrap_or(SegAddr::NULL)
    }

    pub fn height(&self) -> u32 {
        self.tree.height()
    }

    pub fn tree_type(&self) -> BtreeType {
        self.ttype
    }

    pub fn node_size(&self) -> usize {
        1 << self.shift
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        ensure!(
            key.len() == self.ttype.ksize as usize,
            "key length {} does not match tree key size {}",
            key.len(),
            self.ttype.ksize
        );
        Ok(())
    }

    /// Inserts a record. The callback is invoked once with the opened slot
    /// (`Success`, buffers aliasing the leaf) or with `KeyExists` and empty
    /// buffers; a callback error aborts the insert with full undo.
    pub fn put<F>(
        &self,
        key: &[u8],
        flags: OpFlags,
        tx: &mut Tx<'_>,
        mut fill: F,
    ) -> Result<OpStatus>
    where
        F: FnMut(&mut RecMut<'_>) -> Result<()>,
    {
        self.check_key(key)?;
        op::put_tick(self.store, &self.tree, key, flags, tx, &mut fill)
    }

    /// Looks a key up. With `SLANT` the successor is returned when the key
    /// itself is absent; otherwise the match must be exact.
    pub fn get<F>(&self, key: &[u8], flags: OpFlags, mut cb: F) -> Result<OpStatus>
    where
        F: FnMut(&Rec<'_>) -> Result<()>,
    {
        self.check_key(key)?;
        op::get_tick(self.store, &self.tree, key, flags, &mut cb)
    }

    /// Steps the iterator one record from `key` in the direction given by
    /// `NEXT` or `PREV`; `BtreeBoundary` reports the end of the tree.
    pub fn iter<F>(&self, key: &[u8], flags: OpFlags, mut cb: F) -> Result<OpStatus>
    where
        F: FnMut(&Rec<'_>) -> Result<()>,
    {
        self.check_key(key)?;
        ensure!(
            flags.contains(OpFlags::NEXT) != flags.contains(OpFlags::PREV),
            "iteration needs exactly one of NEXT or PREV"
        );
        op::iter_tick(self.store, &self.tree, key, flags, &mut cb)
    }

    /// Deletes a record. The callback observes the record before removal;
    /// a callback error aborts with the tree untouched.
    pub fn del<F>(
        &self,
        key: &[u8],
        flags: OpFlags,
        tx: &mut Tx<'_>,
        mut cb: F,
    ) -> Result<OpStatus>
    where
        F: FnMut(&Rec<'_>) -> Result<()>,
    {
        self.check_key(key)?;
        op::del_tick(self.store, &self.tree, key, flags, tx, &mut cb)
    }

    /// Upper bound on the state one operation of kind `op` may dirty.
    pub fn credit(&self, op: CreditOp, acc: &mut Credit) {
        let height = u64::from(self.tree.height());
        let node_size = 1u64 << self.shift;
        match op {
            // Height worth of nodes, a spare per level, and the extra
            // root-split node.
            CreditOp::Put => acc.add(height + 2, (height + 2) * node_size),
            CreditOp::Del => acc.add(height + 1, (height + 1) * node_size),
            CreditOp::Create | CreditOp::Destroy => acc.add(1, node_size),
        }
    }

    /// Releases this handle. The last closer waits up to the close grace
    /// period for other operations to drop their node references; if they
    /// don't, the close fails and the tree stays open.
    pub fn close(&mut self) -> Result<()> {
        ensure!(!self.released, "tree already closed");
        {
            let mut st = self.tree.state.lock();
            if st.refs > 1 {
                drop(st);
                self.store.trees.put(&self.tree);
                self.released = true;
                return Ok(());
            }
            st.starttime = Some(Instant::now());
        }

        let grace = Duration::from_millis(CLOSE_GRACE_MS);
        while self.tree.active_count() > 1 {
            let started = self
                .tree
                .state
                .lock()
                .starttime
                .expect("close in progress");
            if started.elapsed() > grace {
                tracing::warn!(
                    active = self.tree.active_count(),
                    "close timed out with active node references"
                );
                self.tree.state.lock().starttime = None;
                return Err(BtreeError::CloseTimeout.into());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.tree.state.lock().starttime = None;

        let root = self.tree.state.lock().root.take();
        if let Some(root) = root {
            self.store.cache.put(&self.store.seg, &root);
        }
        self.store.trees.put(&self.tree);
        self.released = true;
        Ok(())
    }

    /// Destroys an empty tree: frees the root frame and returns the
    /// descriptor slot.
    pub fn destroy(mut self) -> Result<()> {
        let root = self
            .tree
            .root()
            .ok_or_else(|| eyre!("destroying a tree without a root"))?;
        {
            let frame = root.frame(&self.store.seg)?;
            ensure!(
                root.ops().count_rec(frame) == 0,
                "destroy requires an empty tree"
            );
        }
        self.tree.state.lock().root = None;
        self.store.cache.free(&self.store.seg, &root)?;
        self.store.trees.put(&self.tree);
        self.released = true;
        Ok(())
    }

    /// Full-tree structural audit: uniform leaf depth, in-node key order,
    /// subtree bounds, address size classes, and footer checksums. Takes the
    /// commit lock for the duration.
    pub fn verify_invariants(&self) -> Result<()> {
        self.tree.wlock.lock_write();
        let res = (|| {
            let root = self.tree.root().ok_or_else(|| eyre!("tree has no root"))?;
            let frame = root.frame(&self.store.seg)?;
            let level = root.ops().level(frame);
            ensure!(
                u32::from(level) + 1 == self.tree.height(),
                "root level {} does not match height {}",
                level,
                self.tree.height()
            );
            verify_subtree(self.store, root.addr(), level, None, None)
        })();
        self.tree.wlock.unlock_write();
        res
    }
}

fn verify_subtree(
    store: &Store,
    addr: SegAddr,
    expect_level: u8,
    min: Option<&[u8]>,
    max: Option<&[u8]>,
) -> Result<()> {
    let seg = &store.seg;
    let frame = seg.frame(addr)?;
    let ops = store.ntypes.lookup(ntype_of(frame))?;
    ensure!(
        ops.is_valid(frame) && ops.verify(frame),
        "node {:?} failed format validation",
        addr
    );
    ensure!(
        ops.invariant(frame, addr),
        "node {:?} disagrees with its address size class",
        addr
    );
    let level = ops.level(frame);
    ensure!(
        level == expect_level,
        "node {:?} at level {} where {} was expected",
        addr,
        level,
        expect_level
    );

    let count = ops.count(frame);
    for i in 1..count {
        ensure!(
            ops.key(frame, i - 1) < ops.key(frame, i),
            "keys out of order in node {:?}",
            addr
        );
    }

    if level == 0 {
        for i in 0..count {
            let key = ops.key(frame, i);
            if let Some(min) = min {
                ensure!(key >= min, "leaf key below subtree bound in {:?}", addr);
            }
            if let Some(max) = max {
                ensure!(key < max, "leaf key above subtree bound in {:?}", addr);
            }
        }
    } else {
        for i in 0..ops.count_rec(frame) {
            let child = ops.child(frame, i);
            ensure!(
                child.is_valid() && seg.contains(child),
                "bad child address in node {:?}",
                addr
            );
            let lo = if i == 0 { min } else { Some(ops.key(frame, i - 1)) };
            let hi = if i < count { Some(ops.key(frame, i)) } else { max };
            verify_subtree(store, child, level - 1, lo, hi)?;
        }
    }
    Ok(())
}

impl Drop for Btree<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort release without the close grace protocol.
        let root = {
            let mut st = self.tree.state.lock();
            if st.refs == 1 {
                st.root.take()
            } else {
                None
            }
        };
        if let Some(root) = root {
            self.store.cache.put(&self.store.seg, &root);
        }
        self.store.trees.put(&self.tree);
    }
}

impl std::fmt::Debug for Btree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("root", &self.root_addr())
            .field("height", &self.height())
            .field("type", &self.ttype)
            .finish()
    }
}
