//! # arbor: persistent B+-tree metadata substrate
//!
//! A persistent on-segment B+-tree key-value container, built as the indexing
//! and metadata layer of a distributed object-store back-end. Records live in
//! power-of-2 node frames inside a memory-mapped segment; modifications are
//! reported, byte range by byte range, to an external transaction through a
//! capture sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Public API (Store, Btree, Tx, callbacks)   │
//! ├─────────────────────────────────────────────┤
//! │  Operation engine: restartable phase state  │
//! │  machine: optimistic descent, validated     │
//! │  commit under the per-tree lock             │
//! ├───────────────────────┬─────────────────────┤
//! │  Tree registry        │  Node descriptor    │
//! │  (fixed pool, bitmap) │  cache (slab + LRU) │
//! ├───────────────────────┴─────────────────────┤
//! │  Node formats (NodeOps vtable)              │
//! ├─────────────────────────────────────────────┤
//! │  Segment: mmap, frame allocator, addresses  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Highlights
//!
//! - **Optimistic concurrency**: operations descend without locks, snapshot
//!   per-node sequence counters, and validate the whole path under the tree
//!   write lock before mutating; contention restarts the operation and
//!   repeated failures escalate to whole-tree locking.
//! - **Descriptor cache**: every active node frame has one in-memory
//!   descriptor, found in O(1) through a token cached in the frame itself;
//!   idle descriptors age out through a global LRU.
//! - **Transactional capture**: every byte a mutation touches is handed to
//!   the caller's write-ahead machinery; replaying a committed capture
//!   stream onto a blank segment reproduces the tree.
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped segment and the packed address codec
//! - [`btree`]: node formats, descriptor cache, tree registry, operation
//!   engine, public API
//! - [`tx`]: credits, capture sinks, transactions
//! - [`config`]: constants and their interdependencies

pub mod btree;
pub mod config;
pub mod storage;
pub mod tx;

pub use btree::{
    Btree, BtreeError, BtreeType, Cookie, OpFlags, OpStatus, Rec, RecMut, Store, NTYPE_FIXED,
};
pub use storage::{SegAddr, Segment};
pub use tx::{CaptureSink, Credit, CreditOp, MemLog, NullSink, Tx};
