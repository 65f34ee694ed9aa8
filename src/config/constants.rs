//! # Configuration Constants
//!
//! All tunables of the substrate in one place. The dependency notes matter:
//! several values are baked into the on-segment format and cannot change
//! without a format version bump.
//!
//! ```text
//! NODE_SHIFT_MIN (9)
//!       │
//!       ├─> frame alignment: every frame starts at a 512-byte boundary,
//!       │   and a segment address stores the frame offset in 512-byte units
//!       │
//!       ├─> SEG_HEADER_SIZE (512): the segment header occupies exactly one
//!       │   alignment unit so the first frame lands on a valid address
//!       │
//!       └─> NODE_SHIFT_MAX (24): the address codec has a 4-bit size class,
//!           node size = 2^(9 + class), 512 B .. 16 MB
//!
//! ADDR_VSIZE (8)
//!       │
//!       └─> internal-node slot stride is ksize + ADDR_VSIZE; a segment
//!           address is always stored as 8 little-endian bytes
//! ```
//!
//! `MAX_TRIALS` and `CLOSE_GRACE_MS` are behavioral, not format, constants:
//! the former bounds optimistic restarts before a whole-tree lock is taken,
//! the latter is the wall-clock grace a close grants to straggling node
//! references before failing.

/// Number of tree-descriptor slots in the registry pool.
pub const MAX_TREE_COUNT: usize = 20;

/// Optimistic validation restarts allowed before escalating to a whole-tree
/// lock; with the whole-tree lock already held the operation fails instead.
pub const MAX_TRIALS: u32 = 3;

/// Smallest node size as a power-of-2 exponent (512 bytes). Also the frame
/// alignment of every segment address.
pub const NODE_SHIFT_MIN: u8 = 9;

/// Largest node size as a power-of-2 exponent (16 MB).
pub const NODE_SHIFT_MAX: u8 = 24;

/// Number of frame size classes the segment allocator tracks.
pub const SHIFT_CLASS_COUNT: usize = (NODE_SHIFT_MAX - NODE_SHIFT_MIN + 1) as usize;

/// Size of the segment header block at offset 0. Exactly one frame-alignment
/// unit so frames start at the first valid segment address.
pub const SEG_HEADER_SIZE: usize = 1 << NODE_SHIFT_MIN;

/// Stored size of a child segment address inside an internal-node slot.
pub const ADDR_VSIZE: usize = 8;

/// Wall-clock grace granted by close to operations still holding node
/// descriptors, in milliseconds.
pub const CLOSE_GRACE_MS: u64 = 5_000;

const _: () = assert!(SEG_HEADER_SIZE == 512);
const _: () = assert!(SHIFT_CLASS_COUNT == 16);
