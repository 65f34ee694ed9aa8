//! # Storage Module
//!
//! The persistent substrate under the B-tree: a memory-mapped segment hosting
//! power-of-2 node frames, addressed by packed segment addresses.
//!
//! ## Module Organization
//!
//! - `addr`: the segment-address codec ([`SegAddr`]), a 64-bit value packing
//!   a 512-byte-aligned frame offset with the frame's size class.
//! - `segment`: the mmap-backed [`Segment`]: header block, per-size-class
//!   frame allocator with persistent free lists, raw frame access, prefetch
//!   hints, and sync.
//!
//! Everything above this module manipulates frames only through `SegAddr` and
//! the `Segment` accessors; no other component knows the file layout.

mod addr;
mod segment;

pub use addr::{offset_is_aligned, shift_is_valid, size_to_shift, SegAddr};
pub use segment::{Segment, SEG_MAGIC, SEG_VERSION};
