//! # Memory-Mapped Segment
//!
//! A segment is a fixed-size file mapped into the process address space that
//! hosts node frames. The first 512 bytes hold the segment header; everything
//! after it is carved into power-of-2 frames on demand.
//!
//! ## Layout
//!
//! ```text
//! Offset 0:      SegmentHeader (magic, version, size, allocator state)
//! Offset 512:    first frame
//! ...            frames, each 2^shift bytes, aligned to its own size
//! ```
//!
//! ## Frame Allocation
//!
//! The allocator keeps one free list per size class (16 classes, 512 B to
//! 16 MB). Freed frames are threaded through their own first 8 bytes, and the
//! list heads live in the segment header, so free space survives reopen. When
//! a class list is empty the allocator bumps the high-water mark, aligning it
//! to the requested frame size.
//!
//! ## Safety Model
//!
//! Unlike a grow-able database file, a segment never remaps: its size is fixed
//! at creation, so the mapping's base pointer is stable for the lifetime of
//! the `Segment`. Frame access therefore hands out slices derived from a
//! shared reference:
//!
//! - `frame()` returns `&[u8]` for optimistic readers. Readers validate what
//!   they decode (header tags, footer checksums, sequence counters) and
//!   restart on mismatch; a torn read is indistinguishable from losing a race
//!   and is handled the same way.
//! - `frame_mut()` returns `&mut [u8]` from `&self`. Callers must hold the
//!   owning tree's write lock (or the allocator lock, for frames not yet
//!   linked into any tree), which serializes all writers of a frame.
//!
//! This mirrors the discipline of the page-cache layer this segment replaces:
//! pinned buffers are handed out as raw slices and the surrounding locks, not
//! the borrow checker, enforce exclusivity.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{SEG_HEADER_SIZE, SHIFT_CLASS_COUNT, NODE_SHIFT_MIN};
use super::addr::{shift_is_valid, SegAddr};

pub const SEG_MAGIC: &[u8; 16] = b"arbor segment v1";
pub const SEG_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SegmentHeader {
    magic: [u8; 16],
    version: U32,
    reserved: U32,
    size: U64,
    next_off: U64,
    free_heads: [U64; SHIFT_CLASS_COUNT],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() <= SEG_HEADER_SIZE);

impl SegmentHeader {
    fn new(size: u64) -> Self {
        Self {
            magic: *SEG_MAGIC,
            version: U32::new(SEG_VERSION),
            reserved: U32::new(0),
            size: U64::new(size),
            next_off: U64::new(SEG_HEADER_SIZE as u64),
            free_heads: [U64::new(0); SHIFT_CLASS_COUNT],
        }
    }
}

/// A fixed-size persistent segment hosting node frames.
pub struct Segment {
    file: File,
    mmap: MmapMut,
    size: u64,
    /// Serializes allocator state (header high-water mark and free lists).
    alloc_lock: Mutex<()>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("size", &self.size).finish()
    }
}

impl Segment {
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            size >= (SEG_HEADER_SIZE as u64) * 2,
            "segment size {} too small (minimum {})",
            size,
            SEG_HEADER_SIZE * 2
        );
        ensure!(
            size % SEG_HEADER_SIZE as u64 == 0,
            "segment size {} is not a multiple of {}",
            size,
            SEG_HEADER_SIZE
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create segment '{}'", path.display()))?;

        file.set_len(size)
            .wrap_err_with(|| format!("failed to size segment to {} bytes", size))?;

        // SAFETY: the file was just created with exclusive access and sized to
        // `size`. The mapping's lifetime is tied to the returned Segment and
        // the file is never resized, so the mapping is never invalidated.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = SegmentHeader::new(size);
        mmap[..std::mem::size_of::<SegmentHeader>()].copy_from_slice(header.as_bytes());

        Ok(Self {
            file,
            mmap,
            size,
            alloc_lock: Mutex::new(()),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open segment '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            size >= SEG_HEADER_SIZE as u64,
            "segment '{}' truncated below header size",
            path.display()
        );

        // SAFETY: see `create`; the file is opened read-write and never
        // resized while mapped.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = SegmentHeader::ref_from_bytes(&mmap[..std::mem::size_of::<SegmentHeader>()])
            .map_err(|e| eyre::eyre!("failed to parse segment header: {:?}", e))?;
        ensure!(&header.magic == SEG_MAGIC, "invalid segment magic");
        ensure!(
            header.version.get() == SEG_VERSION,
            "unsupported segment version {} (expected {})",
            header.version.get(),
            SEG_VERSION
        );
        ensure!(
            header.size.get() == size,
            "segment header records {} bytes but file has {}",
            header.size.get(),
            size
        );

        Ok(Self {
            file,
            mmap,
            size,
            alloc_lock: Mutex::new(()),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when `addr` denotes a frame lying entirely inside this segment,
    /// after the header block.
    pub fn contains(&self, addr: SegAddr) -> bool {
        addr.is_valid()
            && !addr.is_null()
            && addr.offset() >= SEG_HEADER_SIZE as u64
            && addr.offset() + addr.size() as u64 <= self.size
    }

    /// Read view of a frame.
    pub fn frame(&self, addr: SegAddr) -> Result<&[u8]> {
        ensure!(self.contains(addr), "address {:?} outside segment bounds", addr);
        let off = addr.offset() as usize;
        Ok(&self.mmap[off..off + addr.size()])
    }

    /// Write view of a frame from a shared segment reference.
    ///
    /// SAFETY contract (not enforced by the compiler): the caller must hold
    /// the owning tree's write lock, or the allocator lock for frames not yet
    /// reachable from any tree, so that no two writers alias. See the module
    /// docs.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn frame_mut(&self, addr: SegAddr) -> Result<&mut [u8]> {
        ensure!(self.contains(addr), "address {:?} outside segment bounds", addr);
        let off = addr.offset() as usize;
        // SAFETY: the mapping is valid for `size` bytes and never remapped;
        // the range was bounds-checked above; exclusivity is provided by the
        // caller's lock per the contract in the doc comment.
        unsafe {
            let base = self.mmap.as_ptr().add(off) as *mut u8;
            Ok(std::slice::from_raw_parts_mut(base, addr.size()))
        }
    }

    /// Write views of two distinct frames at once (record moves during splits
    /// and merges touch a source and a target simultaneously).
    pub(crate) fn frame_pair_mut(
        &self,
        a: SegAddr,
        b: SegAddr,
    ) -> Result<(&mut [u8], &mut [u8])> {
        ensure!(a.offset() != b.offset(), "frame pair aliases {:?}", a);
        Ok((self.frame_mut(a)?, self.frame_mut(b)?))
    }

    /// Allocates a frame of `1 << shift` bytes, reusing a freed frame of the
    /// same class when one exists.
    pub fn alloc_frame(&self, shift: u8) -> Result<SegAddr> {
        ensure!(shift_is_valid(shift), "bad frame shift {}", shift);
        let _guard = self.alloc_lock.lock();
        let class = (shift - NODE_SHIFT_MIN) as usize;

        let head = self.header().free_heads[class].get();
        if head != 0 {
            let addr = SegAddr::from_raw(head);
            debug_assert!(self.contains(addr) && addr.shift() == shift);
            let next = {
                let frame = self.frame(addr)?;
                u64::from_le_bytes(frame[..8].try_into().expect("frame shorter than 8 bytes"))
            };
            self.header_mut().free_heads[class] = U64::new(next);
            return Ok(addr);
        }

        let next_off = self.header().next_off.get();
        let align = 1u64 << shift;
        let off = next_off.div_ceil(align) * align;
        let end = off + (1u64 << shift);
        ensure!(
            end <= self.size,
            "segment exhausted: need {} bytes at offset {}, segment is {}",
            1u64 << shift,
            off,
            self.size
        );
        self.header_mut().next_off = U64::new(end);
        Ok(SegAddr::build(off, shift))
    }

    /// Returns a frame to its size-class free list.
    pub fn free_frame(&self, addr: SegAddr) -> Result<()> {
        ensure!(self.contains(addr), "address {:?} outside segment bounds", addr);
        let _guard = self.alloc_lock.lock();
        let class = (addr.shift() - NODE_SHIFT_MIN) as usize;
        let head = self.header().free_heads[class].get();
        // SAFETY: allocator lock held; the frame is unreachable from any tree
        // once freed, so aliasing writers cannot exist.
        self.frame_mut(addr)?[..8].copy_from_slice(&head.to_le_bytes());
        self.header_mut().free_heads[class] = U64::new(addr.raw());
        Ok(())
    }

    /// Patches a byte range of a frame. Used to replay captured regions into
    /// a blank segment.
    pub(crate) fn write_frame_region(&self, addr: SegAddr, off: u32, bytes: &[u8]) -> Result<()> {
        let frame = self.frame_mut(addr)?;
        let off = off as usize;
        ensure!(
            off + bytes.len() <= frame.len(),
            "capture region {}..{} exceeds frame size {}",
            off,
            off + bytes.len(),
            frame.len()
        );
        frame[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Raises the allocator high-water mark so replayed frames are not handed
    /// out again. Used when reconstructing a segment from a capture log.
    pub(crate) fn reserve_through(&self, addr: SegAddr) -> Result<()> {
        ensure!(self.contains(addr), "address {:?} outside segment bounds", addr);
        let _guard = self.alloc_lock.lock();
        let end = addr.offset() + addr.size() as u64;
        if self.header().next_off.get() < end {
            self.header_mut().next_off = U64::new(end);
        }
        Ok(())
    }

    /// Advises the kernel that a frame is about to be read.
    pub fn prefetch(&self, addr: SegAddr) {
        if !self.contains(addr) {
            return;
        }
        #[cfg(unix)]
        // SAFETY: the range was bounds-checked against the mapping, and
        // madvise(WILLNEED) is a hint with no memory-safety consequences.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(addr.offset() as usize) as *mut libc::c_void,
                addr.size(),
                libc::MADV_WILLNEED,
            );
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync segment to disk")?;
        self.file.sync_all().wrap_err("failed to fsync segment file")
    }

    fn header(&self) -> &SegmentHeader {
        SegmentHeader::ref_from_bytes(&self.mmap[..std::mem::size_of::<SegmentHeader>()])
            .expect("segment header validated at open")
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut SegmentHeader {
        // SAFETY: allocator lock is held by all callers; the header block
        // overlaps no frame, and the mapping is stable (see module docs).
        unsafe {
            let base = self.mmap.as_ptr() as *mut u8;
            let bytes =
                std::slice::from_raw_parts_mut(base, std::mem::size_of::<SegmentHeader>());
            SegmentHeader::mut_from_bytes(bytes).expect("segment header validated at open")
        }
    }
}
