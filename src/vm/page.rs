//! Page descriptors.
//!
//! Every user page starts as `Uninit` carrying its eventual kind plus an
//! initializer payload; the first fault materializes a frame, runs the
//! initializer and morphs the descriptor. Enum dispatch replaces the
//! original per-type operation tables.

use alloc::sync::Arc;
use bitflags::bitflags;
use x86_64::PhysAddr;

use crate::fs::File;
use crate::memory::PGSIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Part of the user stack (fork re-creates rather than re-reads).
        const STACK = 1 << 0;
        /// First page of an mmap region; munmap starts here.
        const MMAP_HEAD = 1 << 1;
    }
}

/// What an `Uninit` page will become once claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Anon,
    File,
}

/// File-reading initializer payload: fill `read_bytes` from `file` at
/// `offset`, zero the remaining `zero_bytes`.
pub struct SegmentInit {
    pub file: Arc<File>,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl SegmentInit {
    /// Deep copy for fork: the file is privately reopened so the parent's
    /// teardown cannot invalidate the child's payload.
    pub fn duplicate(&self) -> SegmentInit {
        SegmentInit {
            file: Arc::new(self.file.reopen()),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }

    /// Like `duplicate`, but shares an already-duplicated handle (pages of
    /// one mmap region keep sharing one reopen in the child).
    pub fn duplicate_with(&self, file: Arc<File>) -> SegmentInit {
        SegmentInit {
            file,
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }

    /// Populates `dst` (one page). False on a short read.
    pub fn run(&self, dst: &mut [u8]) -> bool {
        debug_assert_eq!(dst.len(), PGSIZE as usize);
        debug_assert_eq!(self.read_bytes + self.zero_bytes, PGSIZE as usize);
        let n = self.file.read_at(self.offset, &mut dst[..self.read_bytes]);
        if n != self.read_bytes {
            return false;
        }
        dst[self.read_bytes..].fill(0);
        true
    }
}

/// Content source for an unclaimed page.
pub enum PageInit {
    Zeros,
    FromFile(SegmentInit),
}

/// Backing store of a claimed file page; enough to re-read and write back.
pub struct FilePage {
    pub file: Arc<File>,
    pub offset: usize,
    pub read_bytes: usize,
}

pub enum Backing {
    Uninit { target: TargetKind, init: PageInit },
    /// Swap-backed. `swap_slot` is set exactly while the contents live in
    /// swap.
    Anon { swap_slot: Option<usize> },
    File(FilePage),
}

/// One user page, keyed by its page-aligned virtual address in the owning
/// thread's supplemental page table.
pub struct Page {
    pub va: u64,
    pub writable: bool,
    pub flags: PageFlags,
    /// Physical frame currently backing this page. `Some` iff the hardware
    /// PTE is present.
    pub frame: Option<PhysAddr>,
    pub backing: Backing,
    /// mmap region this page belongs to, if any.
    pub region: Option<u64>,
}

impl Page {
    pub fn new_uninit(
        va: u64,
        writable: bool,
        target: TargetKind,
        init: PageInit,
        flags: PageFlags,
        region: Option<u64>,
    ) -> Page {
        debug_assert_eq!(va % PGSIZE, 0);
        Page {
            va,
            writable,
            flags,
            frame: None,
            backing: Backing::Uninit { target, init },
            region,
        }
    }

    /// A zero-filled anonymous stack page.
    pub fn new_stack(va: u64) -> Page {
        Page::new_uninit(
            va,
            true,
            TargetKind::Anon,
            PageInit::Zeros,
            PageFlags::STACK,
            None,
        )
    }

    pub fn is_stack(&self) -> bool {
        self.flags.contains(PageFlags::STACK)
    }

    pub fn is_mmap_head(&self) -> bool {
        self.flags.contains(PageFlags::MMAP_HEAD)
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }
}
