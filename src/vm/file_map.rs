//! File-backed memory mappings.
//!
//! Each mmap reopens the file once; the pages of a region share that handle
//! and carry a region id so munmap can walk exactly the pages it created.
//! Dirty pages are written back on eviction, munmap and process exit.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::PhysAddr;

use super::page::{Page, PageFlags, PageInit, SegmentInit, TargetKind};
use super::spt::SupplementalPageTable;
use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::memory::{self, PGSIZE};

static NEXT_REGION: AtomicU64 = AtomicU64::new(1);

/// Maps `length` bytes of `file` starting at `offset` to `addr`. Returns
/// `addr` on success.
pub fn do_mmap(
    spt: &mut SupplementalPageTable,
    addr: u64,
    length: usize,
    writable: bool,
    file: &File,
    offset: usize,
) -> KernelResult<u64> {
    if addr == 0 || addr % PGSIZE != 0 || offset % PGSIZE as usize != 0 {
        return Err(KernelError::Misaligned);
    }
    if length == 0 {
        return Err(KernelError::Misaligned);
    }
    let page_count = memory::page_up(length as u64) / PGSIZE;
    let end = addr
        .checked_add(page_count * PGSIZE)
        .ok_or(KernelError::Misaligned)?;
    if !memory::is_user_vaddr(addr) || !memory::is_user_vaddr(end - 1) {
        return Err(KernelError::Misaligned);
    }

    let file_len = file.len();
    if file_len == 0 || offset > file_len {
        return Err(KernelError::NoSuchFile);
    }

    // Refuse to overlay anything already mapped.
    for i in 0..page_count {
        if spt.find(addr + i * PGSIZE).is_some() {
            return Err(KernelError::AlreadyMapped);
        }
    }

    let region = NEXT_REGION.fetch_add(1, Ordering::Relaxed);
    let region_file = Arc::new(file.reopen());

    for i in 0..page_count {
        let page_offset = offset + (i * PGSIZE) as usize;
        let read_bytes = file_len.saturating_sub(page_offset).min(PGSIZE as usize);
        let flags = if i == 0 {
            PageFlags::MMAP_HEAD
        } else {
            PageFlags::empty()
        };
        let page = Page::new_uninit(
            addr + i * PGSIZE,
            writable,
            TargetKind::File,
            PageInit::FromFile(SegmentInit {
                file: region_file.clone(),
                offset: page_offset,
                read_bytes,
                zero_bytes: PGSIZE as usize - read_bytes,
            }),
            flags,
            Some(region),
        );
        // Insertion cannot collide after the overlap check above.
        spt.insert(page).expect("mmap page vanished from overlap check");
    }
    Ok(addr)
}

/// Unmaps the region whose head page sits at `addr`. Errors if `addr` is
/// not a region head.
pub fn do_munmap(
    spt: &mut SupplementalPageTable,
    pml4: PhysAddr,
    addr: u64,
) -> KernelResult<()> {
    match spt.find(addr) {
        Some(page) if page.is_mmap_head() => {}
        _ => return Err(KernelError::FaultUnhandled),
    }
    munmap_region(spt, pml4, addr);
    Ok(())
}

/// Walks consecutive pages of the region starting at `addr`, writing dirty
/// contents back and dropping the descriptors. The shared reopened file
/// closes when its last page drops.
pub(super) fn munmap_region(spt: &mut SupplementalPageTable, pml4: PhysAddr, addr: u64) {
    let region = match spt.find(addr) {
        Some(p) => p.region.expect("mmap head without a region id"),
        None => return,
    };
    let mut va = addr;
    loop {
        let stop = match spt.find(va) {
            Some(p) if p.region == Some(region) => va != addr && p.is_mmap_head(),
            _ => true,
        };
        if stop {
            break;
        }
        // remove() writes dirty file pages back before dropping.
        spt.remove(va, pml4);
        va += PGSIZE;
    }
}
