//! Per-process page tables.
//!
//! Every user process owns a PML4 whose kernel half is a copy of the boot
//! page table, so kernel code keeps running (and the identity window keeps
//! working) whichever address space is active. All table frames come from
//! the kernel pool; table memory is reached through the identity window.

use spin::Once;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::{KernelError, KernelResult};
use crate::memory::{self, PGSIZE, USER_BASE, USER_STACK};

static KERNEL_PML4: Once<PhysAddr> = Once::new();

pub fn init() {
    let (frame, _) = Cr3::read();
    KERNEL_PML4.call_once(|| frame.start_address());
}

pub fn kernel_pml4() -> PhysAddr {
    *KERNEL_PML4.get().expect("paging not initialized")
}

fn table_mut(pa: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *(memory::kva(pa) as *mut PageTable) }
}

/// Creates a fresh user PML4 inheriting every kernel mapping.
pub fn create_user_pml4() -> KernelResult<PhysAddr> {
    let pa = memory::alloc_kernel_frame().ok_or(KernelError::OutOfFrames)?;
    unsafe {
        core::ptr::copy_nonoverlapping(
            memory::kva(kernel_pml4()) as *const u64,
            memory::kva(pa) as *mut u64,
            512,
        );
    }
    Ok(pa)
}

/// Walks down to the PTE for `va`, allocating intermediate tables when
/// `create` is set. Returns `None` for an unmapped path without `create`.
fn walk(pml4: PhysAddr, va: u64, create: bool) -> Option<&'static mut x86_64::structures::paging::page_table::PageTableEntry> {
    let virt = VirtAddr::new(va);
    let indices = [
        usize::from(virt.p4_index()),
        usize::from(virt.p3_index()),
        usize::from(virt.p2_index()),
    ];
    let mut table = table_mut(pml4);
    for idx in indices {
        let entry = &mut table[idx];
        if entry.is_unused() {
            if !create {
                return None;
            }
            let frame = memory::alloc_kernel_frame()?;
            entry.set_addr(
                frame,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
        }
        assert!(
            !entry.flags().contains(PageTableFlags::HUGE_PAGE),
            "huge page in user walk at {:#x}",
            va
        );
        table = table_mut(entry.addr());
    }
    Some(&mut table[usize::from(virt.p1_index())])
}

fn flush_if_active(pml4: PhysAddr, va: u64) {
    if Cr3::read().0.start_address() == pml4 {
        x86_64::instructions::tlb::flush(VirtAddr::new(va));
    }
}

/// Installs `va → pa` in `pml4`. Fails if `va` is already mapped or an
/// intermediate table cannot be allocated.
pub fn map_user_page(pml4: PhysAddr, va: u64, pa: PhysAddr, writable: bool) -> KernelResult<()> {
    assert_eq!(va % PGSIZE, 0);
    let entry = walk(pml4, va, true).ok_or(KernelError::OutOfFrames)?;
    if !entry.is_unused() {
        return Err(KernelError::AlreadyMapped);
    }
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    entry.set_addr(pa, flags);
    flush_if_active(pml4, va);
    Ok(())
}

/// Removes the mapping for `va`; the backing frame is untouched.
pub fn clear_page(pml4: PhysAddr, va: u64) {
    if let Some(entry) = walk(pml4, va, false) {
        if !entry.is_unused() {
            entry.set_unused();
            flush_if_active(pml4, va);
        }
    }
}

pub fn translate(pml4: PhysAddr, va: u64) -> Option<PhysAddr> {
    let entry = walk(pml4, memory::page_down(va), false)?;
    if entry.flags().contains(PageTableFlags::PRESENT) {
        Some(entry.addr() + (va & memory::PGMASK))
    } else {
        None
    }
}

pub fn is_writable(pml4: PhysAddr, va: u64) -> bool {
    walk(pml4, memory::page_down(va), false).map_or(false, |e| {
        e.flags()
            .contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
    })
}

/// Reads and clears the hardware accessed bit. Returns the prior value.
pub fn test_and_clear_accessed(pml4: PhysAddr, va: u64) -> bool {
    match walk(pml4, va, false) {
        Some(entry) if entry.flags().contains(PageTableFlags::PRESENT) => {
            let accessed = entry.flags().contains(PageTableFlags::ACCESSED);
            if accessed {
                entry.set_flags(entry.flags() - PageTableFlags::ACCESSED);
                flush_if_active(pml4, va);
            }
            accessed
        }
        _ => false,
    }
}

pub fn is_dirty(pml4: PhysAddr, va: u64) -> bool {
    walk(pml4, va, false).map_or(false, |e| {
        e.flags()
            .contains(PageTableFlags::PRESENT | PageTableFlags::DIRTY)
    })
}

/// Marks the PTE dirty, as a store through the mapping would. The kernel
/// uses this when it modifies a page's contents on the owner's behalf.
pub fn set_dirty(pml4: PhysAddr, va: u64) {
    if let Some(entry) = walk(pml4, va, false) {
        if entry.flags().contains(PageTableFlags::PRESENT) {
            entry.set_flags(entry.flags() | PageTableFlags::DIRTY);
        }
    }
}

pub fn clear_dirty(pml4: PhysAddr, va: u64) {
    if let Some(entry) = walk(pml4, va, false) {
        if entry.flags().contains(PageTableFlags::PRESENT) {
            entry.set_flags(entry.flags() - PageTableFlags::DIRTY);
            flush_if_active(pml4, va);
        }
    }
}

/// Switches CR3. No-op if `pml4` is already active.
pub fn activate(pml4: PhysAddr) {
    let frame = PhysFrame::containing_address(pml4);
    if Cr3::read().0 != frame {
        unsafe { Cr3::write(frame, Cr3::read().1) };
    }
}

/// Frees the table frames covering user space plus the PML4 itself. Leaf
/// data frames must already have been released (the supplemental page table
/// owns those).
pub fn destroy_user_pml4(pml4: PhysAddr) {
    assert_ne!(pml4, kernel_pml4());
    assert_ne!(Cr3::read().0.start_address(), pml4, "cannot destroy the active pml4");

    let p4 = table_mut(pml4);
    let first = (USER_BASE >> 39) as usize & 0x1ff;
    let last = ((USER_STACK - 1) >> 39) as usize & 0x1ff;
    for p4e in p4.iter_mut().take(last + 1).skip(first) {
        if p4e.is_unused() {
            continue;
        }
        let p3 = table_mut(p4e.addr());
        for p3e in p3.iter_mut() {
            if p3e.is_unused() {
                continue;
            }
            let p2 = table_mut(p3e.addr());
            for p2e in p2.iter_mut() {
                if !p2e.is_unused() {
                    memory::free_kernel_frame(p2e.addr());
                }
            }
            memory::free_kernel_frame(p3e.addr());
        }
        memory::free_kernel_frame(p4e.addr());
        p4e.set_unused();
    }
    memory::free_kernel_frame(pml4);
}
