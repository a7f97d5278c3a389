//! Demand-paged virtual memory.
//!
//! The page-fault dispatcher routes a faulting user address either to an
//! existing page descriptor (claim: materialize a frame, run the lazy
//! initializer) or to stack growth, and reports anything else as unhandled
//! so the process can be terminated.

pub mod anon;
pub mod file_map;
pub mod frame;
pub mod page;
pub mod spt;

#[cfg(test)]
mod tests;

use x86_64::PhysAddr;

use crate::error::{KernelError, KernelResult};
use crate::intr;
use crate::memory::{self, paging, page_down, PGSIZE, USER_STACK, USER_STACK_LIMIT};
use crate::threads;
use page::{Backing, Page, PageInit, TargetKind};
use spt::SupplementalPageTable;

pub fn init() {
    frame::init();
    anon::init();
}

/// Materializes `page` into a fresh frame: populate, then map. No-op when
/// already resident.
pub fn claim_page(page: &mut Page, pml4: PhysAddr) -> KernelResult<()> {
    intr::critical(|| {
        if page.is_resident() {
            return Ok(());
        }
        let pa = frame::alloc(page as *mut Page, pml4)?;
        let bytes =
            unsafe { core::slice::from_raw_parts_mut(memory::kva(pa), PGSIZE as usize) };

        let mut populate = || -> KernelResult<()> {
            match &mut page.backing {
                Backing::Uninit { target, init } => {
                    match init {
                        PageInit::Zeros => bytes.fill(0),
                        PageInit::FromFile(seg) => {
                            if !seg.run(bytes) {
                                return Err(KernelError::FaultUnhandled);
                            }
                        }
                    }
                    // Morph into the target kind; the initializer payload is
                    // consumed (file pages keep it for write-back).
                    let target = *target;
                    let old = core::mem::replace(
                        &mut page.backing,
                        Backing::Anon { swap_slot: None },
                    );
                    if target == TargetKind::File {
                        if let Backing::Uninit {
                            init: PageInit::FromFile(seg),
                            ..
                        } = old
                        {
                            page.backing = Backing::File(page::FilePage {
                                file: seg.file,
                                offset: seg.offset,
                                read_bytes: seg.read_bytes,
                            });
                        }
                    }
                    Ok(())
                }
                Backing::Anon { swap_slot } => {
                    let slot = swap_slot.expect("non-resident anon page without a swap slot");
                    anon::read_slot(slot, bytes)?;
                    anon::free_slot(slot);
                    *swap_slot = None;
                    Ok(())
                }
                Backing::File(fp) => {
                    let n = fp.file.read_at(fp.offset, &mut bytes[..fp.read_bytes]);
                    if n != fp.read_bytes {
                        return Err(KernelError::FaultUnhandled);
                    }
                    bytes[fp.read_bytes..].fill(0);
                    Ok(())
                }
            }
        };

        if let Err(e) = populate() {
            frame::free(pa);
            return Err(e);
        }
        if let Err(e) = paging::map_user_page(pml4, page.va, pa, page.writable) {
            frame::free(pa);
            return Err(e);
        }
        page.frame = Some(pa);
        Ok(())
    })
}

/// Claims `page` back in if it was evicted (fork copies need live bytes).
pub fn ensure_resident(page: &mut Page, pml4: PhysAddr) -> KernelResult<()> {
    claim_page(page, pml4)
}

/// Eviction: persists the victim's contents and severs its mapping. The
/// caller owns the freed frame afterwards.
pub(crate) fn swap_out_page(page: &mut Page, pml4: PhysAddr) -> KernelResult<()> {
    let pa = page.frame.expect("evicting a non-resident page");
    let bytes = unsafe { core::slice::from_raw_parts(memory::kva(pa), PGSIZE as usize) };

    match &mut page.backing {
        Backing::Anon { swap_slot } => {
            let slot = anon::alloc_slot()?;
            if let Err(e) = anon::write_slot(slot, bytes) {
                anon::free_slot(slot);
                return Err(e);
            }
            *swap_slot = Some(slot);
        }
        Backing::File(fp) => {
            if paging::is_dirty(pml4, page.va) {
                fp.file.write_at(fp.offset, &bytes[..fp.read_bytes]);
                paging::clear_dirty(pml4, page.va);
            }
        }
        Backing::Uninit { .. } => unreachable!("uninit pages are never resident"),
    }

    paging::clear_page(pml4, page.va);
    page.frame = None;
    Ok(())
}

/// Releases everything a page owns: dirty write-back, frame, swap slot,
/// hardware mapping. Called on SPT removal and process teardown.
pub(crate) fn destroy_page(page: &mut Page, pml4: PhysAddr) {
    if let Some(pa) = page.frame {
        if let Backing::File(fp) = &page.backing {
            if paging::is_dirty(pml4, page.va) {
                let bytes =
                    unsafe { core::slice::from_raw_parts(memory::kva(pa), PGSIZE as usize) };
                fp.file.write_at(fp.offset, &bytes[..fp.read_bytes]);
            }
        }
        paging::clear_page(pml4, page.va);
        frame::free(pa);
        page.frame = None;
    }
    if let Backing::Anon {
        swap_slot: Some(slot),
    } = page.backing
    {
        anon::free_slot(slot);
    }
}

/// Creates and immediately claims the initial user stack page. Returns the
/// new stack bottom.
pub fn setup_stack(spt: &mut SupplementalPageTable, pml4: PhysAddr) -> KernelResult<u64> {
    let va = USER_STACK - PGSIZE;
    let ptr = spt.insert(Page::new_stack(va))?;
    claim_page(unsafe { &mut *ptr }, pml4)?;
    Ok(va)
}

/// Page-fault dispatcher. Returns whether the fault was resolved; an
/// unresolved user fault terminates the process (the interrupt handler does
/// that part).
pub fn try_handle_fault(
    fault_addr: u64,
    not_present: bool,
    user: bool,
    _write: bool,
    frame_rsp: u64,
) -> bool {
    // User code touching kernel space is always fatal.
    if user && memory::is_kernel_vaddr(fault_addr) {
        return false;
    }
    // Protection violations (e.g. writes through read-only mappings) have
    // no lazy path.
    if !not_present {
        return false;
    }
    let process = match threads::current_process_ptr() {
        Some(p) => unsafe { &mut *p },
        None => return false,
    };
    let pml4 = match threads::current_pml4() {
        Some(p) => p,
        None => return false,
    };

    if let Some(ptr) = process.spt.find_ptr(fault_addr) {
        return claim_page(unsafe { &mut *ptr }, pml4).is_ok();
    }

    // Plausible stack access: within 8 bytes below the stack pointer (PUSH
    // faults before moving RSP) and inside the 1 MiB growth window.
    let rsp = if memory::is_user_vaddr(frame_rsp) {
        frame_rsp
    } else {
        // Fault taken in kernel mode during a syscall; use the user RSP
        // captured at entry.
        process.user_rsp
    };
    let plausible = (USER_STACK_LIMIT..USER_STACK).contains(&fault_addr)
        && rsp.wrapping_sub(8) <= fault_addr;
    if plausible && process.stack_bottom > USER_STACK_LIMIT {
        let new_bottom = process.stack_bottom - PGSIZE;
        let grown = process
            .spt
            .insert(Page::new_stack(new_bottom))
            .and_then(|ptr| claim_page(unsafe { &mut *ptr }, pml4));
        match grown {
            Ok(()) => {
                process.stack_bottom = new_bottom;
                // The faulting access retries; it either hits the new page
                // or faults again and grows further.
                return true;
            }
            Err(_) => return false,
        }
    }

    false
}

/// `find`-style helper for the syscall layer: does the current process have
/// a page (resident or lazy) covering `va`, and is it writable if needed?
pub fn user_page_exists(process: &SupplementalPageTable, va: u64, need_write: bool) -> bool {
    match process.find(page_down(va)) {
        Some(p) => !need_write || p.writable,
        None => false,
    }
}
