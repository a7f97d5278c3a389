//! Supplemental page table: per-thread map from page-aligned user virtual
//! address to page descriptor.
//!
//! Descriptors are boxed so the global frame table can hold stable pointers
//! back to them (the evictor needs `frame → page`).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use x86_64::PhysAddr;

use super::page::{Backing, Page, PageInit, SegmentInit};
use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::memory::{self, page_down};

pub struct SupplementalPageTable {
    pages: HashMap<u64, Box<Page>>,
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        SupplementalPageTable {
            pages: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn find(&self, va: u64) -> Option<&Page> {
        self.pages.get(&page_down(va)).map(|p| p.as_ref())
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut Page> {
        self.pages.get_mut(&page_down(va)).map(|p| p.as_mut())
    }

    /// Stable pointer to the descriptor; survives later map growth.
    pub fn find_ptr(&mut self, va: u64) -> Option<*mut Page> {
        self.pages
            .get_mut(&page_down(va))
            .map(|p| p.as_mut() as *mut Page)
    }

    /// Registers a descriptor. A duplicate mapping is an error, not a
    /// silent overwrite.
    pub fn insert(&mut self, page: Page) -> KernelResult<*mut Page> {
        let va = page.va;
        debug_assert_eq!(va % memory::PGSIZE, 0);
        if self.pages.contains_key(&va) {
            return Err(KernelError::AlreadyMapped);
        }
        let mut boxed = Box::new(page);
        let ptr = boxed.as_mut() as *mut Page;
        self.pages.insert(va, boxed);
        Ok(ptr)
    }

    /// Destroys and removes the descriptor at `va` (frees its frame, swap
    /// slot and mapping).
    pub fn remove(&mut self, va: u64, pml4: PhysAddr) {
        if let Some(mut page) = self.pages.remove(&page_down(va)) {
            super::destroy_page(&mut page, pml4);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values().map(|p| p.as_ref())
    }

    fn vas(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    /// Clones `parent`'s address space into `self` for fork.
    ///
    /// The parent thread is blocked on the fork rendezvous for the whole
    /// copy, so reading (and claiming swapped pages back into) its tables is
    /// race-free.
    pub fn copy_from(
        &mut self,
        parent: &mut SupplementalPageTable,
        parent_pml4: PhysAddr,
        child_pml4: PhysAddr,
    ) -> KernelResult<()> {
        // One reopen per mmap region in the child, shared by its pages.
        let mut region_files: BTreeMap<u64, Arc<File>> = BTreeMap::new();
        let mut dup_file = |region: Option<u64>, file: &Arc<File>| -> Arc<File> {
            match region {
                Some(r) => region_files
                    .entry(r)
                    .or_insert_with(|| Arc::new(file.reopen()))
                    .clone(),
                None => Arc::new(file.reopen()),
            }
        };

        for va in parent.vas() {
            let parent_page = parent.find_ptr(va).expect("page vanished during fork");
            let parent_page = unsafe { &mut *parent_page };

            if parent_page.is_stack() {
                // Fresh stack page, then copy the live bytes.
                super::ensure_resident(parent_page, parent_pml4)?;
                let child = self.insert(Page::new_stack(va))?;
                super::claim_page(unsafe { &mut *child }, child_pml4)?;
                unsafe { copy_frame(parent_page, &*child) };
                continue;
            }

            // Resident kinds are copied byte for byte, so bring evicted
            // parent pages back in before looking at their backing.
            if !matches!(parent_page.backing, Backing::Uninit { .. }) {
                super::ensure_resident(parent_page, parent_pml4)?;
            }

            let child_page = match &parent_page.backing {
                Backing::Uninit { target, init } => {
                    let init = match init {
                        PageInit::Zeros => PageInit::Zeros,
                        PageInit::FromFile(seg) => PageInit::FromFile(
                            seg.duplicate_with(dup_file(parent_page.region, &seg.file)),
                        ),
                    };
                    // Never faulted in the parent; stays lazy in the child.
                    self.insert(Page::new_uninit(
                        va,
                        parent_page.writable,
                        *target,
                        init,
                        parent_page.flags,
                        parent_page.region,
                    ))?;
                    continue;
                }
                Backing::Anon { .. } => Page::new_uninit(
                    va,
                    parent_page.writable,
                    super::page::TargetKind::Anon,
                    PageInit::Zeros,
                    parent_page.flags,
                    None,
                ),
                Backing::File(fp) => Page {
                    va,
                    writable: parent_page.writable,
                    flags: parent_page.flags,
                    frame: None,
                    backing: Backing::Uninit {
                        target: super::page::TargetKind::File,
                        init: PageInit::FromFile(SegmentInit {
                            file: dup_file(parent_page.region, &fp.file),
                            offset: fp.offset,
                            read_bytes: fp.read_bytes,
                            zero_bytes: memory::PGSIZE as usize - fp.read_bytes,
                        }),
                    },
                    region: parent_page.region,
                },
            };
            let child = self.insert(child_page)?;
            super::claim_page(unsafe { &mut *child }, child_pml4)?;
            unsafe { copy_frame(parent_page, &*child) };
        }
        Ok(())
    }

    /// Tears the table down on process exit: mmap regions are unmapped
    /// (writing dirty pages back) and every remaining page is destroyed.
    pub fn kill(&mut self, pml4: PhysAddr) {
        let heads: Vec<u64> = self
            .iter()
            .filter(|p| p.is_mmap_head())
            .map(|p| p.va)
            .collect();
        for head in heads {
            // A head may already be gone if an earlier unmap removed it.
            if self.find(head).is_some() {
                super::file_map::munmap_region(self, pml4, head);
            }
        }
        for va in self.vas() {
            self.remove(va, pml4);
        }
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        SupplementalPageTable::new()
    }
}

/// Copies the resident frame of `src` into the resident frame of `dst`.
unsafe fn copy_frame(src: &Page, dst: &Page) {
    let src_pa = src.frame.expect("source page not resident");
    let dst_pa = dst.frame.expect("destination page not resident");
    core::ptr::copy_nonoverlapping(
        memory::kva(src_pa),
        memory::kva(dst_pa),
        memory::PGSIZE as usize,
    );
}
