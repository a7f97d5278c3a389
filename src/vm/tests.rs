//! VM tests: SPT bookkeeping, claim/evict round trips through swap, and
//! mmap write-back. These drive the paging machinery directly against a
//! scratch address space instead of taking real user faults.

use alloc::vec;
use alloc::vec::Vec;

use crate::fs;
use crate::memory::{self, paging, PGSIZE, USER_BASE};
use crate::vm::page::{Page, PageInit, TargetKind};
use crate::vm::spt::SupplementalPageTable;
use crate::vm::{anon, claim_page, file_map, swap_out_page};

fn scratch_space() -> (SupplementalPageTable, x86_64::PhysAddr) {
    let pml4 = paging::create_user_pml4().expect("pml4 for test");
    (SupplementalPageTable::new(), pml4)
}

fn teardown(mut spt: SupplementalPageTable, pml4: x86_64::PhysAddr) {
    spt.kill(pml4);
    paging::destroy_user_pml4(pml4);
}

fn anon_page(va: u64) -> Page {
    Page::new_uninit(
        va,
        true,
        TargetKind::Anon,
        PageInit::Zeros,
        super::page::PageFlags::empty(),
        None,
    )
}

#[test_case]
fn spt_insert_find_remove() {
    let (mut spt, pml4) = scratch_space();
    let va = USER_BASE + 0x10_0000;

    assert!(spt.find(va).is_none());
    spt.insert(anon_page(va)).expect("first insert");
    assert!(spt.insert(anon_page(va)).is_err(), "duplicate insert must fail");

    // find masks the offset bits.
    assert!(spt.find(va + 123).is_some());
    assert_eq!(spt.find(va).unwrap().va, va);

    spt.remove(va, pml4);
    assert!(spt.find(va).is_none());
    teardown(spt, pml4);
}

#[test_case]
fn claim_installs_mapping_and_zeroes() {
    let (mut spt, pml4) = scratch_space();
    let va = USER_BASE + 0x20_0000;
    let ptr = spt.insert(anon_page(va)).unwrap();
    let page = unsafe { &mut *ptr };

    assert!(paging::translate(pml4, va).is_none());
    claim_page(page, pml4).expect("claim");
    // frame ≠ ∅ ⇔ PTE present.
    assert!(page.is_resident());
    let pa = paging::translate(pml4, va).expect("PTE must be present after claim");
    assert_eq!(Some(memory::page_down(pa.as_u64())), page.frame.map(|f| f.as_u64()));

    let bytes = unsafe { core::slice::from_raw_parts(memory::kva(page.frame.unwrap()), 16) };
    assert!(bytes.iter().all(|&b| b == 0), "fresh anon pages are zeroed");

    teardown(spt, pml4);
}

#[test_case]
fn swap_round_trip_preserves_bytes() {
    if anon::alloc_slot().map(anon::free_slot).is_err() {
        crate::log_warn!("skipping swap test: no swap disk");
        return;
    }
    let (mut spt, pml4) = scratch_space();
    let va = USER_BASE + 0x30_0000;
    let ptr = spt.insert(anon_page(va)).unwrap();
    let page = unsafe { &mut *ptr };
    claim_page(page, pml4).expect("claim");

    // Write a recognizable pattern through the kernel window.
    let pa = page.frame.unwrap();
    let bytes =
        unsafe { core::slice::from_raw_parts_mut(memory::kva(pa), PGSIZE as usize) };
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (i * 7 + 3) as u8;
    }

    let slots_before = anon::slots_in_use();
    crate::intr::critical(|| swap_out_page(page, pml4)).expect("evict");
    assert!(!page.is_resident());
    assert!(paging::translate(pml4, va).is_none(), "eviction must clear the PTE");
    assert_eq!(anon::slots_in_use(), slots_before + 1, "slot held while swapped");

    claim_page(page, pml4).expect("fault back in");
    assert_eq!(anon::slots_in_use(), slots_before, "slot released on swap-in");
    let pa = page.frame.unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(memory::kva(pa), PGSIZE as usize) };
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(b, (i * 7 + 3) as u8, "byte {} corrupted by swap", i);
    }

    teardown(spt, pml4);
}

#[test_case]
fn mmap_rejects_bad_arguments() {
    let (mut spt, pml4) = scratch_space();
    fs::create("mmap-args", 100);
    let file = fs::open("mmap-args").unwrap();
    let va = USER_BASE + 0x40_0000;

    assert!(file_map::do_mmap(&mut spt, va + 1, 100, true, &file, 0).is_err());
    assert!(file_map::do_mmap(&mut spt, va, 0, true, &file, 0).is_err());
    assert!(file_map::do_mmap(&mut spt, va, 100, true, &file, 4096 * 2).is_err());
    assert!(file_map::do_mmap(&mut spt, 0, 100, true, &file, 0).is_err());

    // Overlap with an existing page.
    spt.insert(anon_page(va)).unwrap();
    assert!(file_map::do_mmap(&mut spt, va, PGSIZE as usize * 2, true, &file, 0).is_err());

    fs::remove("mmap-args");
    teardown(spt, pml4);
}

#[test_case]
fn munmap_without_writes_leaves_file_unchanged() {
    let (mut spt, pml4) = scratch_space();
    let len = PGSIZE as usize + 100;
    fs::create("mmap-clean", len);
    let original: Vec<u8> = {
        let f = fs::open("mmap-clean").unwrap();
        let mut data = vec![0u8; len];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        f.write_at(0, &data);
        data
    };

    let va = USER_BASE + 0x50_0000;
    let file = fs::open("mmap-clean").unwrap();
    file_map::do_mmap(&mut spt, va, len, true, &file, 0).expect("mmap");
    for off in [0u64, PGSIZE] {
        let ptr = spt.find_ptr(va + off).expect("mapped page");
        claim_page(unsafe { &mut *ptr }, pml4).expect("claim");
    }
    file_map::do_munmap(&mut spt, pml4, va).expect("munmap");

    let f = fs::open("mmap-clean").unwrap();
    assert_eq!(f.len(), len, "length must not change");
    let mut after = vec![0u8; len];
    f.read_at(0, &mut after);
    assert_eq!(after, original, "clean unmap must not dirty the file");
    fs::remove("mmap-clean");
    teardown(spt, pml4);
}

#[test_case]
fn munmap_writes_dirty_pages_back() {
    let (mut spt, pml4) = scratch_space();
    let len = 2 * PGSIZE as usize;
    fs::create("mmap-dirty", len);

    let va = USER_BASE + 0x60_0000;
    let file = fs::open("mmap-dirty").unwrap();
    file_map::do_mmap(&mut spt, va, len, true, &file, 0).expect("mmap");

    // Touch the first byte of every page the way user stores would: modify
    // the frame and raise the hardware dirty bit.
    for page_idx in 0..2u64 {
        let page_va = va + page_idx * PGSIZE;
        let ptr = spt.find_ptr(page_va).expect("mapped page");
        let page = unsafe { &mut *ptr };
        claim_page(page, pml4).expect("claim");
        let pa = page.frame.unwrap();
        unsafe { *memory::kva(pa) = 0xA0 + page_idx as u8 };
        paging::set_dirty(pml4, page_va);
    }
    file_map::do_munmap(&mut spt, pml4, va).expect("munmap");

    let f = fs::open("mmap-dirty").unwrap();
    assert_eq!(f.len(), len, "write-back must not grow the file");
    let mut buf = [0u8; 1];
    f.read_at(0, &mut buf);
    assert_eq!(buf[0], 0xA0);
    f.read_at(PGSIZE as usize, &mut buf);
    assert_eq!(buf[0], 0xA1);
    fs::remove("mmap-dirty");
    teardown(spt, pml4);
}

#[test_case]
fn mmap_trailing_bytes_are_zero_filled() {
    let (mut spt, pml4) = scratch_space();
    fs::create("mmap-tail", 10);
    let file = fs::open("mmap-tail").unwrap();
    file.write_at(0, b"0123456789");

    let va = USER_BASE + 0x70_0000;
    file_map::do_mmap(&mut spt, va, 10, true, &file, 0).expect("mmap");
    let ptr = spt.find_ptr(va).unwrap();
    let page = unsafe { &mut *ptr };
    claim_page(page, pml4).expect("claim");

    let bytes = unsafe {
        core::slice::from_raw_parts(memory::kva(page.frame.unwrap()), PGSIZE as usize)
    };
    assert_eq!(&bytes[..10], b"0123456789");
    assert!(bytes[10..].iter().all(|&b| b == 0));

    file_map::do_munmap(&mut spt, pml4, va).expect("munmap");
    fs::remove("mmap-tail");
    teardown(spt, pml4);
}
