//! ELF64 executable loading.
//!
//! Headers are parsed by hand (no in-kernel ELF crate); loadable segments
//! are *registered*, not read: each page goes into the supplemental page
//! table as UNINIT with a file-reading initializer, so the bytes come in on
//! first touch and can later be evicted to swap like any anonymous page.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::memory::{self, PGMASK, PGSIZE};
use crate::vm::page::{Page, PageFlags, PageInit, SegmentInit, TargetKind};
use crate::vm::spt::SupplementalPageTable;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

struct Segment {
    vaddr: u64,
    offset: usize,
    filesz: usize,
    memsz: usize,
    writable: bool,
}

/// A validated executable: entry point plus its loadable segments.
pub struct ElfImage {
    pub entry: u64,
    segments: Vec<Segment>,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().unwrap())
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

/// Reads and validates the headers of `file`.
pub fn parse(file: &File) -> KernelResult<ElfImage> {
    let mut ehdr = [0u8; EHDR_SIZE];
    if file.read_at(0, &mut ehdr) != EHDR_SIZE {
        return Err(KernelError::InvalidExecutable);
    }
    if ehdr[0..4] != ELF_MAGIC
        || ehdr[4] != ELFCLASS64
        || ehdr[5] != ELFDATA2LSB
        || u16_at(&ehdr, 16) != ET_EXEC
        || u16_at(&ehdr, 18) != EM_X86_64
    {
        return Err(KernelError::InvalidExecutable);
    }

    let entry = u64_at(&ehdr, 24);
    let phoff = u64_at(&ehdr, 32) as usize;
    let phentsize = u16_at(&ehdr, 54) as usize;
    let phnum = u16_at(&ehdr, 56) as usize;
    if phentsize < PHDR_SIZE || phnum == 0 || phnum > 128 {
        return Err(KernelError::InvalidExecutable);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let mut phdr = [0u8; PHDR_SIZE];
        if file.read_at(phoff + i * phentsize, &mut phdr) != PHDR_SIZE {
            return Err(KernelError::InvalidExecutable);
        }
        if u32_at(&phdr, 0) != PT_LOAD {
            continue;
        }
        let seg = Segment {
            vaddr: u64_at(&phdr, 16),
            offset: u64_at(&phdr, 8) as usize,
            filesz: u64_at(&phdr, 32) as usize,
            memsz: u64_at(&phdr, 40) as usize,
            writable: u32_at(&phdr, 4) & PF_W != 0,
        };
        if seg.memsz == 0 {
            continue;
        }
        if seg.filesz > seg.memsz {
            return Err(KernelError::InvalidExecutable);
        }
        // File offset and vaddr must be congruent modulo the page size.
        if (seg.offset as u64 & PGMASK) != (seg.vaddr & PGMASK) {
            return Err(KernelError::InvalidExecutable);
        }
        let start = memory::page_down(seg.vaddr);
        let end = seg
            .vaddr
            .checked_add(seg.memsz as u64)
            .ok_or(KernelError::InvalidExecutable)?;
        if !memory::is_user_vaddr(start) || !memory::is_user_vaddr(end - 1) {
            return Err(KernelError::InvalidExecutable);
        }
        segments.push(seg);
    }
    if segments.is_empty() || !memory::is_user_vaddr(entry) {
        return Err(KernelError::InvalidExecutable);
    }
    Ok(ElfImage { entry, segments })
}

/// Registers every loadable page of `image` in `spt` as a lazily-filled
/// anonymous page. Returns the entry point.
pub fn load(image: &ElfImage, file: &File, spt: &mut SupplementalPageTable) -> KernelResult<u64> {
    // One private reopen of the executable shared by all initializers, so
    // the image stays readable however the FD table changes.
    let image_file = Arc::new(file.reopen());

    for seg in &image.segments {
        let page_offset = seg.vaddr & PGMASK;
        let mut va = memory::page_down(seg.vaddr);
        let mut file_ofs = seg.offset - page_offset as usize;
        let mut read_left = if seg.filesz > 0 {
            seg.filesz + page_offset as usize
        } else {
            0
        };
        let mut mem_left = seg.memsz + page_offset as usize;

        while mem_left > 0 {
            let read_bytes = read_left.min(PGSIZE as usize);
            let page = Page::new_uninit(
                va,
                seg.writable,
                TargetKind::Anon,
                if read_bytes > 0 {
                    PageInit::FromFile(SegmentInit {
                        file: image_file.clone(),
                        offset: file_ofs,
                        read_bytes,
                        zero_bytes: PGSIZE as usize - read_bytes,
                    })
                } else {
                    PageInit::Zeros
                },
                PageFlags::empty(),
                None,
            );
            spt.insert(page)?;

            va += PGSIZE;
            file_ofs += PGSIZE as usize;
            read_left = read_left.saturating_sub(PGSIZE as usize);
            mem_left = mem_left.saturating_sub(PGSIZE as usize);
        }
    }
    Ok(image.entry)
}
