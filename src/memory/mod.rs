//! Physical memory layout and frame pools.
//!
//! The boot stub identity-maps the first gigabyte, so for any physical frame
//! the kernel can reach its bytes at the same numeric virtual address (the
//! "kva"). Usable RAM above the kernel image is carved into three pieces at
//! boot: a fixed-size kernel heap, a kernel pool (page tables, thread
//! stacks come from the heap, but page-table frames come from here) and a
//! user pool that backs user pages and is the only pool eviction applies to.

pub mod frame_allocator;
pub mod paging;

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};
use spin::Mutex;
use x86_64::PhysAddr;

use frame_allocator::FramePool;

pub const PGSIZE: u64 = 4096;
pub const PGMASK: u64 = PGSIZE - 1;

/// End of the identity-mapped window set up by the boot stub.
pub const IDENTITY_LIMIT: u64 = 1 << 30;

/// Pools and heap are carved out at or above this physical address, leaving
/// the kernel image and boot structures alone.
const LAYOUT_BASE: u64 = 16 * 1024 * 1024;

const HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// User space occupies a window far above the identity map; everything else
/// is kernel virtual space.
pub const USER_BASE: u64 = 0x4000_0000_0000;
/// Top of the user stack, exclusive upper bound of user space.
pub const USER_STACK: u64 = 0x4800_0000_0000;
/// The stack may grow down at most 1 MiB below `USER_STACK`.
pub const USER_STACK_LIMIT: u64 = USER_STACK - (1 << 20);

pub const fn page_down(va: u64) -> u64 {
    va & !PGMASK
}

pub const fn page_up(va: u64) -> u64 {
    (va + PGMASK) & !PGMASK
}

pub fn is_user_vaddr(va: u64) -> bool {
    (USER_BASE..USER_STACK).contains(&va)
}

pub fn is_kernel_vaddr(va: u64) -> bool {
    !is_user_vaddr(va)
}

/// Kernel virtual address of a physical address (identity window).
pub fn kva(pa: PhysAddr) -> *mut u8 {
    debug_assert!(pa.as_u64() < IDENTITY_LIMIT);
    pa.as_u64() as *mut u8
}

pub fn kva_to_phys(p: *const u8) -> PhysAddr {
    let addr = p as u64;
    debug_assert!(addr < IDENTITY_LIMIT);
    PhysAddr::new(addr)
}

pub static KERNEL_POOL: Mutex<Option<FramePool>> = Mutex::new(None);
pub static USER_POOL: Mutex<Option<FramePool>> = Mutex::new(None);

/// Parses the Multiboot2 info, initializes the heap and both frame pools,
/// and returns the kernel command line (copied onto the fresh heap).
pub fn init(multiboot_info: usize) -> alloc::string::String {
    let boot_info = unsafe {
        BootInformation::load(multiboot_info as *const BootInformationHeader)
            .expect("invalid multiboot2 information")
    };
    let memory_map = boot_info
        .memory_map_tag()
        .expect("multiboot2 memory map required");

    // Largest usable area that reaches above LAYOUT_BASE, clamped to the
    // identity window.
    let mut region: Option<(u64, u64)> = None;
    for area in memory_map.memory_areas() {
        if area.typ() != MemoryAreaType::Available {
            continue;
        }
        let start = area.start_address().max(LAYOUT_BASE);
        let end = area.end_address().min(IDENTITY_LIMIT);
        if end <= start {
            continue;
        }
        if region.map_or(true, |(s, e)| end - start > e - s) {
            region = Some((start, end));
        }
    }
    let (start, end) = region.expect("no usable memory above 16 MiB");
    let start = page_up(start);
    let end = page_down(end);
    assert!(end - start > HEAP_SIZE + 64 * PGSIZE, "not enough memory");

    unsafe { crate::allocator::init(start as usize, HEAP_SIZE as usize) };

    // Halve the rest between the kernel and user pools, as the original
    // system does.
    let pool_base = start + HEAP_SIZE;
    let pool_pages = (end - pool_base) / PGSIZE;
    let kernel_pages = pool_pages / 2;
    let user_pages = pool_pages - kernel_pages;

    *KERNEL_POOL.lock() = Some(FramePool::new(
        "kernel pool",
        PhysAddr::new(pool_base),
        kernel_pages as usize,
    ));
    *USER_POOL.lock() = Some(FramePool::new(
        "user pool",
        PhysAddr::new(pool_base + kernel_pages * PGSIZE),
        user_pages as usize,
    ));

    crate::log_info!(
        "memory: heap {} KiB at {:#x}, kernel pool {} pages, user pool {} pages",
        HEAP_SIZE / 1024,
        start,
        kernel_pages,
        user_pages
    );

    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");
    alloc::string::String::from(cmdline)
}

fn pool_alloc(pool: &Mutex<Option<FramePool>>) -> Option<PhysAddr> {
    crate::intr::critical(|| pool.lock().as_mut()?.alloc())
}

fn pool_free(pool: &Mutex<Option<FramePool>>, pa: PhysAddr) {
    crate::intr::critical(|| {
        pool.lock()
            .as_mut()
            .expect("frame pools not initialized")
            .free(pa)
    })
}

/// A zeroed frame from the kernel pool (page tables and the like).
pub fn alloc_kernel_frame() -> Option<PhysAddr> {
    let pa = pool_alloc(&KERNEL_POOL)?;
    unsafe { core::ptr::write_bytes(kva(pa), 0, PGSIZE as usize) };
    Some(pa)
}

pub fn free_kernel_frame(pa: PhysAddr) {
    pool_free(&KERNEL_POOL, pa);
}

/// A frame from the user pool; `None` means the pool is exhausted and the
/// caller should evict.
pub fn alloc_user_frame() -> Option<PhysAddr> {
    pool_alloc(&USER_POOL)
}

pub fn free_user_frame(pa: PhysAddr) {
    pool_free(&USER_POOL, pa);
}

/// Seeds the flat filesystem with any Multiboot2 modules. Called after the
/// filesystem is up; module memory lies outside the managed pools.
pub fn load_boot_modules(multiboot_info: usize) {
    let boot_info = unsafe {
        BootInformation::load(multiboot_info as *const BootInformationHeader)
            .expect("invalid multiboot2 information")
    };
    for module in boot_info.module_tags() {
        let name = module.cmdline().unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let bytes = unsafe {
            core::slice::from_raw_parts(
                module.start_address() as *const u8,
                (module.end_address() - module.start_address()) as usize,
            )
        };
        crate::fs::install(name, bytes);
        crate::log_info!("fs: installed boot module '{}' ({} bytes)", name, bytes.len());
    }
}
