//! Kernel heap.
//!
//! A fixed identity-mapped region handed to `linked_list_allocator` at boot.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// # Safety
/// `start..start + size` must be identity-mapped RAM owned by nobody else.
pub unsafe fn init(start: usize, size: usize) {
    ALLOCATOR.lock().init(start as *mut u8, size);
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
