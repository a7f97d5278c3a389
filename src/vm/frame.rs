//! Global frame table and the clock evictor.
//!
//! Every frame lent to a user page is listed here with a pointer back to
//! the page descriptor it backs and the PML4 that maps it, which is all the
//! second-chance sweep needs: consult the hardware accessed bit through the
//! owner's page table, clear it on the first lap, evict on the second.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::PhysAddr;

use super::page::Page;
use crate::error::{KernelError, KernelResult};
use crate::intr;
use crate::memory::{self, paging};

struct Frame {
    pa: PhysAddr,
    page: *mut Page,
    pml4: PhysAddr,
}

// Raw page pointers are only dereferenced inside interrupts-off sections on
// this uniprocessor.
unsafe impl Send for Frame {}

struct FrameTable {
    frames: Vec<Frame>,
    hand: usize,
}

lazy_static! {
    static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable {
        frames: Vec::new(),
        hand: 0,
    });
}

pub fn init() {
    lazy_static::initialize(&FRAME_TABLE);
}

/// Number of frames currently lent out.
pub fn frames_in_use() -> usize {
    intr::critical(|| FRAME_TABLE.lock().frames.len())
}

/// Hands out a user-pool frame for `page`, evicting a victim when the pool
/// is dry. Must run inside a critical section (claiming is atomic against
/// other faults on this CPU).
pub fn alloc(page: *mut Page, pml4: PhysAddr) -> KernelResult<PhysAddr> {
    intr::assert_disabled();
    let mut table = FRAME_TABLE.lock();

    if let Some(pa) = memory::alloc_user_frame() {
        table.frames.push(Frame { pa, page, pml4 });
        return Ok(pa);
    }

    let len = table.frames.len();
    if len == 0 {
        return Err(KernelError::OutOfFrames);
    }

    // Clock sweep: one full clearing lap plus one picking lap bounds the
    // search; a third lap can only happen if every page was unevictable
    // (swap full), which we surface as exhaustion.
    let mut err = KernelError::OutOfFrames;
    for _ in 0..2 * len {
        let hand = table.hand;
        let (victim_ptr, victim_pml4, pa) = {
            let f = &table.frames[hand];
            (f.page, f.pml4, f.pa)
        };
        let victim = unsafe { &mut *victim_ptr };

        if paging::test_and_clear_accessed(victim_pml4, victim.va) {
            table.hand = (hand + 1) % len;
            continue;
        }

        match super::swap_out_page(victim, victim_pml4) {
            Ok(()) => {
                table.frames[hand] = Frame { pa, page, pml4 };
                table.hand = (hand + 1) % len;
                return Ok(pa);
            }
            Err(e) => {
                // Unevictable victim (e.g. swap full); try the next frame.
                err = e;
                table.hand = (hand + 1) % len;
            }
        }
    }
    Err(err)
}

/// Returns `pa` to the user pool and forgets its table entry.
pub fn free(pa: PhysAddr) {
    intr::critical(|| {
        let mut table = FRAME_TABLE.lock();
        let idx = table
            .frames
            .iter()
            .position(|f| f.pa == pa)
            .expect("freeing a frame the table does not know");
        table.frames.swap_remove(idx);
        if table.hand >= table.frames.len() {
            table.hand = 0;
        }
        memory::free_user_frame(pa);
    })
}
