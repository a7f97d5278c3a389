//! Swap table over the dedicated swap disk.
//!
//! Slot `i` occupies the eight consecutive sectors starting at
//! `i * SECTORS_PER_PAGE`; its bitmap bit is set exactly while the slot
//! holds live page contents.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::drivers::ata::pio::SECTOR_SIZE;
use crate::drivers::ata::SWAP_DISK;
use crate::error::{KernelError, KernelResult};
use crate::intr;
use crate::memory::PGSIZE;

pub const SECTORS_PER_PAGE: usize = PGSIZE as usize / SECTOR_SIZE;

struct SwapTable {
    slots: Bitmap,
}

lazy_static! {
    static ref SWAP_TABLE: Mutex<Option<SwapTable>> = Mutex::new(None);
}

pub fn init() {
    let slot_count = {
        let disk = SWAP_DISK.lock();
        if disk.is_present() {
            disk.sector_count() as usize / SECTORS_PER_PAGE
        } else {
            0
        }
    };
    if slot_count == 0 {
        crate::log_warn!("swap: disabled (no swap disk)");
        return;
    }
    *SWAP_TABLE.lock() = Some(SwapTable {
        slots: Bitmap::new(slot_count),
    });
    crate::log_info!("swap: {} slots ({} KiB)", slot_count, slot_count * 4);
}

/// Claims a free slot. `OutOfSwap` when the disk is absent or full.
pub fn alloc_slot() -> KernelResult<usize> {
    intr::critical(|| {
        let mut table = SWAP_TABLE.lock();
        let table = table.as_mut().ok_or(KernelError::OutOfSwap)?;
        table.slots.scan_and_flip(0, 1, false).ok_or(KernelError::OutOfSwap)
    })
}

/// Releases a slot that no longer holds live data.
pub fn free_slot(slot: usize) {
    intr::critical(|| {
        let mut table = SWAP_TABLE.lock();
        let table = table.as_mut().expect("swap not initialized");
        assert!(table.slots.test(slot), "freeing a free swap slot");
        table.slots.reset(slot);
    })
}

#[cfg(test)]
pub fn slots_in_use() -> usize {
    intr::critical(|| {
        SWAP_TABLE
            .lock()
            .as_ref()
            .map_or(0, |t| t.slots.count(true))
    })
}

/// Writes one page into `slot`.
pub fn write_slot(slot: usize, bytes: &[u8]) -> KernelResult<()> {
    debug_assert_eq!(bytes.len(), PGSIZE as usize);
    debug_assert!(intr::critical(|| {
        SWAP_TABLE.lock().as_ref().map_or(false, |t| t.slots.test(slot))
    }));
    let disk = SWAP_DISK.lock();
    for i in 0..SECTORS_PER_PAGE {
        let sector: &[u8; SECTOR_SIZE] = bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
            .try_into()
            .unwrap();
        disk.write_sector((slot * SECTORS_PER_PAGE + i) as u32, sector)?;
    }
    Ok(())
}

/// Reads one page back from `slot`, which must hold live data.
pub fn read_slot(slot: usize, bytes: &mut [u8]) -> KernelResult<()> {
    debug_assert_eq!(bytes.len(), PGSIZE as usize);
    assert!(
        intr::critical(|| {
            SWAP_TABLE.lock().as_ref().map_or(false, |t| t.slots.test(slot))
        }),
        "reading an empty swap slot"
    );
    let disk = SWAP_DISK.lock();
    for i in 0..SECTORS_PER_PAGE {
        let sector: &mut [u8; SECTOR_SIZE] = (&mut bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
            .try_into()
            .unwrap();
        disk.read_sector((slot * SECTORS_PER_PAGE + i) as u32, sector)?;
    }
    Ok(())
}
