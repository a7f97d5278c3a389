//! ATA channels. The swap disk hangs off the secondary channel as the
//! slave device (channel 1, unit 1); QEMU exposes it with `-drive
//! index=3,...` or an `-hdd` image.

pub mod pio;

use lazy_static::lazy_static;
use spin::Mutex;

use pio::AtaDevice;

lazy_static! {
    /// Secondary channel, slave: the swap disk.
    pub static ref SWAP_DISK: Mutex<AtaDevice> = Mutex::new(AtaDevice::new(0x170, 0x376, false));
}

pub fn init() {
    let mut disk = SWAP_DISK.lock();
    match disk.identify() {
        Ok(()) => crate::log_info!(
            "ata: swap disk (1,1) present, {} sectors ({} KiB)",
            disk.sector_count(),
            disk.sector_count() / 2
        ),
        Err(e) => crate::log_warn!("ata: no swap disk at (1,1): {}", e),
    }
}
