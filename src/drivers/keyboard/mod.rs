//! PS/2 keyboard. Scancodes arrive by IRQ, are decoded to bytes and queued;
//! readers block on a counting semaphore, one permit per byte.

pub mod scancodes;

use alloc::collections::VecDeque;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::threads::sync::Semaphore;
use scancodes::DecodeState;

const BUFFER_CAP: usize = 256;

struct InputQueue {
    bytes: VecDeque<u8>,
    decode: DecodeState,
}

lazy_static! {
    static ref QUEUE: Mutex<InputQueue> = Mutex::new(InputQueue {
        bytes: VecDeque::new(),
        decode: DecodeState::new(),
    });
    static ref AVAILABLE: Semaphore = Semaphore::new(0);
}

pub fn init() {
    // Drain any scancode the 8042 latched before our IRQ handler existed.
    let mut port: Port<u8> = Port::new(0x60);
    let _ = unsafe { port.read() };
    lazy_static::initialize(&QUEUE);
    lazy_static::initialize(&AVAILABLE);
    crate::log_info!("keyboard: PS/2 driver ready");
}

/// IRQ path: decode and enqueue. Interrupts are already off.
pub fn push_scancode(scancode: u8) {
    let queued = {
        let mut q = QUEUE.lock();
        match q.decode.advance(scancode) {
            Some(byte) if q.bytes.len() < BUFFER_CAP => {
                q.bytes.push_back(byte);
                true
            }
            _ => false,
        }
    };
    if queued {
        // Semaphore up is interrupt-safe; a blocked reader wakes on handler
        // return.
        AVAILABLE.up();
    }
}

/// Blocks until a byte of input is available.
pub fn read_byte() -> u8 {
    AVAILABLE.down();
    crate::intr::critical(|| {
        QUEUE
            .lock()
            .bytes
            .pop_front()
            .expect("keyboard semaphore out of sync with queue")
    })
}

/// Non-blocking read.
pub fn try_read_byte() -> Option<u8> {
    if !AVAILABLE.try_down() {
        return None;
    }
    crate::intr::critical(|| QUEUE.lock().bytes.pop_front())
}
