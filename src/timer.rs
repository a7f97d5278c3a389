//! System timer: 8253 PIT channel 0 at 100 Hz, the monotonic tick counter,
//! and the timed-sleep service.

use core::sync::atomic::{AtomicI64, Ordering};

use x86_64::instructions::port::Port;

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

const PIT_INPUT_HZ: u32 = 1_193_182;

static TICKS: AtomicI64 = AtomicI64::new(0);

/// Programs PIT channel 0 for rate generation at `TIMER_FREQ`.
pub fn init() {
    let divisor = (PIT_INPUT_HZ / TIMER_FREQ as u32) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);
    unsafe {
        // Channel 0, lobyte/hibyte access, mode 2 (rate generator).
        command.write(0x34);
        channel0.write(divisor as u8);
        channel0.write((divisor >> 8) as u8);
    }
    crate::log_info!("timer: PIT at {} Hz", TIMER_FREQ);
}

/// Ticks since boot.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::Relaxed)
}

/// Ticks elapsed since `then`.
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Suspends the calling thread for at least `duration` ticks. Returns
/// immediately for non-positive durations.
pub fn sleep(duration: i64) {
    if duration <= 0 {
        return;
    }
    let wakeup = ticks() + duration;
    crate::threads::sleep_current(wakeup);
}

/// The timer interrupt body. Runs with interrupts off in handler context.
pub fn on_interrupt() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    crate::threads::on_tick(now);
}

/// Busy-waits until `ticks()` passes `target`; yields the CPU between polls.
/// Handy for tests that must outlast a deadline without sleeping through it.
pub fn spin_until(target: i64) {
    while ticks() < target {
        crate::threads::yield_now();
    }
}
