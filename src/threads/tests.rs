//! Scheduler scenario tests: preemption order, donation chains, semaphore
//! wakeup order, timed sleep, MLFQ load tracking.
//!
//! Shared state is touched only inside `intr::critical` so a preempted
//! low-priority thread can never wedge a spinlock against a higher one.

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::intr;
use crate::threads::sync::{Condvar, Lock, Semaphore};
use crate::threads::thread::{PRI_DEFAULT, PRI_MAX, PRI_MIN};
use crate::threads::{self};
use crate::timer;

lazy_static! {
    static ref ORDER: Mutex<Vec<u64>> = Mutex::new(Vec::new());
    static ref DONE: Semaphore = Semaphore::new(0);
}

fn order_reset() {
    intr::critical(|| ORDER.lock().clear());
}

fn order_push(tag: u64) {
    intr::critical(|| ORDER.lock().push(tag));
}

fn order_snapshot() -> Vec<u64> {
    intr::critical(|| ORDER.lock().clone())
}

fn record_and_finish(tag: u64) {
    order_push(tag);
    DONE.up();
}

// ── Priority scheduling ─────────────────────────────────────

fn run_at_priority(arg: u64) {
    record_and_finish(arg);
}

#[test_case]
fn priority_preemption_order() {
    if threads::mlfqs_enabled() {
        return; // fixed priorities are advisory under MLFQ
    }
    order_reset();
    let old = threads::get_priority();

    // Spawn behind a high fence so nobody runs early, then drop the fence.
    threads::set_priority(PRI_MAX);
    for pri in [30u64, 31, 32] {
        threads::spawn("pri-test", pri as i32, run_at_priority, pri).unwrap();
    }
    threads::set_priority(PRI_MIN);
    for _ in 0..3 {
        DONE.down();
    }

    assert_eq!(order_snapshot(), [32, 31, 30], "highest priority must run first");
    threads::set_priority(old);
}

#[test_case]
fn yield_round_robins_equals() {
    if threads::mlfqs_enabled() {
        return;
    }
    order_reset();
    for tag in [1u64, 2, 3] {
        threads::spawn("rr-test", PRI_DEFAULT, run_at_priority, tag).unwrap();
    }
    // Equal priority: spawned threads wait until we yield, then run FIFO.
    threads::yield_now();
    for _ in 0..3 {
        DONE.down();
    }
    assert_eq!(order_snapshot(), [1, 2, 3]);
}

// ── Priority donation ───────────────────────────────────────

lazy_static! {
    static ref LOCK_A: Lock = Lock::new();
    static ref LOCK_B: Lock = Lock::new();
}

const TAG_MID_ACQUIRED_A: u64 = 20;
const TAG_HIGH_DONE: u64 = 30;
const TAG_MID_DONE: u64 = 21;

fn donation_mid(_: u64) {
    LOCK_B.acquire();
    LOCK_A.acquire(); // blocks; donates through B's waiters later
    order_push(TAG_MID_ACQUIRED_A);
    assert_eq!(
        threads::get_priority(),
        30,
        "mid must still carry high's donation while holding B"
    );
    LOCK_A.release();
    LOCK_B.release();
    assert_eq!(threads::get_priority(), 20, "donation must end with release");
    record_and_finish(TAG_MID_DONE);
}

fn donation_high(_: u64) {
    LOCK_B.acquire(); // blocks behind mid; donates 30 down the chain
    LOCK_B.release();
    record_and_finish(TAG_HIGH_DONE);
}

#[test_case]
fn donation_chain() {
    if threads::mlfqs_enabled() {
        return;
    }
    order_reset();
    let old = threads::get_priority();
    threads::set_priority(10);

    LOCK_A.acquire();
    assert_eq!(threads::get_priority(), 10);

    // Mid (20) runs immediately: takes B, blocks on A, donates 20 to us.
    threads::spawn("don-mid", 20, donation_mid, 0).unwrap();
    assert_eq!(threads::get_priority(), 20, "mid donates through A");

    // High (30) runs immediately: blocks on B; 30 flows B→mid→A→us.
    threads::spawn("don-high", 30, donation_high, 0).unwrap();
    assert_eq!(threads::get_priority(), 30, "chain donation reaches the root");

    // Releasing A hands the CPU to mid (effective 30), which finishes the
    // chain; high completes before mid drops back to 20.
    LOCK_A.release();
    for _ in 0..2 {
        DONE.down();
    }
    assert_eq!(
        threads::get_priority(),
        10,
        "all donations must drain after release"
    );
    assert_eq!(
        order_snapshot(),
        [TAG_MID_ACQUIRED_A, TAG_HIGH_DONE, TAG_MID_DONE],
        "release order: mid gets A at 30, high finishes, then mid"
    );

    threads::set_priority(old);
}

#[test_case]
fn lock_try_acquire() {
    let lock = Arc::new(Lock::new());
    assert!(lock.try_acquire());
    assert!(lock.held_by_current());
    lock.release();
    assert!(!lock.held_by_current());
}

// ── Semaphores ──────────────────────────────────────────────

lazy_static! {
    static ref GATE: Semaphore = Semaphore::new(0);
}

fn gate_waiter(tag: u64) {
    GATE.down();
    record_and_finish(tag);
}

#[test_case]
fn semaphore_wakes_highest_priority_first() {
    if threads::mlfqs_enabled() {
        return;
    }
    order_reset();
    let old = threads::get_priority();
    threads::set_priority(5);

    // Each spawn preempts us, runs to its down() and blocks.
    threads::spawn("sema-10", 10, gate_waiter, 10).unwrap();
    threads::spawn("sema-30", 30, gate_waiter, 30).unwrap();
    threads::spawn("sema-20", 20, gate_waiter, 20).unwrap();

    for _ in 0..3 {
        GATE.up();
    }
    for _ in 0..3 {
        DONE.down();
    }
    assert_eq!(order_snapshot(), [30, 20, 10]);
    threads::set_priority(old);
}

#[test_case]
fn semaphore_counts() {
    let sema = Semaphore::new(2);
    assert!(sema.try_down());
    assert!(sema.try_down());
    assert!(!sema.try_down());
    sema.up();
    assert_eq!(sema.value(), 1);
    assert!(sema.try_down());
}

// ── Condition variables ─────────────────────────────────────

lazy_static! {
    static ref CV_LOCK: Lock = Lock::new();
    static ref CV: Condvar = Condvar::new();
}

fn cv_waiter(tag: u64) {
    CV_LOCK.acquire();
    CV.wait(&CV_LOCK);
    CV_LOCK.release();
    record_and_finish(tag);
}

#[test_case]
fn condvar_signal_priority_and_broadcast() {
    if threads::mlfqs_enabled() {
        return;
    }
    order_reset();
    let old = threads::get_priority();
    threads::set_priority(5);

    threads::spawn("cv-10", 10, cv_waiter, 10).unwrap();
    threads::spawn("cv-30", 30, cv_waiter, 30).unwrap();
    threads::spawn("cv-20", 20, cv_waiter, 20).unwrap();

    CV_LOCK.acquire();
    CV.signal(&CV_LOCK); // wakes 30
    CV_LOCK.release();
    DONE.down();
    assert_eq!(order_snapshot(), [30]);

    CV_LOCK.acquire();
    CV.broadcast(&CV_LOCK);
    CV_LOCK.release();
    for _ in 0..2 {
        DONE.down();
    }
    assert_eq!(order_snapshot(), [30, 20, 10]);
    threads::set_priority(old);
}

// ── Timed sleep ─────────────────────────────────────────────

struct SleeperReport {
    duration: i64,
    target: i64,
    woke_at: i64,
}

lazy_static! {
    static ref SLEEPERS: Mutex<Vec<SleeperReport>> = Mutex::new(Vec::new());
}

fn sleeper(duration: u64) {
    let duration = duration as i64;
    let target = timer::ticks() + duration;
    timer::sleep(duration);
    let woke_at = timer::ticks();
    intr::critical(|| {
        SLEEPERS.lock().push(SleeperReport {
            duration,
            target,
            woke_at,
        })
    });
    DONE.up();
}

#[test_case]
fn sleep_wakes_in_deadline_order() {
    intr::critical(|| SLEEPERS.lock().clear());

    for duration in [30u64, 10, 20] {
        threads::spawn("alarm", PRI_DEFAULT, sleeper, duration).unwrap();
    }
    threads::yield_now(); // let all three reach their sleep
    for _ in 0..3 {
        DONE.down();
    }

    intr::critical(|| {
        let reports = SLEEPERS.lock();
        let durations: Vec<i64> = reports.iter().map(|r| r.duration).collect();
        assert_eq!(durations, [10, 20, 30], "wake order must follow deadlines");
        for r in reports.iter() {
            assert!(r.woke_at >= r.target, "woke before its deadline");
            assert!(
                r.woke_at < r.target + 2,
                "woke {} ticks late",
                r.woke_at - r.target
            );
        }
    });
}

#[test_case]
fn sleep_nonpositive_returns_immediately() {
    let before = timer::ticks();
    timer::sleep(0);
    timer::sleep(-5);
    assert!(timer::ticks() - before <= 1);
}

// ── MLFQ ────────────────────────────────────────────────────

#[test_case]
fn mlfq_load_average_tracks_one_busy_thread() {
    if !threads::mlfqs_enabled() {
        return;
    }
    // One busy thread (this one) for 60 seconds: load_avg converges on 1.
    let deadline = timer::ticks() + 60 * timer::TIMER_FREQ;
    while timer::ticks() < deadline {
        core::hint::spin_loop();
    }
    let load = threads::load_avg_x100();
    assert!(
        (95..=105).contains(&load),
        "load_avg_x100 was {}, expected ≈100",
        load
    );
}

#[test_case]
fn mlfq_nice_lowers_priority() {
    if !threads::mlfqs_enabled() {
        return;
    }
    threads::set_nice(0);
    let base = threads::get_priority();
    threads::set_nice(10);
    // Give the 4-tick recomputation a chance to observe the new nice.
    timer::sleep(8);
    assert!(threads::get_priority() <= base - 19, "nice 10 must cost 20 levels");
    threads::set_nice(0);
}

// ── Invariants ──────────────────────────────────────────────

#[test_case]
fn scheduler_invariants_hold() {
    threads::check_invariants();
    threads::yield_now();
    threads::check_invariants();
}
