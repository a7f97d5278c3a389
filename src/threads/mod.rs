//! Thread scheduler.
//!
//! All scheduler state lives in one [`Scheduler`] value behind a global
//! `spin::Mutex` that is only ever taken inside an interrupts-off critical
//! section ([`crate::intr::Guard`]), which is the kernel's mutual-exclusion
//! story on this uniprocessor. Context switches happen with the lock
//! released but interrupts still off; the incoming thread re-enables them.
//!
//! Two scheduling policies are selected at boot and never change: strict
//! priority scheduling with donation through locks, or the BSD-style
//! multi-level feedback queue driven by `recent_cpu` and a global load
//! average in 17.14 fixed point.

pub mod context;
pub mod fixed_point;
pub mod sync;
pub mod thread;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::error::KernelResult;
use crate::intr;
use crate::memory::paging;
use crate::timer::TIMER_FREQ;
use crate::userprog::process::Process;
use context::{switch_context, Context};
use fixed_point::Fixed;
use thread::{State, Thread, ThreadFunc, Tid, PRI_MAX, PRI_MIN};

/// Timer ticks each thread gets before preemption.
pub const TIME_SLICE: u32 = 4;

/// Donation propagates along at most this many `waiting_on` edges.
const DONATION_DEPTH: usize = 8;

/// Set from interrupt context to force a yield once the handler unwinds.
static PREEMPT_PENDING: AtomicBool = AtomicBool::new(false);

struct SleepEntry {
    wakeup: i64,
    tid: Tid,
}

pub struct Scheduler {
    threads: BTreeMap<Tid, Box<Thread>>,
    /// Tids with state Ready, FIFO within one priority. The idle thread is
    /// never on it.
    ready: VecDeque<Tid>,
    /// Sleeping threads ordered by ascending wakeup tick.
    sleepers: Vec<SleepEntry>,
    /// Dying threads whose TCBs the next scheduled thread frees.
    graveyard: VecDeque<Tid>,
    current: Tid,
    idle: Option<Tid>,
    next_tid: u64,
    mlfqs: bool,
    load_avg: Fixed,
    /// Lock id → current holder; donation edges are derived from this
    /// registry plus each thread's `waiting_on`.
    lock_holders: BTreeMap<u64, Tid>,
    slice_ticks: u32,
    started: bool,
}

impl Scheduler {
    fn new() -> Scheduler {
        let main_tid = Tid(1);
        let mut threads = BTreeMap::new();
        threads.insert(main_tid, Thread::bootstrap_main(main_tid));
        Scheduler {
            threads,
            ready: VecDeque::new(),
            sleepers: Vec::new(),
            graveyard: VecDeque::new(),
            current: main_tid,
            idle: None,
            next_tid: 2,
            mlfqs: false,
            load_avg: Fixed::ZERO,
            lock_holders: BTreeMap::new(),
            slice_ticks: 0,
            started: false,
        }
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn thread(&self, tid: Tid) -> &Thread {
        self.threads.get(&tid).expect("unknown tid")
    }

    fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).expect("unknown tid")
    }

    fn effective_of(&self, tid: Tid) -> i32 {
        self.thread(tid).priority
    }

    /// Highest-priority ready thread, FIFO among equals; idle if none.
    fn pick_next(&mut self) -> Tid {
        let threads = &self.threads;
        let mut best: Option<(usize, i32)> = None;
        for (i, tid) in self.ready.iter().enumerate() {
            let p = threads.get(tid).expect("ready thread missing").priority;
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        match best {
            Some((i, _)) => self.ready.remove(i).expect("ready index out of range"),
            None => self.idle.expect("no idle thread to fall back on"),
        }
    }

    /// True when some ready thread outranks the current one.
    fn higher_priority_ready(&self) -> bool {
        let cur = self.effective_of(self.current);
        self.ready
            .iter()
            .any(|tid| self.thread(*tid).priority > cur)
    }

    /// Makes `tid` runnable. Returns whether the caller should yield; from
    /// interrupt context the yield is deferred instead.
    fn unblock_locked(&mut self, tid: Tid) -> bool {
        let idle = self.idle;
        let t = self.thread_mut(tid);
        assert_eq!(t.state, State::Blocked, "unblocking a non-blocked thread");
        t.state = State::Ready;
        if Some(tid) != idle {
            self.ready.push_back(tid);
        }
        if !self.started {
            return false;
        }
        let preempt = self.effective_of(tid) > self.effective_of(self.current);
        if preempt && intr::in_handler() {
            PREEMPT_PENDING.store(true, Ordering::Relaxed);
            return false;
        }
        preempt
    }

    // ── Donation ─────────────────────────────────────────────

    /// Recomputes `priority` from the base priority and the derived donor
    /// set: every thread blocked on a lock this thread holds donates its own
    /// effective priority.
    fn refresh_priority(&mut self, tid: Tid) {
        if self.mlfqs {
            return;
        }
        let mut eff = self.thread(tid).base_priority;
        for donor in self.threads.values() {
            if let Some(lock) = donor.waiting_on {
                if self.lock_holders.get(&lock) == Some(&tid) {
                    eff = eff.max(donor.priority);
                }
            }
        }
        self.thread_mut(tid).priority = eff;
    }

    /// Records that the current thread is about to block on `lock` and
    /// pushes its priority up the holder chain.
    fn lock_wait(&mut self, lock: u64) {
        let waiter = self.current;
        self.thread_mut(waiter).waiting_on = Some(lock);
        if self.mlfqs {
            return;
        }
        let mut chain = self.lock_holders.get(&lock).copied();
        for _ in 0..DONATION_DEPTH {
            let holder = match chain {
                Some(h) => h,
                None => break,
            };
            assert_ne!(holder, waiter, "deadlock: donation chain loops back");
            self.refresh_priority(holder);
            chain = self
                .thread(holder)
                .waiting_on
                .and_then(|l| self.lock_holders.get(&l).copied());
        }
    }

    fn lock_acquired(&mut self, lock: u64) {
        let owner = self.current;
        self.thread_mut(owner).waiting_on = None;
        self.lock_holders.insert(lock, owner);
        // Remaining waiters become donors of the new holder.
        self.refresh_priority(owner);
    }

    /// Drops donations tied to `lock`. Returns whether the release lowered
    /// the current thread below some ready thread.
    fn lock_released(&mut self, lock: u64) -> bool {
        let owner = self.current;
        assert_eq!(self.lock_holders.remove(&lock), Some(owner));
        self.refresh_priority(owner);
        !self.mlfqs && self.higher_priority_ready()
    }

    // ── MLFQ bookkeeping ─────────────────────────────────────

    fn ready_thread_count(&self) -> i32 {
        let running = if Some(self.current) != self.idle { 1 } else { 0 };
        self.ready.len() as i32 + running
    }

    fn mlfqs_priority(recent_cpu: Fixed, nice: i32) -> i32 {
        (PRI_MAX - recent_cpu.div_int(4).to_int() - nice * 2).clamp(PRI_MIN, PRI_MAX)
    }

    fn mlfqs_tick(&mut self, now: i64) {
        // Charge the running thread for this tick.
        if Some(self.current) != self.idle {
            let cur = self.current;
            let t = self.thread_mut(cur);
            t.recent_cpu = t.recent_cpu.add_int(1);
        }

        // Once a second: load average first, then every thread's recent_cpu.
        if now % TIMER_FREQ == 0 {
            let ready = self.ready_thread_count();
            self.load_avg = Fixed::from_ratio(59, 60) * self.load_avg
                + Fixed::from_ratio(1, 60).mul_int(ready);
            let load = self.load_avg;
            let decay = load.mul_int(2) / load.mul_int(2).add_int(1);
            let idle = self.idle;
            for t in self.threads.values_mut() {
                if Some(t.tid) == idle || t.state == State::Dying {
                    continue;
                }
                t.recent_cpu = (decay * t.recent_cpu).add_int(t.nice);
            }
        }

        // Every fourth tick: recompute every priority.
        if now % 4 == 0 {
            let idle = self.idle;
            for t in self.threads.values_mut() {
                if Some(t.tid) == idle || t.state == State::Dying {
                    continue;
                }
                let p = Self::mlfqs_priority(t.recent_cpu, t.nice);
                t.base_priority = p;
                t.priority = p;
            }
        }
    }
}

lazy_static! {
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Turns the booting thread into the first scheduled thread.
pub fn init(mlfqs: bool) {
    let _g = intr::Guard::new();
    let mut s = SCHEDULER.lock();
    s.mlfqs = mlfqs;
    if mlfqs {
        crate::log_info!("threads: MLFQ scheduler selected");
    }
}

/// Spawns the idle thread and opens the scheduler for business.
pub fn start() {
    let idle_tid = spawn_raw("idle", PRI_MIN, idle_loop, 0, true)
        .expect("cannot allocate the idle thread");
    let _g = intr::Guard::new();
    let mut s = SCHEDULER.lock();
    s.idle = Some(idle_tid);
    // The idle thread is picked only when the ready queue is empty, so it
    // must not sit on the queue.
    s.ready.retain(|t| *t != idle_tid);
    s.started = true;
}

fn idle_loop(_: u64) {
    loop {
        x86_64::instructions::hlt();
    }
}

fn spawn_raw(
    name: &str,
    priority: i32,
    entry: ThreadFunc,
    arg: u64,
    idle: bool,
) -> KernelResult<Tid> {
    let mut new_thread;
    let tid;
    {
        let _g = intr::Guard::new();
        let mut s = SCHEDULER.lock();
        tid = s.alloc_tid();
        new_thread = Thread::new(tid, name, priority, entry, arg)?;
        // MLFQ children inherit the parent's footprint.
        if s.mlfqs && !idle {
            let cur = s.current;
            let parent = s.thread(cur);
            new_thread.nice = parent.nice;
            new_thread.recent_cpu = parent.recent_cpu;
            let p = Scheduler::mlfqs_priority(new_thread.recent_cpu, new_thread.nice);
            new_thread.base_priority = p;
            new_thread.priority = p;
        }
        s.threads.insert(tid, new_thread);
    }
    unblock(tid);
    Ok(tid)
}

/// Creates a kernel thread born READY. Fails when its stack cannot be
/// allocated. If the newcomer outranks the caller, the caller yields.
pub fn spawn(name: &str, priority: i32, entry: ThreadFunc, arg: u64) -> KernelResult<Tid> {
    spawn_raw(name, priority, entry, arg, false)
}

#[doc(hidden)]
pub extern "C" fn thread_entry_glue(entry: u64, arg: u64) -> ! {
    finish_schedule();
    x86_64::instructions::interrupts::enable();
    let f: ThreadFunc = unsafe { core::mem::transmute(entry) };
    f(arg);
    exit_thread();
}

pub fn current_tid() -> Tid {
    intr::critical(|| SCHEDULER.lock().current)
}

pub fn current_name() -> String {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        s.thread(s.current).name.clone()
    })
}

pub fn set_current_name(name: &str) {
    intr::critical(|| {
        let mut s = SCHEDULER.lock();
        let cur = s.current;
        s.thread_mut(cur).name = String::from(name);
    })
}

/// Yields the CPU, staying runnable. Round-robins among equal priorities.
pub fn yield_now() {
    let _g = intr::Guard::new();
    let s = SCHEDULER.lock();
    if !s.started || s.ready.is_empty() {
        return;
    }
    schedule(s, State::Ready);
}

/// Blocks the current thread. The caller must already have published the
/// thread on whatever waiter list will eventually unblock it.
pub fn block_current() {
    intr::assert_disabled();
    let s = SCHEDULER.lock();
    debug_assert!(s.started, "blocking before the scheduler started");
    schedule(s, State::Blocked);
}

/// Transitions a BLOCKED thread to READY, yielding to it if it outranks the
/// caller (deferred when called from an interrupt handler).
pub fn unblock(tid: Tid) {
    let should_yield = {
        let _g = intr::Guard::new();
        let mut s = SCHEDULER.lock();
        s.unblock_locked(tid)
    };
    if should_yield {
        yield_now();
    }
}

/// `unblock` for callers that already hold a critical section and handle
/// the yield themselves.
pub(crate) fn unblock_raw(tid: Tid) -> bool {
    intr::assert_disabled();
    SCHEDULER.lock().unblock_locked(tid)
}

/// Terminates the current thread. Its TCB is freed by whichever thread
/// schedules next.
pub fn exit_thread() -> ! {
    let _g = intr::Guard::new();
    let s = SCHEDULER.lock();
    schedule(s, State::Dying);
    unreachable!("a dying thread was rescheduled");
}

/// Puts the current thread to sleep until `wakeup` (a tick count).
pub(crate) fn sleep_current(wakeup: i64) {
    let _g = intr::Guard::new();
    let mut s = SCHEDULER.lock();
    let cur = s.current;
    debug_assert_ne!(Some(cur), s.idle, "the idle thread cannot sleep");
    s.thread_mut(cur).wakeup_tick = wakeup;
    let pos = s.sleepers.partition_point(|e| e.wakeup <= wakeup);
    s.sleepers.insert(pos, SleepEntry { wakeup, tid: cur });
    schedule(s, State::Blocked);
}

/// Timer-tick hook: MLFQ statistics, sleeper wakeups, time slicing. Runs in
/// interrupt context with interrupts off.
pub fn on_tick(now: i64) {
    let mut s = SCHEDULER.lock();
    if !s.started {
        return;
    }

    if s.mlfqs {
        s.mlfqs_tick(now);
    }

    while s.sleepers.first().map_or(false, |e| e.wakeup <= now) {
        let entry = s.sleepers.remove(0);
        s.unblock_locked(entry.tid);
    }

    s.slice_ticks += 1;
    if s.slice_ticks >= TIME_SLICE {
        PREEMPT_PENDING.store(true, Ordering::Relaxed);
    }
}

/// Consumes a pending preemption request; called as interrupt handlers
/// unwind.
pub fn preempt_if_pending() {
    if PREEMPT_PENDING.swap(false, Ordering::Relaxed) && !intr::in_handler() {
        yield_now();
    }
}

/// Sets the base priority of the current thread; ignored under MLFQ. Yields
/// when the change means some ready thread now outranks us.
pub fn set_priority(priority: i32) {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    let should_yield = {
        let _g = intr::Guard::new();
        let mut s = SCHEDULER.lock();
        if s.mlfqs {
            false
        } else {
            let cur = s.current;
            s.thread_mut(cur).base_priority = priority;
            s.refresh_priority(cur);
            s.higher_priority_ready()
        }
    };
    if should_yield {
        yield_now();
    }
}

/// Current thread's effective (possibly donated) priority.
pub fn get_priority() -> i32 {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        s.effective_of(s.current)
    })
}

pub fn set_nice(nice: i32) {
    let nice = nice.clamp(thread::NICE_MIN, thread::NICE_MAX);
    let should_yield = {
        let _g = intr::Guard::new();
        let mut s = SCHEDULER.lock();
        let cur = s.current;
        s.thread_mut(cur).nice = nice;
        if s.mlfqs {
            let t = s.thread(cur);
            let p = Scheduler::mlfqs_priority(t.recent_cpu, t.nice);
            let t = s.thread_mut(cur);
            t.base_priority = p;
            t.priority = p;
            s.higher_priority_ready()
        } else {
            false
        }
    };
    if should_yield {
        yield_now();
    }
}

pub fn mlfqs_enabled() -> bool {
    intr::critical(|| SCHEDULER.lock().mlfqs)
}

pub fn get_nice() -> i32 {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        s.thread(s.current).nice
    })
}

/// 100 × the system load average, rounded to nearest.
pub fn load_avg_x100() -> i32 {
    intr::critical(|| SCHEDULER.lock().load_avg.mul_int(100).to_int_nearest())
}

/// 100 × the current thread's recent_cpu, rounded to nearest.
pub fn recent_cpu_x100() -> i32 {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        s.thread(s.current).recent_cpu.mul_int(100).to_int_nearest()
    })
}

// ── Synchronization hooks (crate-internal) ──────────────────

pub(crate) fn lock_wait(lock: u64) {
    intr::assert_disabled();
    SCHEDULER.lock().lock_wait(lock);
}

pub(crate) fn lock_acquired(lock: u64) {
    intr::assert_disabled();
    SCHEDULER.lock().lock_acquired(lock);
}

pub(crate) fn lock_released(lock: u64) -> bool {
    intr::assert_disabled();
    SCHEDULER.lock().lock_released(lock)
}

pub(crate) fn effective_priority_of(tid: Tid) -> i32 {
    intr::critical(|| SCHEDULER.lock().effective_of(tid))
}

// ── Process plumbing (crate-internal) ───────────────────────

/// Raw pointer to the current thread's process state, or `None` for a pure
/// kernel thread.
///
/// The pointee is owned by the current thread and, per the kernel's
/// concurrency model, only ever mutated by it (fork reads a *blocked*
/// parent's state), so dereferencing outside the scheduler lock is sound on
/// this uniprocessor.
pub(crate) fn current_process_ptr() -> Option<*mut Process> {
    intr::critical(|| {
        let mut s = SCHEDULER.lock();
        let cur = s.current;
        s.thread_mut(cur)
            .process
            .as_mut()
            .map(|p| p.as_mut() as *mut Process)
    })
}

/// Raw pointer to another thread's process state; see
/// [`current_process_ptr`] for the aliasing rules.
pub(crate) fn process_ptr_of(tid: Tid) -> Option<*mut Process> {
    intr::critical(|| {
        let mut s = SCHEDULER.lock();
        s.threads
            .get_mut(&tid)?
            .process
            .as_mut()
            .map(|p| p.as_mut() as *mut Process)
    })
}

pub(crate) fn set_current_process(process: Box<Process>) {
    intr::critical(|| {
        let mut s = SCHEDULER.lock();
        let cur = s.current;
        s.thread_mut(cur).process = Some(process);
    })
}

pub(crate) fn take_current_process() -> Option<Box<Process>> {
    intr::critical(|| {
        let mut s = SCHEDULER.lock();
        let cur = s.current;
        s.thread_mut(cur).process.take()
    })
}

pub(crate) fn pml4_of(tid: Tid) -> Option<PhysAddr> {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        s.threads.get(&tid)?.pml4
    })
}

pub(crate) fn current_pml4() -> Option<PhysAddr> {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        s.thread(s.current).pml4
    })
}

pub(crate) fn set_current_pml4(pml4: Option<PhysAddr>) {
    intr::critical(|| {
        let mut s = SCHEDULER.lock();
        let cur = s.current;
        s.thread_mut(cur).pml4 = pml4;
    })
}

// ── The scheduling decision ─────────────────────────────────

/// Moves the current thread into `new_state`, picks a successor and switches
/// to it. Interrupts must be off; the scheduler lock is consumed and
/// released before the switch. Returns once this thread is next scheduled.
fn schedule(mut s: spin::MutexGuard<'_, Scheduler>, new_state: State) {
    intr::assert_disabled();

    let prev = s.current;
    let idle = s.idle;
    {
        let t = s.thread_mut(prev);
        debug_assert_eq!(t.state, State::Running);
        t.state = new_state;
    }
    match new_state {
        State::Ready => {
            if Some(prev) != idle {
                s.ready.push_back(prev);
            }
        }
        State::Dying => s.graveyard.push_back(prev),
        State::Blocked => {} // caller queued prev on a waiter list
        State::Running => unreachable!(),
    }

    let next = s.pick_next();
    if next == prev {
        // Nothing better to do; keep running.
        s.thread_mut(prev).state = State::Running;
        return;
    }

    s.thread(prev).check_integrity();
    s.thread(next).check_integrity();

    s.thread_mut(next).state = State::Running;
    s.current = next;
    s.slice_ticks = 0;

    if let Some(top) = s.thread(next).stack_top() {
        crate::interrupts::gdt::set_tss_rsp0(top);
    }
    let pml4 = s.thread(next).pml4.unwrap_or_else(paging::kernel_pml4);
    paging::activate(pml4);

    let prev_ctx = &mut s.thread_mut(prev).context as *mut Context;
    let next_ctx = &s.thread(next).context as *const Context;

    drop(s);
    unsafe { switch_context(prev_ctx, next_ctx) };

    // Back on this thread's stack, arbitrarily later.
    finish_schedule();
}

/// Post-switch duties of the incoming thread: free TCBs of threads that died
/// while scheduling us in.
fn finish_schedule() {
    intr::assert_disabled();
    let mut s = SCHEDULER.lock();
    while let Some(tid) = s.graveyard.pop_front() {
        debug_assert_ne!(tid, s.current, "a dying thread cannot bury itself");
        let t = s.threads.remove(&tid).expect("graveyard tid missing");
        debug_assert_eq!(t.state, State::Dying);
        drop(t);
    }
}

/// Debug-build invariant sweep used by the test suite: exactly one RUNNING
/// thread, READY ⇔ on the ready queue, effective ≥ base.
#[cfg(test)]
pub fn check_invariants() {
    intr::critical(|| {
        let s = SCHEDULER.lock();
        let mut running = 0;
        for t in s.threads.values() {
            match t.state {
                State::Running => {
                    running += 1;
                    assert_eq!(t.tid, s.current);
                }
                State::Ready => {
                    assert!(
                        Some(t.tid) == s.idle || s.ready.contains(&t.tid),
                        "ready thread off the ready queue"
                    );
                }
                State::Blocked => {
                    assert!(!s.ready.contains(&t.tid), "blocked thread on ready queue");
                }
                State::Dying => {}
            }
            assert!(t.priority >= t.base_priority || s.mlfqs);
        }
        assert_eq!(running, 1, "exactly one thread must be RUNNING");
        for pair in s.sleepers.windows(2) {
            assert!(pair[0].wakeup <= pair[1].wakeup, "sleep queue out of order");
        }
    })
}
