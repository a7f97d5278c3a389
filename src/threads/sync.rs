//! Semaphore, lock with priority donation, and condition variable.
//!
//! Everything here bottoms out in the scheduler's block/unblock pair. The
//! inner `spin::Mutex`es are only ever taken inside interrupts-off critical
//! sections and never held across a block, so they cannot be contended.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::intr;
use crate::threads::{self, thread::Tid};

// ── Semaphore ───────────────────────────────────────────────

struct SemaInner {
    value: usize,
    waiters: VecDeque<Tid>,
}

/// Counting semaphore with priority-aware wakeup.
///
/// `up` hands the count directly to the highest-priority waiter (FIFO among
/// equals) instead of incrementing, so a woken `down` returns without
/// re-checking.
pub struct Semaphore {
    inner: Mutex<SemaInner>,
}

impl Semaphore {
    pub fn new(value: usize) -> Semaphore {
        Semaphore {
            inner: Mutex::new(SemaInner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Waits for the count to become positive, then atomically decrements.
    pub fn down(&self) {
        let _g = intr::Guard::new();
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            return;
        }
        inner.waiters.push_back(threads::current_tid());
        drop(inner);
        threads::block_current();
        // The count was handed over by `up`; nothing left to do.
    }

    /// `down` that never blocks. Returns whether the count was taken.
    pub fn try_down(&self) -> bool {
        let _g = intr::Guard::new();
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increments the count or hands it to the best waiter, yielding to the
    /// woken thread when it outranks the caller.
    pub fn up(&self) {
        let should_yield = {
            let _g = intr::Guard::new();
            let mut inner = self.inner.lock();
            match Self::pop_best(&mut inner.waiters) {
                Some(tid) => {
                    drop(inner);
                    threads::unblock_raw(tid)
                }
                None => {
                    inner.value += 1;
                    false
                }
            }
        };
        if should_yield {
            threads::yield_now();
        }
    }

    pub fn value(&self) -> usize {
        intr::critical(|| self.inner.lock().value)
    }

    /// Removes the highest-effective-priority waiter; first match wins, so
    /// equal priorities come out FIFO. Priorities are read at pop time
    /// because donation may have changed them since enqueue.
    fn pop_best(waiters: &mut VecDeque<Tid>) -> Option<Tid> {
        let mut best: Option<(usize, i32)> = None;
        for (i, &tid) in waiters.iter().enumerate() {
            let p = threads::effective_priority_of(tid);
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        best.and_then(|(i, _)| waiters.remove(i))
    }
}

// ── Lock ────────────────────────────────────────────────────

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Mutual exclusion with priority donation.
///
/// A blocked acquirer donates its effective priority along the chain of
/// holders (`waiting_on → holder`, bounded depth), so a low-priority holder
/// cannot starve a high-priority waiter behind a middling third thread.
pub struct Lock {
    id: u64,
    holder: Mutex<Option<Tid>>,
    sema: Semaphore,
}

impl Lock {
    pub fn new() -> Lock {
        Lock {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            holder: Mutex::new(None),
            sema: Semaphore::new(1),
        }
    }

    pub fn held_by_current(&self) -> bool {
        intr::critical(|| *self.holder.lock() == Some(threads::current_tid()))
    }

    pub fn acquire(&self) {
        assert!(!self.held_by_current(), "recursive lock acquisition");
        {
            let _g = intr::Guard::new();
            if self.holder.lock().is_some() {
                threads::lock_wait(self.id);
            }
        }
        self.sema.down();
        let _g = intr::Guard::new();
        *self.holder.lock() = Some(threads::current_tid());
        threads::lock_acquired(self.id);
    }

    /// Acquires without blocking or donating. Returns whether the lock was
    /// taken.
    pub fn try_acquire(&self) -> bool {
        let _g = intr::Guard::new();
        if !self.sema.try_down() {
            return false;
        }
        *self.holder.lock() = Some(threads::current_tid());
        threads::lock_acquired(self.id);
        true
    }

    pub fn release(&self) {
        let should_yield = {
            let _g = intr::Guard::new();
            let mut holder = self.holder.lock();
            assert_eq!(
                *holder,
                Some(threads::current_tid()),
                "releasing a lock the caller does not hold"
            );
            *holder = None;
            drop(holder);
            threads::lock_released(self.id)
        };
        self.sema.up();
        if should_yield {
            threads::yield_now();
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

// ── Condition variable ──────────────────────────────────────

struct CondWaiter {
    tid: Tid,
    sema: Arc<Semaphore>,
}

/// Condition variable over a [`Lock`]. Each waiter parks on its own
/// zero-initialized semaphore; `signal` picks the waiter whose thread has
/// the highest effective priority.
pub struct Condvar {
    waiters: Mutex<Vec<CondWaiter>>,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and waits to be signalled, then reacquires
    /// `lock` before returning.
    pub fn wait(&self, lock: &Lock) {
        assert!(lock.held_by_current(), "condvar wait without the lock");
        let sema = Arc::new(Semaphore::new(0));
        intr::critical(|| {
            self.waiters.lock().push(CondWaiter {
                tid: threads::current_tid(),
                sema: sema.clone(),
            });
        });
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wakes the highest-priority waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current(), "condvar signal without the lock");
        let woken = intr::critical(|| {
            let mut waiters = self.waiters.lock();
            let mut best: Option<(usize, i32)> = None;
            for (i, w) in waiters.iter().enumerate() {
                let p = threads::effective_priority_of(w.tid);
                if best.map_or(true, |(_, bp)| p > bp) {
                    best = Some((i, p));
                }
            }
            best.map(|(i, _)| waiters.remove(i))
        });
        if let Some(w) = woken {
            w.sema.up();
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(lock.held_by_current(), "condvar broadcast without the lock");
        let drained = intr::critical(|| {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut *waiters)
        });
        for w in drained {
            w.sema.up();
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}
