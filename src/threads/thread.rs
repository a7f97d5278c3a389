//! Thread control blocks.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::PhysAddr;

use super::context::Context;
use super::fixed_point::Fixed;
use crate::error::{KernelError, KernelResult};
use crate::userprog::process::Process;

pub const PRI_MIN: i32 = 0;
pub const PRI_DEFAULT: i32 = 31;
pub const PRI_MAX: i32 = 63;

pub const NICE_MIN: i32 = -20;
pub const NICE_DEFAULT: i32 = 0;
pub const NICE_MAX: i32 = 20;

/// 16 KiB kernel stack per thread.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Detects TCB corruption.
const THREAD_MAGIC: u64 = 0xcd6a_bf4b_1d06_8b6e;
/// Written at the low end of every owned kernel stack; an overwrite means
/// the stack grew into it.
const STACK_CANARY: u64 = 0xdead_bea7_5afe_57ac;

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Entry point of a kernel thread.
pub type ThreadFunc = fn(u64);

pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub state: State,

    /// Priority set by the thread itself (or by the MLFQ recomputation).
    pub base_priority: i32,
    /// Priority after donation; what the scheduler actually compares.
    pub priority: i32,
    pub nice: i32,
    pub recent_cpu: Fixed,
    /// Tick at which a sleeping thread wants to run again.
    pub wakeup_tick: i64,
    /// Lock this thread is blocked trying to acquire, if any. Donation
    /// edges are derived from this and the lock-holder registry.
    pub waiting_on: Option<u64>,

    pub context: Context,
    /// User address-space root; `None` for pure kernel threads.
    pub pml4: Option<PhysAddr>,
    /// Present iff this thread is (or is becoming) a user process.
    pub process: Option<Box<Process>>,

    magic: u64,
    /// Owned kernel stack. Empty for the boot thread, which runs on the
    /// stack the loader provided.
    stack: Box<[u8]>,
}

impl Thread {
    /// A new thread, born BLOCKED, ready to be unblocked into the scheduler.
    pub fn new(
        tid: Tid,
        name: &str,
        priority: i32,
        entry: ThreadFunc,
        arg: u64,
    ) -> KernelResult<Box<Thread>> {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));

        let mut stack = Vec::new();
        stack
            .try_reserve_exact(KERNEL_STACK_SIZE)
            .map_err(|_| KernelError::StackAllocation)?;
        stack.resize(KERNEL_STACK_SIZE, 0);
        let mut stack = stack.into_boxed_slice();
        stack[..8].copy_from_slice(&STACK_CANARY.to_ne_bytes());

        let stack_top = stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;
        let context = Context::fresh(stack_top, entry as u64, arg);

        Ok(Box::new(Thread {
            tid,
            name: String::from(name),
            state: State::Blocked,
            base_priority: priority,
            priority,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            wakeup_tick: 0,
            waiting_on: None,
            context,
            pml4: None,
            process: None,
            magic: THREAD_MAGIC,
            stack,
        }))
    }

    /// The TCB for the thread of execution that booted the kernel.
    pub fn bootstrap_main(tid: Tid) -> Box<Thread> {
        Box::new(Thread {
            tid,
            name: String::from("main"),
            state: State::Running,
            base_priority: PRI_DEFAULT,
            priority: PRI_DEFAULT,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            wakeup_tick: 0,
            waiting_on: None,
            context: Context::empty(),
            pml4: None,
            process: None,
            magic: THREAD_MAGIC,
            stack: Box::new([]),
        })
    }

    /// Top of the owned kernel stack, used for TSS RSP0. `None` for the boot
    /// thread.
    pub fn stack_top(&self) -> Option<u64> {
        if self.stack.is_empty() {
            None
        } else {
            Some((self.stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64) & !0xF)
        }
    }

    /// Panics on a corrupted TCB or an overflowed kernel stack; called on
    /// every context switch.
    pub fn check_integrity(&self) {
        assert_eq!(self.magic, THREAD_MAGIC, "thread {:?} TCB corrupted", self.tid);
        if !self.stack.is_empty() {
            let canary = u64::from_ne_bytes(self.stack[..8].try_into().unwrap());
            assert_eq!(
                canary, STACK_CANARY,
                "thread {:?} ({}) overflowed its kernel stack",
                self.tid, self.name
            );
        }
    }
}
