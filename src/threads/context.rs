//! CPU context save/restore for kernel-level context switches.

use core::arch::naked_asm;

/// Callee-saved register state of a suspended thread, System V x86-64.
/// Caller-saved registers are dead across the `switch_context` call by ABI,
/// so only these plus the resume RIP need to survive.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Context for a thread that has never run. Filled in on its first
    /// suspension.
    pub const fn empty() -> Context {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Context that enters `thread_bootstrap` on `stack_top` with the entry
    /// function and its argument staged in r12/r13.
    pub fn fresh(stack_top: u64, entry: u64, arg: u64) -> Context {
        // 16-byte alignment minus the return-address slot the ABI expects.
        let rsp = (stack_top & !0xF) - 8;
        Context {
            rsp,
            rbp: 0,
            rbx: 0,
            r12: entry,
            r13: arg,
            r14: 0,
            r15: 0,
            rip: thread_bootstrap as *const () as u64,
        }
    }
}

/// Suspends the caller into `old` and resumes `new`.
///
/// Must be called with interrupts disabled, on the stack owned by `old`.
/// Returns (much later) when some other thread switches back to `old`.
///
/// # Safety
/// Both pointers must reference live `Context` values whose stacks stay
/// allocated for as long as the threads exist.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}

/// First instructions of every spawned thread: unpack the entry function and
/// argument staged by [`Context::fresh`] and hand off to Rust. The glue never
/// returns.
#[unsafe(naked)]
pub extern "C" fn thread_bootstrap() {
    naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "jmp {glue}",
        glue = sym crate::threads::thread_entry_glue,
    );
}
