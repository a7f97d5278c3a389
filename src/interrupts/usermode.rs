//! Ring 3 entry and the `int 0x80` syscall gate.

use core::arch::{asm, naked_asm};

/// Register state captured by the syscall entry stub: fifteen pushed GPRs
/// followed by the five-word interrupt frame the CPU laid down. Field order
/// is the stub's push order reversed — do not reorder.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Pushed by the CPU on `int 0x80` from ring 3:
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// The `int 0x80` entry point. Saves the full user register file, hands a
/// pointer to it to the Rust dispatcher (which writes the return value into
/// the saved `rax`), restores and `iretq`s.
///
/// Stack math: the CPU pushes 5 words, we push 15, so the frame is 160
/// bytes and RSP is 16-byte aligned at the `call`.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}

/// Resumes user execution from a saved frame (fork's child, after its
/// address space is cloned). Never returns.
pub fn return_to_user(frame: &SyscallFrame) -> ! {
    let mut frame = *frame;
    // The frame was captured before we existed; re-stamp the selectors in
    // case it ever came from a stale image.
    frame.cs = super::gdt::user_code_selector().0 as u64;
    frame.ss = super::gdt::user_data_selector().0 as u64;
    frame.rflags |= 0x200; // interrupts on in user mode
    unsafe {
        asm!(
            "mov rsp, {frame}",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rsi",
            "pop rdi",
            "pop rbp",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "iretq",
            frame = in(reg) &frame as *const SyscallFrame as u64,
            options(noreturn),
        );
    }
}

/// First entry to user mode after exec: jump to `entry` with the packed
/// stack, `rdi = argc`, `rsi = argv`, everything else zero.
pub fn start_user(entry: u64, user_rsp: u64, argc: u64, argv: u64) -> ! {
    let frame = SyscallFrame {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rsi: argv,
        rdi: argc,
        rbp: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        rip: entry,
        cs: 0,     // stamped by return_to_user
        rflags: 0x202,
        rsp: user_rsp,
        ss: 0,
    };
    return_to_user(&frame);
}
