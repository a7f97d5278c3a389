//! System call dispatch.
//!
//! `int 0x80`, number in `rax`, arguments in `rdi rsi rdx r10 r8 r9`,
//! result written back into the saved frame's `rax`. Every pointer argument
//! is validated against the caller's supplemental page table before the
//! kernel touches it; an invalid pointer terminates the process with -1.

use alloc::string::String;
use alloc::vec::Vec;

use crate::interrupts::usermode::SyscallFrame;
use crate::memory;
use crate::threads::thread::Tid;
use crate::userprog::fd::FdEntry;
use crate::userprog::process::{self, Process};
use crate::{drivers, fs, threads, vm};

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_MMAP: u64 = 14;
pub const SYS_MUNMAP: u64 = 15;
pub const SYS_DUP2: u64 = 16;

const ERR: u64 = u64::MAX; // -1

/// Longest path/command-line string a syscall accepts.
const MAX_STR: usize = 4096;
/// I/O request ceiling per call.
const MAX_IO: usize = 8 * 1024 * 1024;

pub fn init() {
    crate::log_info!("syscalls: int 0x80 interface ready");
}

/// Called from the naked entry stub with a pointer to the saved frame.
pub extern "C" fn dispatch(frame: &mut SyscallFrame) {
    let process = match threads::current_process_ptr() {
        Some(p) => unsafe { &mut *p },
        None => {
            frame.rax = ERR;
            return;
        }
    };
    // Remember where the user stack was, for fault classification while we
    // run kernel code on its behalf.
    process.user_rsp = frame.rsp;

    // The gate masked interrupts; syscalls are preemptible.
    x86_64::instructions::interrupts::enable();

    let (a0, a1, a2, a3, _a4, _a5) =
        (frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9);

    frame.rax = match frame.rax {
        SYS_HALT => crate::power_off(),
        SYS_EXIT => process::exit(a0 as i64),
        SYS_FORK => {
            let name = read_user_str(process, a0, 64);
            process::fork(&name, frame) as u64
        }
        SYS_EXEC => {
            let cmdline = read_user_str(process, a0, MAX_STR);
            // Copied into kernel memory above; the old image may go away.
            let _failed = process::exec_current(&cmdline);
            ERR
        }
        SYS_WAIT => process::wait(Tid(a0)) as u64,
        SYS_CREATE => {
            let name = read_user_str(process, a0, MAX_STR);
            fs::create(&name, a1 as usize) as u64
        }
        SYS_REMOVE => {
            let name = read_user_str(process, a0, MAX_STR);
            fs::remove(&name) as u64
        }
        SYS_OPEN => sys_open(process, a0),
        SYS_FILESIZE => sys_filesize(process, a0 as usize),
        SYS_READ => sys_read(process, a0 as usize, a1, a2 as usize),
        SYS_WRITE => sys_write(process, a0 as usize, a1, a2 as usize),
        SYS_SEEK => sys_seek(process, a0 as usize, a1 as usize),
        SYS_TELL => sys_tell(process, a0 as usize),
        SYS_CLOSE => match process.fd_table.close(a0 as usize) {
            Ok(()) => 0,
            Err(_) => ERR,
        },
        SYS_MMAP => sys_mmap(process, a0, a1 as usize, a2 != 0, a3 as usize, frame.r8 as usize),
        SYS_MUNMAP => sys_munmap(process, a0),
        SYS_DUP2 => match process.fd_table.dup2(a0 as usize, a1 as usize) {
            Ok(fd) => fd as u64,
            Err(_) => ERR,
        },
        other => {
            crate::log_warn!("syscall: unknown number {}", other);
            ERR
        }
    };
}

// ── User-memory access ──────────────────────────────────────

/// Is `[va, va + len)` readable (and writable if asked) user memory, either
/// mapped or lazily registered?
fn valid_user_range(process: &Process, va: u64, len: usize, write: bool) -> bool {
    if len == 0 {
        return true;
    }
    let end = match va.checked_add(len as u64) {
        Some(e) => e,
        None => return false,
    };
    if !memory::is_user_vaddr(va) || !memory::is_user_vaddr(end - 1) {
        return false;
    }
    let mut page = memory::page_down(va);
    while page < end {
        if !vm::user_page_exists(&process.spt, page, write) {
            return false;
        }
        page += memory::PGSIZE;
    }
    true
}

/// Copies a NUL-terminated user string into kernel memory, terminating the
/// process on a bad pointer or a missing terminator within `max` bytes.
fn read_user_str(process: &Process, va: u64, max: usize) -> String {
    let mut bytes = Vec::new();
    for i in 0..max as u64 {
        let addr = va + i;
        if !valid_user_range(process, addr, 1, false) {
            process::exit(-1);
        }
        let byte = unsafe { core::ptr::read_volatile(addr as *const u8) };
        if byte == 0 {
            return String::from_utf8(bytes).unwrap_or_else(|_| process::exit(-1));
        }
        bytes.push(byte);
    }
    process::exit(-1);
}

fn user_slice<'a>(process: &Process, va: u64, len: usize, write: bool) -> &'a mut [u8] {
    if len > MAX_IO || !valid_user_range(process, va, len, write) {
        process::exit(-1);
    }
    unsafe { core::slice::from_raw_parts_mut(va as *mut u8, len) }
}

// ── File descriptor calls ───────────────────────────────────

fn sys_open(process: &mut Process, path: u64) -> u64 {
    let name = read_user_str(process, path, MAX_STR);
    match fs::open(&name) {
        Some(file) => match process.fd_table.install(file) {
            Ok(fd) => fd as u64,
            Err(_) => ERR,
        },
        None => ERR,
    }
}

fn sys_filesize(process: &Process, fd: usize) -> u64 {
    match process.fd_table.get(fd) {
        Some(FdEntry::File(file)) => {
            crate::intr::critical(|| file.lock().len()) as u64
        }
        _ => ERR,
    }
}

fn sys_read(process: &mut Process, fd: usize, buf: u64, len: usize) -> u64 {
    if len == 0 {
        return 0;
    }
    match process.fd_table.get(fd) {
        Some(FdEntry::Stdin) => {
            let slice = user_slice(process, buf, len, true);
            for (i, slot) in slice.iter_mut().enumerate() {
                let byte = drivers::keyboard::read_byte();
                *slot = byte;
                if byte == b'\n' {
                    return i as u64 + 1;
                }
            }
            len as u64
        }
        Some(FdEntry::File(file)) => {
            let slice = user_slice(process, buf, len, true);
            crate::intr::critical(|| file.lock().read(slice)) as u64
        }
        _ => ERR,
    }
}

fn sys_write(process: &mut Process, fd: usize, buf: u64, len: usize) -> u64 {
    if len == 0 {
        return 0;
    }
    match process.fd_table.get(fd) {
        Some(FdEntry::Stdout) => {
            let slice = user_slice(process, buf, len, false);
            crate::vga::putbuf(slice);
            len as u64
        }
        Some(FdEntry::File(file)) => {
            let slice = user_slice(process, buf, len, false);
            crate::intr::critical(|| file.lock().write(slice)) as u64
        }
        _ => ERR,
    }
}

fn sys_seek(process: &Process, fd: usize, pos: usize) -> u64 {
    match process.fd_table.get(fd) {
        Some(FdEntry::File(file)) => {
            crate::intr::critical(|| file.lock().seek(pos));
            0
        }
        _ => ERR,
    }
}

fn sys_tell(process: &Process, fd: usize) -> u64 {
    match process.fd_table.get(fd) {
        Some(FdEntry::File(file)) => crate::intr::critical(|| file.lock().tell()) as u64,
        _ => ERR,
    }
}

// ── Memory mapping calls ────────────────────────────────────

fn sys_mmap(
    process: &mut Process,
    addr: u64,
    len: usize,
    writable: bool,
    fd: usize,
    offset: usize,
) -> u64 {
    let file = match process.fd_table.get(fd) {
        Some(FdEntry::File(file)) => file,
        _ => return 0,
    };
    let result = crate::intr::critical(|| {
        let f = file.lock();
        vm::file_map::do_mmap(&mut process.spt, addr, len, writable, &f, offset)
    });
    match result {
        Ok(mapped) => mapped,
        Err(_) => 0, // NULL: mmap failure is not fatal
    }
}

fn sys_munmap(process: &mut Process, addr: u64) -> u64 {
    let pml4 = match threads::current_pml4() {
        Some(p) => p,
        None => return ERR,
    };
    match vm::file_map::do_munmap(&mut process.spt, pml4, addr) {
        Ok(()) => 0,
        Err(_) => ERR,
    }
}
