//! User processes: fork, exec, wait, exit.
//!
//! The parent–child rendezvous runs over [`ChildRecord`], an `Arc`-shared
//! object that outlives both sides: the parent keeps it on its child list,
//! the child keeps a handle as its own record, and the two semaphores carry
//! the fork-completion and exit-status handshakes.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use x86_64::PhysAddr;

use crate::error::{KernelError, KernelResult};
use crate::fs::{self, File};
use crate::interrupts::usermode::{self, SyscallFrame};
use crate::loader::elf;
use crate::memory::{self, paging, PGSIZE, USER_STACK};
use crate::println;
use crate::threads::sync::Semaphore;
use crate::threads::thread::{Tid, PRI_DEFAULT};
use crate::threads::{self};
use crate::vm::spt::SupplementalPageTable;

use super::fd::FdTable;

/// Parent–child rendezvous object; survives whichever side dies first.
pub struct ChildRecord {
    tid: AtomicU64,
    pub exit_status: AtomicI64,
    pub exited: AtomicBool,
    pub waited: AtomicBool,
    /// Upped exactly once, by `exit`.
    pub wait_sema: Semaphore,
    /// Upped exactly once, when the child finishes (or fails) cloning.
    pub fork_sema: Semaphore,
    pub fork_ok: AtomicBool,
}

impl ChildRecord {
    pub fn new() -> Arc<ChildRecord> {
        Arc::new(ChildRecord {
            tid: AtomicU64::new(0),
            exit_status: AtomicI64::new(-1),
            exited: AtomicBool::new(false),
            waited: AtomicBool::new(false),
            wait_sema: Semaphore::new(0),
            fork_sema: Semaphore::new(0),
            fork_ok: AtomicBool::new(false),
        })
    }

    pub fn tid(&self) -> Tid {
        Tid(self.tid.load(Ordering::Acquire))
    }

    fn set_tid(&self, tid: Tid) {
        self.tid.store(tid.0, Ordering::Release);
    }
}

/// Per-process state hanging off the thread control block.
pub struct Process {
    /// Full command line; the first token names the program.
    pub cmdline: String,
    pub exit_status: i64,
    pub fd_table: FdTable,
    /// The running executable, held open with writes denied.
    pub exec_file: Option<File>,
    pub children: Vec<Arc<ChildRecord>>,
    pub own_record: Option<Arc<ChildRecord>>,
    pub spt: SupplementalPageTable,
    /// Lowest mapped stack page; grows downward.
    pub stack_bottom: u64,
    /// User RSP captured at syscall entry, for fault classification while
    /// in the kernel.
    pub user_rsp: u64,
}

impl Process {
    pub fn new(cmdline: &str) -> KernelResult<Box<Process>> {
        Ok(Box::new(Process {
            cmdline: String::from(cmdline),
            exit_status: -1,
            fd_table: FdTable::new()?,
            exec_file: None,
            children: Vec::new(),
            own_record: None,
            spt: SupplementalPageTable::new(),
            stack_bottom: USER_STACK,
            user_rsp: 0,
        }))
    }

    /// First whitespace-delimited token of the command line.
    pub fn name(&self) -> &str {
        self.cmdline.split_whitespace().next().unwrap_or("unknown")
    }
}

fn current_process() -> Option<&'static mut Process> {
    threads::current_process_ptr().map(|p| unsafe { &mut *p })
}

// ── Initial process ─────────────────────────────────────────

struct InitArgs {
    cmdline: String,
    record: Arc<ChildRecord>,
}

/// Launches the boot command line's user program. The returned record is
/// the kernel's wait channel for it.
pub fn spawn_initial(cmdline: &str) -> KernelResult<Arc<ChildRecord>> {
    let record = ChildRecord::new();
    let name: String = cmdline
        .split_whitespace()
        .next()
        .unwrap_or("init")
        .into();
    let args = Box::new(InitArgs {
        cmdline: String::from(cmdline),
        record: record.clone(),
    });
    let arg = Box::into_raw(args) as u64;
    let tid = match threads::spawn(&name, PRI_DEFAULT, initd, arg) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(arg as *mut InitArgs) });
            return Err(e);
        }
    };
    record.set_tid(tid);
    Ok(record)
}

/// Blocks until the process behind `record` exits; returns its status.
pub fn wait_for_record(record: &ChildRecord) -> i64 {
    record.wait_sema.down();
    record.exit_status.load(Ordering::Acquire)
}

fn initd(arg: u64) {
    let args = unsafe { Box::from_raw(arg as *mut InitArgs) };
    let mut process = match Process::new(&args.cmdline) {
        Ok(p) => p,
        Err(_) => {
            args.record.wait_sema.up();
            threads::exit_thread();
        }
    };
    process.own_record = Some(args.record.clone());
    threads::set_current_process(process);
    let cmdline = args.cmdline.clone();
    drop(args); // start_user never returns; free before the jump
    let _failed = exec_current(&cmdline);
    // Reached only when exec failed before committing.
    exit(-1);
}

// ── exec ────────────────────────────────────────────────────

/// Replaces the current process image with the program named by `cmdline`
/// and jumps to user mode. Returns only on failure *before* the old image
/// was torn down; a later failure exits the process.
pub fn exec_current(cmdline: &str) -> KernelError {
    let process = match current_process() {
        Some(p) => p,
        None => return KernelError::InvalidExecutable,
    };

    let mut words = cmdline.split_whitespace();
    let name = match words.next() {
        Some(n) => n,
        None => return KernelError::NoSuchFile,
    };

    // Everything fallible-before-commit happens up front: open the image
    // and parse its headers.
    let file = match fs::open(name) {
        Some(f) => f,
        None => return KernelError::NoSuchFile,
    };
    let image = match elf::parse(&file) {
        Ok(i) => i,
        Err(e) => return e,
    };
    let new_pml4 = match paging::create_user_pml4() {
        Ok(p) => p,
        Err(e) => return e,
    };

    // Commit point: tear down the old image.
    let old_pml4 = threads::current_pml4();
    paging::activate(paging::kernel_pml4());
    threads::set_current_pml4(None);
    if let Some(old) = old_pml4 {
        process.spt.kill(old);
        paging::destroy_user_pml4(old);
    }
    process.spt = SupplementalPageTable::new();
    if let Some(mut old_exec) = process.exec_file.take() {
        old_exec.allow_write();
    }

    threads::set_current_pml4(Some(new_pml4));
    paging::activate(new_pml4);

    let entry = match elf::load(&image, &file, &mut process.spt) {
        Ok(entry) => entry,
        Err(_) => exit(-1),
    };
    let stack_bottom = match crate::vm::setup_stack(&mut process.spt, new_pml4) {
        Ok(b) => b,
        Err(_) => exit(-1),
    };
    process.stack_bottom = stack_bottom;

    let args: Vec<&str> = cmdline.split_whitespace().collect();
    let (rsp, argc, argv) = match pack_argv(&process.spt, &args) {
        Ok(t) => t,
        Err(_) => exit(-1),
    };

    let mut exec_file = file;
    exec_file.deny_write();
    process.exec_file = Some(exec_file);
    process.cmdline = String::from(cmdline);
    threads::set_current_name(name);

    usermode::start_user(entry, rsp, argc as u64, argv);
}

/// Lays out argv on the freshly claimed stack page, x86-64 SysV style:
/// strings at the top in reverse argv order, 8-byte alignment, a NULL
/// sentinel, the argv pointers, then a fake return address.
/// Returns (rsp, argc, argv pointer).
fn pack_argv(
    spt: &SupplementalPageTable,
    args: &[&str],
) -> KernelResult<(u64, usize, u64)> {
    let stack_va = USER_STACK - PGSIZE;
    let page = spt.find(stack_va).ok_or(KernelError::FaultUnhandled);
    let frame = page?.frame.ok_or(KernelError::FaultUnhandled)?;
    let base = memory::kva(frame);

    // Bytes needed: strings + padding + (argc + 2) pointers.
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    let need = strings + 8 + (args.len() + 2) * 8;
    if need >= PGSIZE as usize {
        return Err(KernelError::Misaligned);
    }

    let mut sp = USER_STACK;
    let mut arg_ptrs: Vec<u64> = Vec::with_capacity(args.len());

    let write_bytes = |sp: u64, bytes: &[u8]| {
        let offset = (sp - stack_va) as usize;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len());
        }
    };

    for arg in args.iter().rev() {
        sp -= arg.len() as u64 + 1;
        write_bytes(sp, arg.as_bytes());
        write_bytes(sp + arg.len() as u64, &[0]);
        arg_ptrs.push(sp);
    }
    sp &= !7;

    // argv[argc] sentinel, then argv[argc-1..0]; arg_ptrs is already in
    // reverse argv order.
    sp -= 8;
    write_bytes(sp, &0u64.to_le_bytes());
    for ptr in arg_ptrs.iter() {
        sp -= 8;
        write_bytes(sp, &ptr.to_le_bytes());
    }
    let argv = sp;

    // Fake return address.
    sp -= 8;
    write_bytes(sp, &0u64.to_le_bytes());

    Ok((sp, args.len(), argv))
}

// ── fork ────────────────────────────────────────────────────

struct ForkArgs {
    frame: SyscallFrame,
    record: Arc<ChildRecord>,
    parent: Tid,
}

/// Clones the calling process. Returns the child's tid to the parent once
/// the child has finished copying, or -1.
pub fn fork(name: &str, parent_frame: &SyscallFrame) -> i64 {
    let parent_tid = threads::current_tid();
    let process = match current_process() {
        Some(p) => p,
        None => return -1,
    };

    let record = ChildRecord::new();
    let args = Box::new(ForkArgs {
        frame: *parent_frame,
        record: record.clone(),
        parent: parent_tid,
    });
    let arg = Box::into_raw(args) as u64;
    let tid = match threads::spawn(name, PRI_DEFAULT, forked_child, arg) {
        Ok(tid) => tid,
        Err(_) => {
            drop(unsafe { Box::from_raw(arg as *mut ForkArgs) });
            return -1;
        }
    };
    record.set_tid(tid);
    process.children.push(record.clone());

    // Block until the child reports; its address-space copy reads our
    // tables meanwhile.
    record.fork_sema.down();
    if record.fork_ok.load(Ordering::Acquire) {
        tid.0 as i64
    } else {
        -1
    }
}

fn forked_child(arg: u64) {
    let args = unsafe { Box::from_raw(arg as *mut ForkArgs) };
    let ok = build_child(&args).is_ok();
    args.record.fork_ok.store(ok, Ordering::Release);
    args.record.fork_sema.up();
    if !ok {
        exit(-1);
    }
    let mut frame = args.frame;
    frame.rax = 0; // fork returns 0 in the child
    drop(args); // return_to_user never returns; free before the jump
    usermode::return_to_user(&frame);
}

fn build_child(args: &ForkArgs) -> KernelResult<()> {
    let parent = threads::process_ptr_of(args.parent).ok_or(KernelError::InvalidExecutable)?;
    // The parent sits blocked on fork_sema while we read (and, for swapped
    // pages, claim back into) its tables.
    let parent = unsafe { &mut *parent };
    let parent_pml4 = parent_pml4_of(args.parent).ok_or(KernelError::InvalidExecutable)?;

    let child_pml4 = paging::create_user_pml4()?;
    let mut process = Process::new(&parent.cmdline)?;
    process.own_record = Some(args.record.clone());
    process.fd_table = parent.fd_table.duplicate_for_fork()?;
    process.stack_bottom = parent.stack_bottom;
    if let Some(exec) = parent.exec_file.as_ref() {
        let mut dup = exec.reopen();
        dup.deny_write();
        process.exec_file = Some(dup);
    }

    if let Err(e) = process
        .spt
        .copy_from(&mut parent.spt, parent_pml4, child_pml4)
    {
        process.spt.kill(child_pml4);
        paging::destroy_user_pml4(child_pml4);
        return Err(e);
    }

    threads::set_current_process(process);
    threads::set_current_pml4(Some(child_pml4));
    paging::activate(child_pml4);
    Ok(())
}

fn parent_pml4_of(tid: Tid) -> Option<PhysAddr> {
    threads::pml4_of(tid)
}

// ── wait / exit ─────────────────────────────────────────────

/// Reaps the child with the given tid: blocks until it exits, returns its
/// status, and detaches the record. -1 for unknown or already-waited
/// children.
pub fn wait(child: Tid) -> i64 {
    let process = match current_process() {
        Some(p) => p,
        None => return -1,
    };
    let idx = match process
        .children
        .iter()
        .position(|r| r.tid() == child && !r.waited.load(Ordering::Acquire))
    {
        Some(i) => i,
        None => return -1,
    };
    let record = process.children[idx].clone();
    record.waited.store(true, Ordering::Release);
    record.wait_sema.down();
    let status = record.exit_status.load(Ordering::Acquire);
    process.children.remove(idx);
    status
}

/// Terminates the current thread. For a user process this prints the exit
/// message, releases every resource and wakes a waiting parent; for a bare
/// kernel thread it just dies.
pub fn exit(status: i64) -> ! {
    // Detach the process state first; nothing may fault on it after this.
    if let Some(mut process) = threads::take_current_process() {
        process.exit_status = status;
        println!("{}: exit({})", process.name(), status);

        if let Some(pml4) = threads::current_pml4() {
            // Get off the dying address space before tearing it down.
            paging::activate(paging::kernel_pml4());
            threads::set_current_pml4(None);
            process.spt.kill(pml4);
            paging::destroy_user_pml4(pml4);
        }

        process.fd_table.clear();
        if let Some(mut exec) = process.exec_file.take() {
            exec.allow_write();
        }

        if let Some(record) = process.own_record.clone() {
            record.exit_status.store(status, Ordering::Release);
            record.exited.store(true, Ordering::Release);
            record.wait_sema.up();
        }
        drop(process);
    }
    threads::exit_thread();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_process_main(arg: u64) {
        let record = unsafe { Arc::from_raw(arg as *const ChildRecord) };
        let mut process = Process::new("child-42").unwrap();
        process.own_record = Some(record);
        threads::set_current_process(process);
        exit(42);
    }

    #[test_case]
    fn wait_returns_child_status_exactly_once() {
        if threads::current_process_ptr().is_none() {
            threads::set_current_process(Process::new("test-harness").unwrap());
        }
        let record = ChildRecord::new();
        let raw = Arc::into_raw(record.clone()) as u64;
        let tid = threads::spawn("child-42", PRI_DEFAULT, child_process_main, raw).unwrap();
        record.set_tid(tid);
        let process = unsafe { &mut *threads::current_process_ptr().unwrap() };
        process.children.push(record);

        assert_eq!(wait(tid), 42);
        assert_eq!(wait(tid), -1, "a reaped child cannot be waited for again");
        assert_eq!(wait(Tid(987654)), -1, "unknown children are errors");
    }

    #[test_case]
    fn exit_wakes_parent_even_if_it_waits_later() {
        if threads::current_process_ptr().is_none() {
            threads::set_current_process(Process::new("test-harness").unwrap());
        }
        let record = ChildRecord::new();
        let raw = Arc::into_raw(record.clone()) as u64;
        let tid = threads::spawn("child-42b", PRI_DEFAULT, child_process_main, raw).unwrap();
        record.set_tid(tid);
        let process = unsafe { &mut *threads::current_process_ptr().unwrap() };
        process.children.push(record.clone());

        // Let the child exit before we ever wait; the status must be
        // buffered in the record.
        while !record.exited.load(Ordering::Acquire) {
            threads::yield_now();
        }
        assert_eq!(wait(tid), 42);
    }
}
