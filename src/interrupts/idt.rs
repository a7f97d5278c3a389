//! IDT, PIC remapping and the interrupt handlers.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt;
use crate::{intr, log_error, memory, threads, timer, userprog, vm};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

const SYSCALL_VECTOR: u8 = 0x80;

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt[InterruptIndex::Timer.as_u8() as usize].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_u8() as usize].set_handler_fn(keyboard_interrupt_handler);
        unsafe {
            idt[SYSCALL_VECTOR as usize]
                .set_handler_addr(VirtAddr::new(
                    super::usermode::syscall_entry as *const () as u64,
                ))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// User-mode arithmetic faults kill the process, not the kernel.
extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    if stack_frame.code_segment & 3 == 3 {
        userprog::process::exit(-1);
    }
    panic!("EXCEPTION: DIVIDE ERROR\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    if stack_frame.code_segment & 3 == 3 {
        userprog::process::exit(-1);
    }
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT ({:#x})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = Cr2::read().as_u64();
    let not_present = !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let user = error_code.contains(PageFaultErrorCode::USER_MODE);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let frame_rsp = stack_frame.stack_pointer.as_u64();

    if vm::try_handle_fault(fault_addr, not_present, user, write, frame_rsp) {
        return;
    }

    // Unhandled. A fault raised by user code, or by the kernel dereferencing
    // a user address on a process's behalf, terminates the process; anything
    // else is a kernel bug.
    let user_context = user
        || (memory::is_user_vaddr(fault_addr) && threads::current_process_ptr().is_some());
    if user_context {
        userprog::process::exit(-1);
    }
    log_error!(
        "kernel page fault at {:#x} ({:?})",
        fault_addr,
        error_code
    );
    panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    intr::enter_handler();
    timer::on_interrupt();
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    intr::leave_handler();
    // Runs any yield the tick requested, still before iretq, on the
    // interrupted thread's kernel stack.
    threads::preempt_if_pending();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;
    intr::enter_handler();
    let scancode = unsafe { Port::<u8>::new(0x60).read() };
    crate::drivers::keyboard::push_scancode(scancode);
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
    intr::leave_handler();
    threads::preempt_if_pending();
}
