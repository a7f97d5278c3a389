//! In-kernel test framework.
//!
//! `#[test_case]` functions run inside the booted kernel (scheduler live,
//! interrupts on) and report over serial; QEMU is told the verdict through
//! the isa-debug-exit device. Wire it up with:
//! `-device isa-debug-exit,iobase=0xf4,iosize=0x04 -serial stdio`.

use core::any::type_name;
use core::panic::PanicInfo;

use x86_64::instructions::port::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(code: QemuExitCode) -> ! {
    unsafe {
        Port::<u32>::new(0xf4).write(code as u32);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

pub trait Testable {
    fn run(&self);
    fn name(&self) -> &'static str;
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        self();
    }

    fn name(&self) -> &'static str {
        type_name::<T>()
    }
}

pub fn runner(tests: &[&dyn Testable]) {
    crate::log_info!("running {} tests", tests.len());
    for test in tests {
        crate::serial::_print(format_args!("test {} ... ", test.name()));
        test.run();
        crate::serial::_print(format_args!("[ok]\n"));
    }
    crate::log_info!("all tests passed");
    exit_qemu(QemuExitCode::Success);
}

pub fn panic_handler(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    crate::serial::_print(format_args!("[failed]\n{}\n", info));
    exit_qemu(QemuExitCode::Failed);
}
