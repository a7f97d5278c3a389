//! EmberOS — a small preemptive multitasking kernel for x86-64.
//!
//! The interesting parts are the thread scheduler (priority + donation or
//! MLFQ), the synchronization primitives built on its block/unblock pair,
//! and the demand-paged VM with clock eviction to a swap disk. Everything
//! is reachable from [`kernel_init`]; `_start` is entered by the Multiboot2
//! boot stub.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

pub mod allocator;
pub mod bitmap;
pub mod cmdline;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod interrupts;
pub mod intr;
pub mod loader;
pub mod memory;
pub mod serial;
pub mod syscalls;
pub mod threads;
pub mod timer;
pub mod userprog;
pub mod vga;
pub mod vm;

#[cfg(test)]
pub mod test;

use core::panic::PanicInfo;

/// Brings every subsystem up, in dependency order, and returns the parsed
/// boot options. Interrupts are enabled on return.
pub fn kernel_init(multiboot_info: usize) -> cmdline::BootOptions {
    vga::init();
    serial::init();
    interrupts::init();
    log_info!("EmberOS booting");

    let raw_cmdline = memory::init(multiboot_info);
    memory::paging::init();
    let opts = cmdline::parse(&raw_cmdline);

    threads::init(opts.mlfqs);
    timer::init();
    drivers::init();
    vm::init();
    fs::init();
    memory::load_boot_modules(multiboot_info);
    syscalls::init();

    threads::start();
    x86_64::instructions::interrupts::enable();
    log_info!("EmberOS up (cmdline: '{}')", raw_cmdline);
    opts
}

/// Entry from the Multiboot2 boot stub; `multiboot_info` is the physical
/// address GRUB left in rbx.
#[no_mangle]
pub extern "C" fn _start(multiboot_info: usize) -> ! {
    let opts = kernel_init(multiboot_info);

    #[cfg(test)]
    {
        let _ = opts;
        test_main();
        power_off();
    }

    #[cfg(not(test))]
    {
        if opts.run.is_empty() {
            log_info!("no user program on the command line; halting");
        } else {
            let cmd = opts.run.join(" ");
            match userprog::process::spawn_initial(&cmd) {
                Ok(record) => {
                    let status = userprog::process::wait_for_record(&record);
                    log_info!("'{}' finished with status {}", cmd, status);
                }
                Err(e) => log_error!("cannot start '{}': {}", cmd, e),
            }
        }
        power_off();
    }
}

/// ACPI shutdown (QEMU PM register), falling back to a halt loop. Test
/// builds leave through the debug-exit device instead so the harness sees a
/// verdict.
pub fn power_off() -> ! {
    log_info!("powering off");
    #[cfg(test)]
    test::exit_qemu(test::QemuExitCode::Success);
    #[cfg(not(test))]
    {
        use x86_64::instructions::port::Port;
        unsafe {
            Port::<u16>::new(0x604).write(0x2000);
        }
        loop {
            x86_64::instructions::hlt();
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    println!("{}", info);
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test::panic_handler(info)
}
