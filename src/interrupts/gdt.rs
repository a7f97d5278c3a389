//! GDT, TSS and segment selectors.
//!
//! RSP0 in the TSS is rewritten on every context switch so ring-3 → ring-0
//! transitions land on the incoming thread's own kernel stack.

use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Emergency stack for double faults (a corrupted RSP must not cascade).
const DF_STACK_SIZE: usize = 4096 * 4;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

/// Boot-time RSP0 until the scheduler starts switching stacks in.
const BOOT_RSP0_SIZE: usize = 4096 * 4;
static mut BOOT_RSP0_STACK: [u8; BOOT_RSP0_SIZE] = [0; BOOT_RSP0_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let start = VirtAddr::from_ptr(unsafe { &raw const DF_STACK });
            start + DF_STACK_SIZE as u64
        };
        tss.privilege_stack_table[0] = {
            let start = VirtAddr::from_ptr(unsafe { &raw const BOOT_RSP0_STACK });
            start + BOOT_RSP0_SIZE as u64
        };
        tss
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

pub fn user_code_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_code.index(), PrivilegeLevel::Ring3)
}

pub fn user_data_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_data.index(), PrivilegeLevel::Ring3)
}

/// Points RSP0 at the given kernel stack top. Called with interrupts off
/// during context switches; the CPU reads the TSS asynchronously.
pub fn set_tss_rsp0(stack_top: u64) {
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
