/*
 * Trap Handler Bodies
 *
 * The platform layer owns the IDT and the entry stubs; these are the
 * bodies they call once registers are saved. The frame layout matches
 * what the stubs push: general registers (pusha order) below the
 * error code and the processor-pushed iret frame.
 */

use super::pic;
use crate::exception::{self, FaultInfo};
use crate::syscall::{self, SyscallFrame};

/// Registers as saved by the entry stubs plus the iret frame. The esp
/// and ss slots are only meaningful for traps arriving from ring 3.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    // pusha order, edi pushed last.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // Pushed by the stub before pusha.
    pub vec_no: u32,
    pub error_code: u32,
    // Processor-pushed.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Page-fault error code bits.
const PF_P: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_U: u32 = 1 << 2;

/// IRQ 0: the system tick.
pub extern "C" fn timer_interrupt(_frame: &mut TrapFrame) {
    let should_yield = crate::timer::interrupt_tick();
    pic::end_of_interrupt(0);
    if should_yield {
        crate::scheduler::yield_now();
    }
}

/// int 0x30: system call. The number and arguments are on the user
/// stack; the return value goes back in the frame's eax slot.
pub extern "C" fn syscall_trap(frame: &mut TrapFrame) {
    let mut sys_frame = SyscallFrame { esp: frame.esp, eax: frame.eax };
    syscall::dispatch(&mut sys_frame);
    frame.eax = sys_frame.eax;
}

/// Vector 14: page fault. CR2 is read before interrupts come back on.
pub extern "C" fn page_fault_trap(frame: &mut TrapFrame) {
    let addr = unsafe { x86::controlregs::cr2() } as u32;
    crate::intr::enable();

    let info = FaultInfo {
        addr,
        not_present: frame.error_code & PF_P == 0,
        write: frame.error_code & PF_W != 0,
        user: frame.error_code & PF_U != 0,
        esp: frame.esp,
    };
    exception::page_fault(info);
}

/// Any other exception out of user code kills the process; out of
/// kernel code it is a kernel bug.
pub extern "C" fn kill_trap(frame: &mut TrapFrame) {
    if frame.cs & 3 == 3 {
        log::info!(
            "process dying on exception {:#x} at eip {:#x}",
            frame.vec_no,
            frame.eip
        );
        crate::process::exit_current(-1);
    } else {
        panic!(
            "unexpected exception {:#x} in kernel at eip {:#x}",
            frame.vec_no, frame.eip
        );
    }
}
