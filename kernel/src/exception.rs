/*
 * Page-Fault Handling
 *
 * The fault handler decides between three outcomes for a user fault:
 * bring a known page in (lazy load or swap-in), grow the stack, or kill
 * the process. Kernel-mode faults on addresses the kernel has no
 * business touching are kernel bugs and panic.
 *
 * Stack growth: a fault at `addr` with user stack pointer `esp` grows
 * the stack iff the address falls inside the 8 MiB region below the top
 * of user space and sits no further than 32 bytes below `esp` (the
 * largest push the processor issues). Growth adds one zeroed page and
 * refuses to pass the region cap.
 */

use crate::mem::{PG_SIZE, PHYS_BASE, STACK_BOTTOM, STACK_MAX, Vpn, is_user_vaddr};
use crate::process;
use crate::scheduler;
use crate::vm::{self, VmHandle};

/// Decoded page-fault error information.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting address (CR2 on the target).
    pub addr: u32,
    /// True for a fault on a not-present page, false for a rights
    /// violation (e.g. write to read-only).
    pub not_present: bool,
    /// True when the access was a write.
    pub write: bool,
    /// True when the fault came from user mode.
    pub user: bool,
    /// User stack pointer at the time of the fault.
    pub esp: u32,
}

/// What the handler did about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is resident now; retry the access.
    Handled,
    /// The process was terminated with exit status -1.
    Terminated,
}

/// True if a fault at `addr` with stack pointer `esp` is a legitimate
/// stack growth request.
pub fn is_stack_access(addr: u32, esp: u32) -> bool {
    if addr >= PHYS_BASE || addr < STACK_BOTTOM {
        return false;
    }
    addr as i64 >= esp as i64 - 32
}

/// Handle a page fault against the current process.
pub fn page_fault(info: FaultInfo) -> FaultOutcome {
    let vm_arc = scheduler::with_current(|t| t.process.as_ref().map(|p| p.vm.clone()));
    let Some(vm_arc) = vm_arc else {
        panic!(
            "kernel page fault at {:#x} ({} {})",
            info.addr,
            if info.write { "writing" } else { "reading" },
            if info.not_present { "not present" } else { "rights violation" },
        );
    };

    if !is_user_vaddr(info.addr) {
        return kill(info);
    }

    let vpn = Vpn::containing(info.addr);
    vm::page_lock().acquire();

    let known = vm_arc.lock().pages.contains(vpn);
    let outcome = if known {
        handle_known_page(&vm_arc, vpn, &info)
    } else if info.not_present && is_stack_access(info.addr, info.esp) {
        if grow_stack(&vm_arc, vpn) {
            FaultOutcome::Handled
        } else {
            FaultOutcome::Terminated
        }
    } else {
        FaultOutcome::Terminated
    };

    vm::page_lock().release();

    if outcome == FaultOutcome::Terminated {
        return kill(info);
    }
    outcome
}

fn handle_known_page(vm_arc: &VmHandle, vpn: Vpn, info: &FaultInfo) -> FaultOutcome {
    // A write fault on a resident page is a rights violation: the page
    // is mapped read-only and stays that way.
    let (resident, writable) = {
        let vm = vm_arc.lock();
        let entry = vm.pages.lookup(vpn).expect("entry vanished under page lock");
        (entry.frame_kaddr().is_some(), entry.writable)
    };
    if info.write && !writable {
        return FaultOutcome::Terminated;
    }
    if resident && !info.not_present {
        return FaultOutcome::Terminated;
    }

    if vm::fault_in(vm_arc, vpn) {
        FaultOutcome::Handled
    } else {
        FaultOutcome::Terminated
    }
}

/// Add one zeroed page at `vpn` and raise the stack watermark; refuses
/// past the 8 MiB cap.
fn grow_stack(vm_arc: &VmHandle, vpn: Vpn) -> bool {
    {
        let vm = vm_arc.lock();
        if vm.stack_size + PG_SIZE as u32 > STACK_MAX {
            return false;
        }
    }
    if vm::add_anon_page(vm_arc, vpn).is_none() {
        return false;
    }
    vm_arc.lock().stack_size += PG_SIZE as u32;
    true
}

fn kill(info: FaultInfo) -> FaultOutcome {
    log::debug!(
        "page fault at {:#x}: {} error {} page in {} context",
        info.addr,
        if info.not_present { "not present" } else { "rights violation" },
        if info.write { "writing" } else { "reading" },
        if info.user { "user" } else { "kernel" },
    );
    process::exit_current(-1);
    FaultOutcome::Terminated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_heuristic_window() {
        let esp = 0xbfff_f000u32;
        // At or above esp: yes.
        assert!(is_stack_access(esp, esp));
        assert!(is_stack_access(esp + 4, esp));
        // Within the 32-byte push window below esp: yes.
        assert!(is_stack_access(esp - 4, esp));
        assert!(is_stack_access(esp - 32, esp));
        // Further below: no.
        assert!(!is_stack_access(esp - 36, esp));
        // Outside the stack region entirely: no.
        assert!(!is_stack_access(STACK_BOTTOM - 4, esp));
        assert!(!is_stack_access(PHYS_BASE, esp));
        // Bottom edge of the region is inside it.
        assert!(is_stack_access(STACK_BOTTOM, 0));
    }

    #[test]
    fn growth_respects_the_cap() {
        let _serial = crate::test_sync::lock();
        crate::vm::test_setup::init_vm(4, 8);

        let vm = VmHandle::default();
        vm.lock().stack_size = STACK_MAX - PG_SIZE as u32;
        assert!(grow_stack(&vm, Vpn::containing(0xbfff_e000)));
        assert_eq!(vm.lock().stack_size, STACK_MAX);
        // One past the cap is refused.
        assert!(!grow_stack(&vm, Vpn::containing(0xbfff_d000)));
    }
}
