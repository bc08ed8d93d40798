/*
 * System Call Dispatch
 *
 * One trap vector (int 0x30 on the target). The trap stub captures the
 * user stack pointer and the eax slot of the interrupt frame; the
 * number sits at [esp], arguments at [esp+4], [esp+8], [esp+12], and
 * the return value goes back through eax.
 *
 * Every user pointer is validated (and its pages pinned) before use; an
 * invalid pointer or an out-of-range number terminates the process with
 * status -1. Pins drop on every return path, error or not.
 */

pub mod handlers;
pub mod numbers;
pub mod usermem;

use handlers::*;
use numbers::*;
use usermem::Fault;

use crate::process;
use crate::scheduler;
use crate::vm::VmHandle;

/// The slots of the trap frame the dispatcher reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    /// User stack pointer at the trap.
    pub esp: u32,
    /// Return-value slot, restored into eax on the way out.
    pub eax: u32,
}

/// Dispatch the system call described by `frame`.
pub fn dispatch(frame: &mut SyscallFrame) {
    let vm = scheduler::with_current(|t| t.process.as_ref().map(|p| p.vm.clone()));
    let Some(vm) = vm else {
        // A trap from something without a process is a kernel bug.
        panic!("system call from a kernel thread");
    };

    match dispatch_inner(&vm, frame) {
        Ok(value) => frame.eax = value as u32,
        Err(Fault) => {
            process::exit_current(STATUS_FAIL);
            frame.eax = STATUS_FAIL as u32;
        }
    }
}

fn dispatch_inner(vm: &VmHandle, frame: &SyscallFrame) -> Result<i32, Fault> {
    let nr = usermem::read_u32(vm, frame.esp)?;
    let arg = |i: u32| usermem::read_u32(vm, frame.esp + 4 + 4 * i);

    match nr {
        SYS_HALT => sys_halt(),
        SYS_EXIT => sys_exit(arg(0)? as i32),
        SYS_EXEC => sys_exec(vm, arg(0)?),
        SYS_WAIT => sys_wait(arg(0)?),
        SYS_CREATE => sys_create(vm, arg(0)?, arg(1)?),
        SYS_REMOVE => sys_remove(vm, arg(0)?),
        SYS_OPEN => sys_open(vm, arg(0)?),
        SYS_FILESIZE => sys_filesize(arg(0)? as i32),
        SYS_READ => sys_read(vm, arg(0)? as i32, arg(1)?, arg(2)?),
        SYS_WRITE => sys_write(vm, arg(0)? as i32, arg(1)?, arg(2)?),
        SYS_SEEK => sys_seek(arg(0)? as i32, arg(1)?),
        SYS_TELL => sys_tell(arg(0)? as i32),
        SYS_CLOSE => sys_close(arg(0)? as i32),
        SYS_MMAP => sys_mmap(arg(0)? as i32, arg(1)?),
        SYS_MUNMAP => sys_munmap(arg(0)? as i32),
        _ => {
            log::debug!("unknown system call {}", nr);
            Err(Fault)
        }
    }
}
