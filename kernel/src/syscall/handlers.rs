/*
 * System Call Handlers
 *
 * One function per call. File-system calls run under the global
 * file-system lock, taken after every user pointer involved has been
 * validated and pinned, so no error path can leave it held. User-visible
 * failures return -1; invalid pointers surface as `Fault` and terminate
 * the process in the dispatcher.
 */

use alloc::vec;

use super::usermem::{self, Fault};
use crate::devices::console;
use crate::fs::{self, File};
use crate::process;
use crate::scheduler::{self, ThreadId};
use crate::vm::{self, VmHandle};

/// The file open under `fd` in the current process.
fn fd_file(fd: i32) -> Option<File> {
    scheduler::with_current(|t| t.process.as_ref().and_then(|p| p.fds.get(fd)))
}

pub fn sys_halt() -> ! {
    log::info!("halt requested");
    crate::arch::power_off();
}

pub fn sys_exit(status: i32) -> Result<i32, Fault> {
    process::exit_current(status);
    Ok(status)
}

pub fn sys_exec(vm: &VmHandle, cmd_ptr: u32) -> Result<i32, Fault> {
    let (cmd, pins) = usermem::pin_cstr(vm, cmd_ptr)?;
    drop(pins); // `execute` owns its copy before anything else runs.
    Ok(process::execute(&cmd))
}

pub fn sys_wait(pid: u32) -> Result<i32, Fault> {
    Ok(process::wait(ThreadId(pid as usize)))
}

pub fn sys_create(vm: &VmHandle, name_ptr: u32, size: u32) -> Result<i32, Fault> {
    let (name, _pins) = usermem::pin_cstr(vm, name_ptr)?;
    fs::fs_lock().acquire();
    let ok = fs::root().create(&name, size as usize);
    fs::fs_lock().release();
    Ok(ok as i32)
}

pub fn sys_remove(vm: &VmHandle, name_ptr: u32) -> Result<i32, Fault> {
    let (name, _pins) = usermem::pin_cstr(vm, name_ptr)?;
    fs::fs_lock().acquire();
    let ok = fs::root().remove(&name);
    fs::fs_lock().release();
    Ok(ok as i32)
}

pub fn sys_open(vm: &VmHandle, name_ptr: u32) -> Result<i32, Fault> {
    let (name, _pins) = usermem::pin_cstr(vm, name_ptr)?;
    fs::fs_lock().acquire();
    let fd = match fs::root().open(&name) {
        Some(file) => scheduler::with_current(|t| {
            t.process
                .as_mut()
                .map_or(-1, |p| p.fds.alloc(file))
        }),
        None => -1,
    };
    fs::fs_lock().release();
    Ok(fd)
}

pub fn sys_filesize(fd: i32) -> Result<i32, Fault> {
    match fd_file(fd) {
        Some(file) => {
            fs::fs_lock().acquire();
            let len = file.length();
            fs::fs_lock().release();
            Ok(len as i32)
        }
        None => Ok(-1),
    }
}

pub fn sys_read(vm: &VmHandle, fd: i32, buf: u32, n: u32) -> Result<i32, Fault> {
    let n = n as usize;
    if n == 0 {
        return Ok(0);
    }
    // Pin the destination for the whole call; it must be writable.
    let _pins = usermem::pin_range(vm, buf, n, true)?;

    match fd {
        0 => {
            let mut data = vec![0u8; n];
            for b in data.iter_mut() {
                *b = console::read_byte();
            }
            usermem::write_bytes(vm, buf, &data)?;
            Ok(n as i32)
        }
        1 => Ok(-1),
        _ => match fd_file(fd) {
            Some(file) => {
                let mut data = vec![0u8; n];
                fs::fs_lock().acquire();
                let got = file.read(&mut data);
                fs::fs_lock().release();
                usermem::write_bytes(vm, buf, &data[..got])?;
                Ok(got as i32)
            }
            None => Ok(-1),
        },
    }
}

pub fn sys_write(vm: &VmHandle, fd: i32, buf: u32, n: u32) -> Result<i32, Fault> {
    let n = n as usize;
    if n == 0 {
        return Ok(0);
    }
    let _pins = usermem::pin_range(vm, buf, n, false)?;
    let data = usermem::read_bytes(vm, buf, n)?;

    match fd {
        1 => {
            console::write_bytes(&data);
            Ok(n as i32)
        }
        0 => Ok(-1),
        _ => match fd_file(fd) {
            Some(file) => {
                fs::fs_lock().acquire();
                let put = file.write(&data);
                fs::fs_lock().release();
                Ok(put as i32)
            }
            None => Ok(-1),
        },
    }
}

pub fn sys_seek(fd: i32, pos: u32) -> Result<i32, Fault> {
    if let Some(file) = fd_file(fd) {
        fs::fs_lock().acquire();
        file.seek(pos as usize);
        fs::fs_lock().release();
    }
    Ok(0)
}

pub fn sys_tell(fd: i32) -> Result<i32, Fault> {
    match fd_file(fd) {
        Some(file) => {
            fs::fs_lock().acquire();
            let pos = file.tell();
            fs::fs_lock().release();
            Ok(pos as i32)
        }
        None => Ok(-1),
    }
}

pub fn sys_close(fd: i32) -> Result<i32, Fault> {
    fs::fs_lock().acquire();
    let ok = scheduler::with_current(|t| {
        t.process.as_mut().map_or(false, |p| p.fds.close(fd))
    });
    fs::fs_lock().release();
    Ok(if ok { 0 } else { -1 })
}

pub fn sys_mmap(fd: i32, addr: u32) -> Result<i32, Fault> {
    if fd < 2 {
        return Ok(-1);
    }
    let Some(file) = fd_file(fd) else { return Ok(-1) };

    fs::fs_lock().acquire();
    let mapped = file.reopen();
    fs::fs_lock().release();

    vm::page_lock().acquire();
    let mapid = scheduler::with_current(|t| match t.process.as_mut() {
        Some(p) => vm::mmap::mmap(&p.vm, &mut p.mmaps, mapped, addr),
        None => None,
    });
    vm::page_lock().release();

    Ok(mapid.unwrap_or(-1))
}

pub fn sys_munmap(mapid: i32) -> Result<i32, Fault> {
    vm::page_lock().acquire();
    let unmapping = scheduler::with_current(|t| {
        t.process
            .as_mut()
            .and_then(|p| p.mmaps.take(mapid).map(|m| (p.vm.clone(), m)))
    });
    if let Some((vm_arc, mapping)) = unmapping {
        vm::mmap::munmap(&vm_arc, mapping);
    }
    vm::page_lock().release();
    Ok(0)
}
