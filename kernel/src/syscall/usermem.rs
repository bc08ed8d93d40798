/*
 * User Memory Access
 *
 * Every user pointer a syscall dereferences goes through here. A pointer
 * is valid iff it is non-null, below the top of user space, and its page
 * has a supplemental entry. Validation pins: the page is faulted in if
 * needed and marked non-evictable, so the syscall can work on it without
 * the clock pulling it away mid-operation. Callers unpin on every return
 * path; `Pins` makes that automatic.
 *
 * Kernel-side copies record accessed/dirty through the page directory,
 * standing in for the hardware walker.
 */

use alloc::string::String;
use alloc::vec::Vec;

use crate::mem::{PG_SIZE, Vpn, is_user_vaddr};
use crate::vm::{self, VmHandle};

/// An invalid user access; the dispatcher terminates the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

/// Pages pinned on behalf of one syscall. Unpins on drop.
pub struct Pins {
    vm: VmHandle,
    vpns: Vec<Vpn>,
}

impl Pins {
    fn new(vm: VmHandle) -> Pins {
        Pins { vm, vpns: Vec::new() }
    }

    /// Pin the page at `vpn` if this set does not already hold it.
    /// Requires the page-table lock.
    fn pin(&mut self, vpn: Vpn) -> Result<(), Fault> {
        if self.vpns.contains(&vpn) {
            return Ok(());
        }
        if !vm::pin_page(&self.vm, vpn, true) {
            return Err(Fault);
        }
        self.vpns.push(vpn);
        Ok(())
    }
}

impl Drop for Pins {
    fn drop(&mut self) {
        vm::page_lock().acquire();
        for &vpn in &self.vpns {
            vm::pin_page(&self.vm, vpn, false);
        }
        vm::page_lock().release();
    }
}

fn check_range(addr: u32, len: usize) -> Result<(), Fault> {
    if len == 0 {
        return Ok(());
    }
    let end = (addr as u64) + (len as u64) - 1;
    if addr == 0 || !is_user_vaddr(addr) || end >= u64::from(crate::mem::PHYS_BASE) {
        return Err(Fault);
    }
    Ok(())
}

/// Validate and pin `len` bytes at `addr`. With `writable`, every page
/// must be mapped writable (buffers the kernel will store into).
pub fn pin_range(vm: &VmHandle, addr: u32, len: usize, writable: bool) -> Result<Pins, Fault> {
    check_range(addr, len)?;
    let mut pins = Pins::new(vm.clone());
    if len == 0 {
        return Ok(pins);
    }

    vm::page_lock().acquire();
    let result = (|| {
        let mut vpn = Vpn::containing(addr);
        let last = Vpn::containing(addr + (len as u32 - 1));
        loop {
            if writable {
                let ok = vm
                    .lock()
                    .pages
                    .lookup(vpn)
                    .is_some_and(|entry| entry.writable);
                if !ok {
                    return Err(Fault);
                }
            }
            pins.pin(vpn)?;
            if vpn == last {
                return Ok(());
            }
            vpn = vpn.next();
        }
    })();
    vm::page_lock().release();

    result.map(|_| pins)
}

/// Validate and pin a NUL-terminated string, page by page until the
/// terminator. Returns the string with its pages pinned.
pub fn pin_cstr(vm: &VmHandle, addr: u32) -> Result<(String, Pins), Fault> {
    if addr == 0 || !is_user_vaddr(addr) {
        return Err(Fault);
    }
    let mut pins = Pins::new(vm.clone());
    let mut bytes: Vec<u8> = Vec::new();

    vm::page_lock().acquire();
    let result = (|| {
        let mut at = addr;
        loop {
            if !is_user_vaddr(at) {
                return Err(Fault);
            }
            let vpn = Vpn::containing(at);
            pins.pin(vpn)?;

            let kaddr = frame_of(vm, vpn)?;
            let start = Vpn::offset(at);
            let page =
                unsafe { core::slice::from_raw_parts(kaddr as *const u8, PG_SIZE) };
            match page[start..].iter().position(|&b| b == 0) {
                Some(nul) => {
                    bytes.extend_from_slice(&page[start..start + nul]);
                    mark_range(vm, vpn);
                    return Ok(());
                }
                None => {
                    bytes.extend_from_slice(&page[start..]);
                    mark_range(vm, vpn);
                    at = vpn.next().addr();
                    if at == 0 {
                        // Walked off the top of the address space.
                        return Err(Fault);
                    }
                }
            }
        }
    })();
    vm::page_lock().release();

    result.and_then(|_| String::from_utf8(bytes).map_err(|_| Fault))
        .map(|s| (s, pins))
}

/// Kernel address of the (pinned, resident) frame backing `vpn`.
fn frame_of(vm: &VmHandle, vpn: Vpn) -> Result<usize, Fault> {
    vm.lock()
        .pages
        .lookup(vpn)
        .and_then(|entry| entry.frame_kaddr())
        .ok_or(Fault)
}

fn mark_range(vm: &VmHandle, vpn: Vpn) {
    vm.lock().pagedir.mark_access(vpn, false);
}

/// Copy out of pinned user memory.
pub fn read_bytes(vm: &VmHandle, addr: u32, len: usize) -> Result<Vec<u8>, Fault> {
    let mut data = Vec::with_capacity(len);
    let mut at = addr;
    let mut remaining = len;
    while remaining > 0 {
        let vpn = Vpn::containing(at);
        let kaddr = frame_of(vm, vpn)?;
        let start = Vpn::offset(at);
        let n = remaining.min(PG_SIZE - start);
        let page = unsafe { core::slice::from_raw_parts(kaddr as *const u8, PG_SIZE) };
        data.extend_from_slice(&page[start..start + n]);
        vm.lock().pagedir.mark_access(vpn, false);
        at += n as u32;
        remaining -= n;
    }
    Ok(data)
}

/// Copy into pinned, writable user memory.
pub fn write_bytes(vm: &VmHandle, addr: u32, data: &[u8]) -> Result<(), Fault> {
    let mut at = addr;
    let mut written = 0;
    while written < data.len() {
        let vpn = Vpn::containing(at);
        let kaddr = frame_of(vm, vpn)?;
        let start = Vpn::offset(at);
        let n = (data.len() - written).min(PG_SIZE - start);
        let page =
            unsafe { core::slice::from_raw_parts_mut(kaddr as *mut u8, PG_SIZE) };
        page[start..start + n].copy_from_slice(&data[written..written + n]);
        vm.lock().pagedir.mark_access(vpn, true);
        at += n as u32;
        written += n;
    }
    Ok(())
}

/// Read one little-endian word from user memory (syscall arguments).
pub fn read_u32(vm: &VmHandle, addr: u32) -> Result<u32, Fault> {
    let _pins = pin_range(vm, addr, 4, false)?;
    let bytes = read_bytes(vm, addr, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte read")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_setup;

    fn vm_with_anon(addr: u32) -> VmHandle {
        let vm = VmHandle::default();
        vm::add_anon_page(&vm, Vpn::containing(addr)).unwrap();
        vm
    }

    #[test]
    fn word_round_trip_and_pinning() {
        let _serial = crate::test_sync::lock();
        test_setup::init_vm(4, 8);
        let vm = vm_with_anon(0x1000_0000);

        {
            let pins = pin_range(&vm, 0x1000_0000, 64, true).unwrap();
            write_bytes(&vm, 0x1000_0004, &0xdead_beefu32.to_le_bytes()).unwrap();
            assert!(vm.lock().pages.lookup(Vpn::containing(0x1000_0000)).unwrap().pinned);
            drop(pins);
        }
        // Unpinned after the guard goes.
        assert!(!vm.lock().pages.lookup(Vpn::containing(0x1000_0000)).unwrap().pinned);
        assert_eq!(read_u32(&vm, 0x1000_0004).unwrap(), 0xdead_beef);
    }

    #[test]
    fn rejects_null_kernel_and_unmapped_pointers() {
        let _serial = crate::test_sync::lock();
        test_setup::init_vm(4, 8);
        let vm = vm_with_anon(0x1000_0000);

        assert!(pin_range(&vm, 0, 4, false).is_err());
        assert!(pin_range(&vm, crate::mem::PHYS_BASE, 4, false).is_err());
        assert!(pin_range(&vm, 0x2000_0000, 4, false).is_err());
        // Range running past the mapped page.
        assert!(pin_range(&vm, 0x1000_0ffc, 8, false).is_err());
        // Range running past the top of user space.
        assert!(pin_range(&vm, crate::mem::PHYS_BASE - 2, 4, false).is_err());
    }

    #[test]
    fn writable_pinning_rejects_read_only_pages() {
        let _serial = crate::test_sync::lock();
        test_setup::init_vm(4, 8);
        let vm = VmHandle::default();

        // A read-only lazy page.
        let fs = crate::fs::FileSys::new();
        fs.create("seg", PG_SIZE);
        let lazy = crate::vm::page::LazyFile {
            file: fs.open("seg").unwrap(),
            offset: 0,
            read_bytes: PG_SIZE,
            zero_bytes: 0,
        };
        vm::add_lazy_page(&vm, Vpn::containing(0x3000_0000), lazy, false);

        assert!(pin_range(&vm, 0x3000_0000, 8, true).is_err());
        assert!(pin_range(&vm, 0x3000_0000, 8, false).is_ok());
    }

    #[test]
    fn cstr_walks_page_boundaries() {
        let _serial = crate::test_sync::lock();
        test_setup::init_vm(4, 8);
        let vm = VmHandle::default();
        vm::add_anon_page(&vm, Vpn::containing(0x1000_0000)).unwrap();
        vm::add_anon_page(&vm, Vpn::containing(0x1000_1000)).unwrap();

        // "hi" straddling the page boundary.
        let s = b"boundary-crossing";
        let addr = 0x1000_1000 - 8;
        {
            let _pins = pin_range(&vm, addr, s.len() + 1, true).unwrap();
            write_bytes(&vm, addr, s).unwrap();
            write_bytes(&vm, addr + s.len() as u32, &[0]).unwrap();
        }

        let (got, _pins) = pin_cstr(&vm, addr).unwrap();
        assert_eq!(got, "boundary-crossing");
    }

    #[test]
    fn unterminated_string_into_unmapped_memory_faults() {
        let _serial = crate::test_sync::lock();
        test_setup::init_vm(4, 8);
        let vm = vm_with_anon(0x1000_0000);
        {
            let _pins = pin_range(&vm, 0x1000_0000, PG_SIZE, true).unwrap();
            write_bytes(&vm, 0x1000_0000, &alloc::vec![b'x'; PG_SIZE]).unwrap();
        }
        assert!(pin_cstr(&vm, 0x1000_0000).is_err());
        // Nothing left pinned after the failure.
        assert!(!vm.lock().pages.lookup(Vpn::containing(0x1000_0000)).unwrap().pinned);
    }
}
