/*
 * Virtual Memory
 *
 * Ties the per-process pieces (page directory + supplemental page table)
 * to the global ones (frame table, swap device, page pool). The flow
 * every loader uses:
 *
 *   request a page -> pool empty? evict one -> retry -> install mapping,
 *   record the frame, mark the supplemental entry resident.
 *
 * Locking: the page-table lock serializes every path that installs,
 * evicts, pins, or tears down user pages. The frame table and swap
 * device carry their own short spin locks for memory safety, and the
 * frame lock is never held across I/O. Eviction writes mmap pages back
 * through the inode directly rather than taking the file-system lock,
 * which keeps the lock order (child-list < fs < page < frame < swap)
 * acyclic even though eviction starts on the page-lock side.
 */

pub mod exe;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::slice;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::devices::BlockDevice;
use crate::mem::{PG_SIZE, Vpn};
use crate::pagedir::PageDir;
use crate::palloc::{self, AllocFlags};
use crate::sync::Lock;
use frame::FrameTable;
use page::{Backing, LazyFile, PageEntry, SupPageTable};
use swap::SwapDevice;

/// A process's address-space state: the hardware-shaped directory and
/// the supplemental table that explains every page the directory might
/// ever map.
pub struct ProcessVm {
    pub pagedir: PageDir,
    pub pages: SupPageTable,
    /// High-water mark of the stack region, in bytes.
    pub stack_size: u32,
}

impl ProcessVm {
    pub fn new() -> ProcessVm {
        ProcessVm {
            pagedir: PageDir::new(),
            pages: SupPageTable::new(),
            stack_size: 0,
        }
    }
}

impl Default for ProcessVm {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a process's VM state. The frame table keeps one per
/// resident frame so eviction can reach the owner.
pub type VmHandle = Arc<Mutex<ProcessVm>>;

static FRAMES: Mutex<FrameTable> = Mutex::new(FrameTable::new());

static SWAP: Mutex<Option<Arc<SwapDevice>>> = Mutex::new(None);

lazy_static! {
    /// Global page-table lock; see the module comment for ordering.
    static ref PAGE_LOCK: Lock = Lock::new();
}

/// Install the swap device and reset the frame table. Runs at boot after
/// the page pool is up.
pub fn init(swap_dev: Box<dyn BlockDevice>) {
    *FRAMES.lock() = FrameTable::new();
    *SWAP.lock() = Some(Arc::new(SwapDevice::new(swap_dev)));
}

/// The page-table lock. Toggling pins and installing mappings require it.
pub fn page_lock() -> &'static Lock {
    &PAGE_LOCK
}

fn swap_device() -> Arc<SwapDevice> {
    SWAP.lock().clone().expect("swap not initialized")
}

/// Number of frames currently holding user pages.
pub fn frame_count() -> usize {
    FRAMES.lock().len()
}

fn frame_bytes<'a>(kaddr: usize) -> &'a mut [u8] {
    // Frames come from the page pool and stay mapped in kernel space for
    // exactly as long as their record exists.
    unsafe { slice::from_raw_parts_mut(kaddr as *mut u8, PG_SIZE) }
}

/// Allocate a physical page for a user mapping, evicting if the pool is
/// dry. None only when eviction finds every frame pinned.
pub fn alloc_user_page(flags: AllocFlags) -> Option<usize> {
    loop {
        if let Some(kaddr) = palloc::get_page(flags) {
            return Some(kaddr);
        }
        if !evict_one() {
            return None;
        }
    }
}

/// Evict one frame chosen by the clock. True if a frame was freed.
///
/// Called with the page-table lock held (directly or through a path that
/// holds it); the victim's owner cannot race its own page state.
fn evict_one() -> bool {
    let Some((kaddr, info)) = FRAMES.lock().select_victim() else {
        return false;
    };

    {
        let mut vm = info.vm.lock();
        let vm = &mut *vm;
        let entry = vm
            .pages
            .lookup_mut(info.vpn)
            .expect("evicting frame for page without supplemental entry");

        match &entry.backing {
            Backing::Mmap { lazy, resident: Some(_) } => {
                // Dirty mapped pages go back to their file, never swap.
                if vm.pagedir.is_dirty(info.vpn) {
                    let bytes = frame_bytes(kaddr);
                    let n = lazy.file.write_at(&bytes[..lazy.read_bytes], lazy.offset);
                    debug_assert_eq!(n, lazy.read_bytes);
                }
                let lazy = lazy.clone();
                entry.backing = Backing::Mmap { lazy, resident: None };
            }
            Backing::Frame { origin, .. } => {
                let writable = vm.pagedir.is_writable(info.vpn);
                if !writable && origin.is_some() {
                    // Clean read-only executable page: drop it and
                    // re-read from the file on the next touch.
                    let lazy = origin.clone().expect("origin checked above");
                    entry.backing = Backing::File { lazy };
                } else {
                    entry.writable = writable;
                    entry.dirty_snapshot = vm.pagedir.is_dirty(info.vpn);
                    let slot = swap_device().swap_out(frame_bytes(kaddr));
                    entry.backing = Backing::Swap { slot };
                }
            }
            other => panic!("evicting non-resident page: {other:?}"),
        }

        vm.pagedir.clear_page(info.vpn);
    }

    palloc::free_page(kaddr);
    log::trace!("evicted frame {:#x}", kaddr);
    true
}

/// Make `vpn` resident: swap it back in or populate it from its file.
/// True when the page is resident on return; false when the process has
/// no claim to the page or no frame could be found.
pub fn fault_in(vm_arc: &VmHandle, vpn: Vpn) -> bool {
    enum Fill {
        Resident,
        FromSwap { slot: swap::SlotId, writable: bool, dirty: bool },
        FromFile { lazy: LazyFile, writable: bool, mmap: bool },
    }

    let fill = {
        let vm = vm_arc.lock();
        match vm.pages.lookup(vpn) {
            None => return false,
            Some(entry) => match &entry.backing {
                Backing::Frame { .. } | Backing::Mmap { resident: Some(_), .. } => {
                    Fill::Resident
                }
                Backing::Swap { slot } => Fill::FromSwap {
                    slot: *slot,
                    writable: entry.writable,
                    dirty: entry.dirty_snapshot,
                },
                Backing::File { lazy } => Fill::FromFile {
                    lazy: lazy.clone(),
                    writable: entry.writable,
                    mmap: false,
                },
                Backing::Mmap { lazy, resident: None } => Fill::FromFile {
                    lazy: lazy.clone(),
                    writable: true,
                    mmap: true,
                },
            },
        }
    };

    match fill {
        Fill::Resident => true,
        Fill::FromSwap { slot, writable, dirty } => {
            let Some(kaddr) = alloc_user_page(AllocFlags::empty()) else {
                return false;
            };
            swap_device().swap_in(slot, frame_bytes(kaddr));
            {
                let mut vm = vm_arc.lock();
                let vm = &mut *vm;
                let entry = vm.pages.lookup_mut(vpn).expect("page entry vanished");
                entry.backing = Backing::Frame { kaddr, origin: None };
                assert!(vm.pagedir.set_page(vpn, kaddr, writable));
                vm.pagedir.set_dirty(vpn, dirty);
            }
            FRAMES.lock().add(kaddr, vm_arc.clone(), vpn);
            true
        }
        Fill::FromFile { lazy, writable, mmap } => {
            let Some(kaddr) = alloc_user_page(AllocFlags::empty()) else {
                return false;
            };
            let bytes = frame_bytes(kaddr);
            let n = lazy.file.read_at(&mut bytes[..lazy.read_bytes], lazy.offset);
            assert_eq!(n, lazy.read_bytes, "short read populating page");
            bytes[lazy.read_bytes..].fill(0);
            {
                let mut vm = vm_arc.lock();
                let vm = &mut *vm;
                let entry = vm.pages.lookup_mut(vpn).expect("page entry vanished");
                entry.backing = if mmap {
                    Backing::Mmap { lazy, resident: Some(kaddr) }
                } else {
                    Backing::Frame { kaddr, origin: Some(lazy) }
                };
                assert!(vm.pagedir.set_page(vpn, kaddr, writable));
            }
            FRAMES.lock().add(kaddr, vm_arc.clone(), vpn);
            true
        }
    }
}

/// Add a fresh zeroed, writable, frame-backed page at `vpn` (stack
/// growth and the initial stack page). None if no frame is available.
pub fn add_anon_page(vm_arc: &VmHandle, vpn: Vpn) -> Option<usize> {
    let kaddr = alloc_user_page(AllocFlags::ZERO)?;
    {
        let mut vm = vm_arc.lock();
        let vm = &mut *vm;
        vm.pages
            .add(PageEntry::new(vpn, true, Backing::Frame { kaddr, origin: None }));
        assert!(vm.pagedir.set_page(vpn, kaddr, true));
    }
    FRAMES.lock().add(kaddr, vm_arc.clone(), vpn);
    Some(kaddr)
}

/// Record a not-yet-loaded executable page.
pub fn add_lazy_page(vm_arc: &VmHandle, vpn: Vpn, lazy: LazyFile, writable: bool) {
    let mut vm = vm_arc.lock();
    vm.pages
        .add(PageEntry::new(vpn, writable, Backing::File { lazy }));
}

/// Pin `vpn` resident (faulting it in first if needed) or release a pin.
/// False when the process has no entry for the page.
pub fn pin_page(vm_arc: &VmHandle, vpn: Vpn, pin: bool) -> bool {
    if pin && !fault_in(vm_arc, vpn) {
        return false;
    }
    vm_arc.lock().pages.set_pin(vpn, pin)
}

/// Remove `vpn` and release whatever backs it. Dirty mmap write-back is
/// `mmap::munmap`'s job and has already happened by the time it clears
/// pages through here.
pub fn clear_page(vm_arc: &VmHandle, vpn: Vpn) {
    let entry = {
        let mut vm = vm_arc.lock();
        let Some(entry) = vm.pages.take(vpn) else { return };
        vm.pagedir.clear_page(vpn);
        entry
    };
    match entry.backing {
        Backing::Frame { kaddr, .. } | Backing::Mmap { resident: Some(kaddr), .. } => {
            FRAMES.lock().remove(kaddr);
            palloc::free_page(kaddr);
        }
        Backing::Swap { slot } => swap_device().swap_drop(slot),
        Backing::File { .. } | Backing::Mmap { resident: None, .. } => {}
    }
}

/// Tear down an address space: every page, every frame, every slot.
pub fn destroy(vm_arc: &VmHandle) {
    let vpns = vm_arc.lock().pages.all_vpns();
    for vpn in vpns {
        clear_page(vm_arc, vpn);
    }
}

#[cfg(test)]
pub(crate) mod test_setup {
    use super::*;
    use crate::devices::RamDisk;

    /// Page pool + swap + frame table sized for eviction tests.
    pub fn init_vm(pool_pages: usize, swap_slots: u64) {
        crate::palloc::test_arena::init_global(pool_pages);
        init(Box::new(RamDisk::new(swap_slots * 8)));
    }
}
