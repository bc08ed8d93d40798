/*
 * Memory-Mapped Files
 *
 * Per-process registry of mmap regions. Each mapping covers whole pages
 * of one reopened file handle, so closing the original descriptor never
 * invalidates the mapping. Pages load lazily on first touch; dirty pages
 * are written back to the file at unmap (or exit), and clean ones are
 * simply dropped.
 *
 * Mapping ids count up per process.
 */

use alloc::collections::BTreeMap;

use super::page::{Backing, LazyFile, PageEntry};
use super::VmHandle;
use crate::fs::File;
use crate::mem::{PG_SIZE, STACK_BOTTOM, Vpn, is_user_vaddr};

/// One mapped region.
pub struct Mapping {
    pub base: Vpn,
    pub page_cnt: usize,
    pub file: File,
}

pub struct MmapTable {
    maps: BTreeMap<i32, Mapping>,
    next_id: i32,
}

impl MmapTable {
    pub fn new() -> MmapTable {
        MmapTable { maps: BTreeMap::new(), next_id: 1 }
    }

    fn alloc(&mut self, mapping: Mapping) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.maps.insert(id, mapping);
        id
    }

    pub fn take(&mut self, mapid: i32) -> Option<Mapping> {
        self.maps.remove(&mapid)
    }

    /// Remove every mapping, for exit teardown.
    pub fn drain(&mut self) -> alloc::vec::Vec<Mapping> {
        let ids: alloc::vec::Vec<i32> = self.maps.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.maps.remove(&id)).collect()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Map `file` (already reopened by the caller) at `addr`. Rejects a zero
/// or unaligned address, an empty file, and any overlap with existing
/// pages or the stack region. Returns the mapping id.
pub fn mmap(vm_arc: &VmHandle, mmaps: &mut MmapTable, file: File, addr: u32) -> Option<i32> {
    if addr == 0 || Vpn::offset(addr) != 0 {
        return None;
    }
    let length = file.length();
    if length == 0 {
        return None;
    }
    let page_cnt = length.div_ceil(PG_SIZE);

    // The whole range must be mappable: inside user space, clear of the
    // stack region, and free of supplemental entries.
    {
        let vm = vm_arc.lock();
        let mut vpn = Vpn::containing(addr);
        for _ in 0..page_cnt {
            if !is_user_vaddr(vpn.addr()) || vpn.addr() >= STACK_BOTTOM {
                return None;
            }
            if vm.pages.contains(vpn) {
                return None;
            }
            vpn = vpn.next();
        }
    }

    {
        let mut vm = vm_arc.lock();
        let mut vpn = Vpn::containing(addr);
        for i in 0..page_cnt {
            let offset = i * PG_SIZE;
            let read_bytes = PG_SIZE.min(length - offset);
            let lazy = LazyFile {
                file: file.clone(),
                offset,
                read_bytes,
                zero_bytes: PG_SIZE - read_bytes,
            };
            vm.pages.add(PageEntry::new(
                vpn,
                true,
                Backing::Mmap { lazy, resident: None },
            ));
            vpn = vpn.next();
        }
    }

    Some(mmaps.alloc(Mapping { base: Vpn::containing(addr), page_cnt, file }))
}

/// Unmap a region: write dirty resident pages back to the file at their
/// offsets, then drop every page. The reopened handle closes when the
/// mapping is dropped.
pub fn munmap(vm_arc: &VmHandle, mapping: Mapping) {
    let mut vpn = mapping.base;
    for _ in 0..mapping.page_cnt {
        write_back_if_dirty(vm_arc, vpn);
        super::clear_page(vm_arc, vpn);
        vpn = vpn.next();
    }
}

fn write_back_if_dirty(vm_arc: &VmHandle, vpn: Vpn) {
    let vm = vm_arc.lock();
    let Some(entry) = vm.pages.lookup(vpn) else { return };
    if let Backing::Mmap { lazy, resident: Some(kaddr) } = &entry.backing
        && vm.pagedir.is_dirty(vpn)
    {
        let bytes =
            unsafe { core::slice::from_raw_parts(*kaddr as *const u8, PG_SIZE) };
        let n = lazy.file.write_at(&bytes[..lazy.read_bytes], lazy.offset);
        debug_assert_eq!(n, lazy.read_bytes);
    }
}
