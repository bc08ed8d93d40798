/*
 * Per-Process Page Directory
 *
 * Two-level page table in the i386 shape: a directory of 1024 entries,
 * each pointing at a table of 1024 entries covering 4 MiB. Entries keep
 * the frame address in the high bits and the status flags in the low
 * twelve, so the layout mirrors a hardware PTE while frame addresses stay
 * native-width kernel pointers.
 *
 * The directory and the supplemental page table must agree: a present
 * entry here exists exactly for supplemental entries whose page is
 * resident in a frame. Accessed and dirty bits are set by the paths that
 * touch user memory on the process's behalf (`syscall::usermem`), standing
 * in for the hardware walker.
 */

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::mem::{PG_BITS, Vpn};

bitflags::bitflags! {
    /// Low-bit flags of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

/// A page-table entry: frame address above PG_BITS, flags below.
#[derive(Debug, Clone, Copy, Default)]
struct Pte(usize);

impl Pte {
    fn new(kaddr: usize, flags: PteFlags) -> Pte {
        debug_assert_eq!(kaddr & ((1 << PG_BITS) - 1), 0);
        Pte(kaddr | flags.bits())
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & ((1 << PG_BITS) - 1))
    }

    fn kaddr(self) -> usize {
        self.0 & !((1 << PG_BITS) - 1)
    }

    fn present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    fn set(&mut self, flag: PteFlags, value: bool) {
        if value {
            self.0 |= flag.bits();
        } else {
            self.0 &= !flag.bits();
        }
    }
}

const ENTRIES: usize = 1024;

type Table = [Pte; ENTRIES];

/// Directory half of the split: index of the 4 MiB region.
fn pd_index(vpn: Vpn) -> u32 {
    vpn.addr() >> (PG_BITS + 10)
}

/// Table half of the split: page within the region.
fn pt_index(vpn: Vpn) -> usize {
    ((vpn.addr() >> PG_BITS) & 0x3ff) as usize
}

/// A process's page directory.
pub struct PageDir {
    tables: BTreeMap<u32, Box<Table>>,
}

impl PageDir {
    pub fn new() -> PageDir {
        PageDir { tables: BTreeMap::new() }
    }

    fn entry(&self, vpn: Vpn) -> Option<&Pte> {
        let pte = &self.tables.get(&pd_index(vpn))?[pt_index(vpn)];
        pte.present().then_some(pte)
    }

    fn entry_mut(&mut self, vpn: Vpn) -> Option<&mut Pte> {
        let pte = &mut self.tables.get_mut(&pd_index(vpn))?[pt_index(vpn)];
        pte.present().then_some(pte)
    }

    /// Map `vpn` to the frame at `kaddr`. Fails if `vpn` is already
    /// mapped; callers check first (`get_page`) the way the loaders do.
    pub fn set_page(&mut self, vpn: Vpn, kaddr: usize, writable: bool) -> bool {
        let table = self
            .tables
            .entry(pd_index(vpn))
            .or_insert_with(|| Box::new([Pte::default(); ENTRIES]));
        let pte = &mut table[pt_index(vpn)];
        if pte.present() {
            return false;
        }
        let mut flags = PteFlags::PRESENT | PteFlags::USER | PteFlags::ACCESSED;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        *pte = Pte::new(kaddr, flags);
        true
    }

    /// Kernel address of the frame mapped at `vpn`, if any.
    pub fn get_page(&self, vpn: Vpn) -> Option<usize> {
        self.entry(vpn).map(|pte| pte.kaddr())
    }

    /// Drop the mapping at `vpn`. Missing mappings are ignored, matching
    /// teardown paths that clear ranges.
    pub fn clear_page(&mut self, vpn: Vpn) {
        if let Some(table) = self.tables.get_mut(&pd_index(vpn)) {
            table[pt_index(vpn)] = Pte::default();
        }
    }

    pub fn is_accessed(&self, vpn: Vpn) -> bool {
        self.entry(vpn).is_some_and(|pte| pte.flags().contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&mut self, vpn: Vpn, accessed: bool) {
        if let Some(pte) = self.entry_mut(vpn) {
            pte.set(PteFlags::ACCESSED, accessed);
        }
    }

    pub fn is_dirty(&self, vpn: Vpn) -> bool {
        self.entry(vpn).is_some_and(|pte| pte.flags().contains(PteFlags::DIRTY))
    }

    pub fn set_dirty(&mut self, vpn: Vpn, dirty: bool) {
        if let Some(pte) = self.entry_mut(vpn) {
            pte.set(PteFlags::DIRTY, dirty);
        }
    }

    pub fn is_writable(&self, vpn: Vpn) -> bool {
        self.entry(vpn).is_some_and(|pte| pte.flags().contains(PteFlags::WRITABLE))
    }

    pub fn set_writable(&mut self, vpn: Vpn, writable: bool) {
        if let Some(pte) = self.entry_mut(vpn) {
            pte.set(PteFlags::WRITABLE, writable);
        }
    }

    /// Record a user-mode touch of `vpn`, as the hardware walker would.
    pub fn mark_access(&mut self, vpn: Vpn, write: bool) {
        if let Some(pte) = self.entry_mut(vpn) {
            pte.set(PteFlags::ACCESSED, true);
            if write {
                pte.set(PteFlags::DIRTY, true);
            }
        }
    }

    /// Load this directory on the processor. The frame allocator keeps
    /// the mappings themselves; on the target this reloads CR3.
    pub fn activate(&self) {
        #[cfg(target_arch = "x86")]
        unsafe {
            use x86::controlregs;
            controlregs::cr3_write(controlregs::cr3());
        }
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(addr: u32) -> Vpn {
        Vpn::containing(addr)
    }

    #[test]
    fn map_translate_unmap() {
        let mut pd = PageDir::new();
        assert!(pd.set_page(v(0x804_8000), 0x10_0000, true));
        assert_eq!(pd.get_page(v(0x804_8000)), Some(0x10_0000));
        assert_eq!(pd.get_page(v(0x804_9000)), None);

        // Double-mapping the same page is refused.
        assert!(!pd.set_page(v(0x804_8000), 0x20_0000, true));

        pd.clear_page(v(0x804_8000));
        assert_eq!(pd.get_page(v(0x804_8000)), None);
    }

    #[test]
    fn distinct_regions_use_distinct_tables() {
        let mut pd = PageDir::new();
        assert!(pd.set_page(v(0x0040_0000), 0x1000, false));
        assert!(pd.set_page(v(0xbfff_f000), 0x2000, true));
        assert_eq!(pd.get_page(v(0x0040_0000)), Some(0x1000));
        assert_eq!(pd.get_page(v(0xbfff_f000)), Some(0x2000));
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pd = PageDir::new();
        pd.set_page(v(0x1000), 0x3000, true);

        // Freshly installed mappings count as accessed, not dirty.
        assert!(pd.is_accessed(v(0x1000)));
        assert!(!pd.is_dirty(v(0x1000)));

        pd.set_accessed(v(0x1000), false);
        assert!(!pd.is_accessed(v(0x1000)));

        pd.mark_access(v(0x1000), true);
        assert!(pd.is_accessed(v(0x1000)));
        assert!(pd.is_dirty(v(0x1000)));

        pd.set_dirty(v(0x1000), false);
        assert!(!pd.is_dirty(v(0x1000)));
    }

    #[test]
    fn writability_toggles() {
        let mut pd = PageDir::new();
        pd.set_page(v(0x1000), 0x3000, false);
        assert!(!pd.is_writable(v(0x1000)));
        pd.set_writable(v(0x1000), true);
        assert!(pd.is_writable(v(0x1000)));
    }

    #[test]
    fn absent_pages_report_false() {
        let pd = PageDir::new();
        assert!(!pd.is_accessed(v(0x5000)));
        assert!(!pd.is_dirty(v(0x5000)));
        assert!(!pd.is_writable(v(0x5000)));
    }
}
