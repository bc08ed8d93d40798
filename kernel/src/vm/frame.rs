/*
 * Frame Table
 *
 * Global record of every physical page currently backing a user page:
 * which process's address space owns it and at which virtual page. The
 * frames form a circular order with a rotating hand; eviction runs
 * second-chance replacement over that circle.
 *
 * The table's own lock is never held across I/O. `select_victim` removes
 * the victim's record and returns it; the caller does the write-out with
 * the table unlocked. All mutation of the table happens under the global
 * page-table lock, which is what makes the select-then-process split
 * race-free.
 */

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::ProcessVm;
use crate::mem::Vpn;

pub struct FrameInfo {
    /// Address space owning the page in this frame.
    pub vm: Arc<Mutex<ProcessVm>>,
    /// User virtual page held by the frame.
    pub vpn: Vpn,
}

pub struct FrameTable {
    /// Kernel frame addresses in clock order.
    order: Vec<usize>,
    entries: BTreeMap<usize, FrameInfo>,
    /// Index into `order` of the next eviction candidate.
    hand: usize,
}

impl FrameTable {
    pub const fn new() -> FrameTable {
        FrameTable { order: Vec::new(), entries: BTreeMap::new(), hand: 0 }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, kaddr: usize) -> bool {
        self.entries.contains_key(&kaddr)
    }

    /// Record a frame, inserting just before the hand so it is the last
    /// frame the clock will reconsider. The caller has already installed
    /// the directory mapping (which marks the page accessed).
    pub fn add(&mut self, kaddr: usize, vm: Arc<Mutex<ProcessVm>>, vpn: Vpn) {
        assert!(!self.contains(kaddr), "frame {kaddr:#x} registered twice");
        self.entries.insert(kaddr, FrameInfo { vm, vpn });
        if self.order.is_empty() {
            self.order.push(kaddr);
            self.hand = 0;
        } else {
            self.order.insert(self.hand, kaddr);
            self.hand += 1;
        }
    }

    /// Drop a frame's record, e.g. when its page is freed. Advances the
    /// hand when it pointed at the removed frame.
    pub fn remove(&mut self, kaddr: usize) -> Option<FrameInfo> {
        let info = self.entries.remove(&kaddr)?;
        let idx = self
            .order
            .iter()
            .position(|&k| k == kaddr)
            .expect("frame entry without clock position");
        self.order.remove(idx);
        if idx < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.order.len() {
            self.hand = 0;
        }
        Some(info)
    }

    fn advance(&mut self) {
        self.hand = (self.hand + 1) % self.order.len();
    }

    /// Second-chance selection: starting at the hand, skip frames whose
    /// page is pinned, and give accessed frames a second chance by
    /// clearing the bit. The chosen victim's record is removed and
    /// returned; None when every frame is pinned.
    pub fn select_victim(&mut self) -> Option<(usize, FrameInfo)> {
        if self.order.is_empty() {
            return None;
        }
        // Two sweeps clear every accessed bit; a third pass that still
        // finds nothing means everything is pinned.
        let mut remaining = self.order.len() * 2 + 1;
        loop {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;

            let kaddr = self.order[self.hand];
            let info = &self.entries[&kaddr];
            let (pinned, accessed) = {
                let mut vm = info.vm.lock();
                let pinned = vm
                    .pages
                    .lookup(info.vpn)
                    .expect("frame for page without supplemental entry")
                    .pinned;
                let accessed = vm.pagedir.is_accessed(info.vpn);
                if !pinned && accessed {
                    vm.pagedir.set_accessed(info.vpn, false);
                }
                (pinned, accessed)
            };

            if pinned || accessed {
                self.advance();
                continue;
            }

            let info = self.remove(kaddr).expect("victim vanished");
            return Some((kaddr, info));
        }
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PG_SIZE;
    use crate::vm::ProcessVm;

    fn vm_with_pages(vpns: &[u32], kaddrs: &[usize]) -> Arc<Mutex<ProcessVm>> {
        use crate::vm::page::{Backing, PageEntry};
        let vm = Arc::new(Mutex::new(ProcessVm::new()));
        {
            let mut g = vm.lock();
            for (&a, &k) in vpns.iter().zip(kaddrs) {
                let vpn = Vpn::containing(a);
                g.pages.add(PageEntry::new(vpn, true, Backing::Frame {
                    kaddr: k,
                    origin: None,
                }));
                assert!(g.pagedir.set_page(vpn, k, true));
            }
        }
        vm
    }

    #[test]
    fn clock_gives_accessed_frames_a_second_chance() {
        let vpns = [0x1000, 0x2000, 0x3000];
        let kaddrs = [PG_SIZE, 2 * PG_SIZE, 3 * PG_SIZE];
        let vm = vm_with_pages(&vpns, &kaddrs);

        let mut table = FrameTable::new();
        for (&a, &k) in vpns.iter().zip(&kaddrs) {
            table.add(k, vm.clone(), Vpn::containing(a));
        }

        // Installation marked every page accessed, so the first victim
        // comes only after a full clearing sweep; afterwards pages are
        // taken in clock order.
        let (k1, _) = table.select_victim().unwrap();
        let (k2, _) = table.select_victim().unwrap();
        assert_ne!(k1, k2);
        assert_eq!(table.len(), 1);

        // The survivor's accessed bit was cleared by the first sweep, so
        // it falls on the next selection.
        let survivor = *kaddrs.iter().find(|&&k| k != k1 && k != k2).unwrap();
        let (k3, _) = table.select_victim().unwrap();
        assert_eq!(k3, survivor);
        assert!(table.is_empty());
    }

    #[test]
    fn pinned_frames_are_never_victims() {
        let vpns = [0x1000, 0x2000];
        let kaddrs = [PG_SIZE, 2 * PG_SIZE];
        let vm = vm_with_pages(&vpns, &kaddrs);
        vm.lock().pages.set_pin(Vpn::containing(0x1000), true);

        let mut table = FrameTable::new();
        for (&a, &k) in vpns.iter().zip(&kaddrs) {
            table.add(k, vm.clone(), Vpn::containing(a));
        }

        let (victim, info) = table.select_victim().unwrap();
        assert_eq!(victim, 2 * PG_SIZE);
        assert_eq!(info.vpn, Vpn::containing(0x2000));

        // Only the pinned frame remains; selection must give up rather
        // than evict it.
        assert!(table.select_victim().is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_keeps_the_hand_valid() {
        let vpns = [0x1000, 0x2000, 0x3000];
        let kaddrs = [PG_SIZE, 2 * PG_SIZE, 3 * PG_SIZE];
        let vm = vm_with_pages(&vpns, &kaddrs);

        let mut table = FrameTable::new();
        for (&a, &k) in vpns.iter().zip(&kaddrs) {
            table.add(k, vm.clone(), Vpn::containing(a));
        }

        table.remove(kaddrs[0]).unwrap();
        table.remove(kaddrs[2]).unwrap();
        assert_eq!(table.len(), 1);

        // The survivor is still reachable through the clock.
        let (k, _) = table.select_victim().unwrap();
        assert_eq!(k, kaddrs[1]);
    }
}
