/*
 * Swap Slot Allocator
 *
 * A bitmap of page-sized slots over the block device reserved for swap
 * at boot. First-fit allocation; a slot holds exactly one evicted page.
 * Running out of swap is fatal. All three operations serialize on the
 * internal lock, the innermost lock in the kernel's ordering.
 */

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::devices::{BlockDevice, SECTOR_SIZE};
use crate::mem::PG_SIZE;

/// Sectors occupied by one slot.
const SECTORS_PER_SLOT: u64 = (PG_SIZE / SECTOR_SIZE) as u64;

/// Identifies one page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(pub usize);

pub struct SwapDevice {
    dev: Box<dyn BlockDevice>,
    state: Mutex<SwapMap>,
}

struct SwapMap {
    /// One bit per slot, set while in use.
    bitmap: Vec<u64>,
    slot_cnt: usize,
}

impl SwapDevice {
    pub fn new(dev: Box<dyn BlockDevice>) -> SwapDevice {
        let slot_cnt = (dev.sector_count() / SECTORS_PER_SLOT) as usize;
        log::info!("swap: {} slots ({} KiB)", slot_cnt, slot_cnt * PG_SIZE / 1024);
        SwapDevice {
            dev,
            state: Mutex::new(SwapMap {
                bitmap: vec![0u64; slot_cnt.div_ceil(64)],
                slot_cnt,
            }),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slot_cnt
    }

    pub fn slots_in_use(&self) -> usize {
        let st = self.state.lock();
        st.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Write one page out, returning its slot. Panics when swap is full.
    pub fn swap_out(&self, page: &[u8]) -> SlotId {
        assert_eq!(page.len(), PG_SIZE);
        let slot = {
            let mut st = self.state.lock();
            let slot = st.first_free().expect("out of swap slots");
            st.set(slot, true);
            slot
        };
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.dev
                .write_sector(slot.0 as u64 * SECTORS_PER_SLOT + i as u64, chunk);
        }
        slot
    }

    /// Read a slot back into `dest` and release it.
    pub fn swap_in(&self, slot: SlotId, dest: &mut [u8]) {
        assert_eq!(dest.len(), PG_SIZE);
        {
            let st = self.state.lock();
            assert!(st.get(slot), "swap_in of free slot {}", slot.0);
        }
        for (i, chunk) in dest.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.dev
                .read_sector(slot.0 as u64 * SECTORS_PER_SLOT + i as u64, chunk);
        }
        self.state.lock().set(slot, false);
    }

    /// Release a slot without reading it (the page was discarded).
    pub fn swap_drop(&self, slot: SlotId) {
        let mut st = self.state.lock();
        assert!(st.get(slot), "swap_drop of free slot {}", slot.0);
        st.set(slot, false);
    }
}

impl SwapMap {
    fn first_free(&self) -> Option<SlotId> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            if *word != u64::MAX {
                let slot = word_idx * 64 + word.trailing_ones() as usize;
                if slot < self.slot_cnt {
                    return Some(SlotId(slot));
                }
            }
        }
        None
    }

    fn get(&self, slot: SlotId) -> bool {
        self.bitmap[slot.0 / 64] & (1 << (slot.0 % 64)) != 0
    }

    fn set(&mut self, slot: SlotId, used: bool) {
        let mask = 1u64 << (slot.0 % 64);
        if used {
            self.bitmap[slot.0 / 64] |= mask;
        } else {
            self.bitmap[slot.0 / 64] &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RamDisk;

    fn device(slots: u64) -> SwapDevice {
        SwapDevice::new(Box::new(RamDisk::new(slots * SECTORS_PER_SLOT)))
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let swap = device(4);
        let mut page = [0u8; PG_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8;
        }

        let slot = swap.swap_out(&page);
        assert_eq!(swap.slots_in_use(), 1);

        let mut back = [0u8; PG_SIZE];
        swap.swap_in(slot, &mut back);
        assert_eq!(back[..], page[..]);
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn first_fit_reuses_dropped_slots() {
        let swap = device(4);
        let page = [0u8; PG_SIZE];
        let a = swap.swap_out(&page);
        let b = swap.swap_out(&page);
        assert_eq!(a, SlotId(0));
        assert_eq!(b, SlotId(1));

        swap.swap_drop(a);
        assert_eq!(swap.swap_out(&page), SlotId(0));
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn exhaustion_is_fatal() {
        let swap = device(2);
        let page = [0u8; PG_SIZE];
        swap.swap_out(&page);
        swap.swap_out(&page);
        swap.swap_out(&page);
    }

    #[test]
    #[should_panic(expected = "swap_in of free slot")]
    fn swap_in_of_free_slot_is_a_bug() {
        let swap = device(2);
        let mut page = [0u8; PG_SIZE];
        swap.swap_in(SlotId(0), &mut page);
    }
}
