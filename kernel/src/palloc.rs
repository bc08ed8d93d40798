/*
 * Physical Page Pool
 *
 * Bitmap-based allocator handing out 4 KiB pages from one contiguous
 * region. At boot the region is whatever the loader reports as free
 * memory; under test it is a heap-backed arena. Page loaders never call
 * this directly for user pages without being prepared to evict: see
 * `vm::frame::alloc_user_page`.
 */

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::mem::PG_SIZE;

/// One bit per page. 0 = free, 1 = used.
pub struct PagePool {
    base: usize,
    page_cnt: usize,
    bitmap: Vec<u64>,
}

bitflags::bitflags! {
    /// Allocation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Zero the page before returning it.
        const ZERO = 1 << 0;
    }
}

impl PagePool {
    /// Manage `page_cnt` pages starting at `base`. `base` must be
    /// page-aligned and the region must outlive the pool.
    pub fn new(base: usize, page_cnt: usize) -> PagePool {
        assert_eq!(base % PG_SIZE, 0, "pool base must be page-aligned");
        PagePool {
            base,
            page_cnt,
            bitmap: vec![0u64; page_cnt.div_ceil(64)],
        }
    }

    /// Allocate one page, first-fit. Returns the page's kernel address.
    pub fn get_page(&mut self, flags: AllocFlags) -> Option<usize> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit_idx = word.trailing_ones() as usize;
                let page_num = word_idx * 64 + bit_idx;
                if page_num >= self.page_cnt {
                    return None;
                }
                *word |= 1 << bit_idx;
                let addr = self.base + page_num * PG_SIZE;
                if flags.contains(AllocFlags::ZERO) {
                    unsafe { core::ptr::write_bytes(addr as *mut u8, 0, PG_SIZE) };
                }
                return Some(addr);
            }
        }
        None
    }

    /// Return a page to the pool.
    pub fn free_page(&mut self, addr: usize) {
        assert_eq!(addr % PG_SIZE, 0, "freeing unaligned page");
        let page_num = (addr - self.base) / PG_SIZE;
        assert!(page_num < self.page_cnt, "freeing page outside the pool");
        let mask = 1u64 << (page_num % 64);
        let word = &mut self.bitmap[page_num / 64];
        assert!(*word & mask != 0, "double free of page {:#x}", addr);
        *word &= !mask;
    }

    /// (used, total) page counts.
    pub fn stats(&self) -> (usize, usize) {
        let used = self.bitmap.iter().map(|w| w.count_ones() as usize).sum();
        (used, self.page_cnt)
    }
}

static POOL: Mutex<Option<PagePool>> = Mutex::new(None);

/// Hand the global pool its memory. Called once at boot, before any
/// allocation; calling again replaces the pool (tests re-init freely).
pub fn init(base: usize, page_cnt: usize) {
    *POOL.lock() = Some(PagePool::new(base, page_cnt));
    log::info!("page pool: {} pages at {:#x}", page_cnt, base);
}

/// Allocate a page from the global pool.
pub fn get_page(flags: AllocFlags) -> Option<usize> {
    POOL.lock().as_mut().expect("page pool not initialized").get_page(flags)
}

/// Free a page back to the global pool.
pub fn free_page(addr: usize) {
    POOL.lock().as_mut().expect("page pool not initialized").free_page(addr);
}

/// (used, total) for the global pool.
pub fn stats() -> (usize, usize) {
    POOL.lock().as_ref().expect("page pool not initialized").stats()
}
