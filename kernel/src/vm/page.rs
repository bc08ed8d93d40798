/*
 * Supplemental Page Table
 *
 * Per-process map from user virtual page to everything needed to
 * materialize it. Exactly one entry exists for every page the process
 * may legitimately touch; the page directory holds a live mapping
 * exactly for entries currently backed by a frame.
 *
 * Backing states and their transitions:
 *
 *   File -> Frame -> Swap -> Frame -> ...     (exec segments, anon pages)
 *   File -> Frame -> File                     (read-only pages re-read
 *                                              from the file on eviction)
 *   Mmap(non-resident) <-> Mmap(resident)     (dirty pages go back to the
 *                                              file, never to swap)
 *
 * A pinned entry is never chosen for eviction; pinning is toggled only
 * under the page-table lock.
 */

use alloc::collections::BTreeMap;

use super::swap::SlotId;
use crate::fs::File;
use crate::mem::Vpn;

/// Recipe for populating a page from a file on first touch.
#[derive(Clone)]
pub struct LazyFile {
    pub file: File,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl core::fmt::Debug for LazyFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LazyFile")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

/// Where a page's contents live right now.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Resident. `origin` is retained for pages that came from an
    /// executable so read-only ones can be dropped and re-read.
    Frame { kaddr: usize, origin: Option<LazyFile> },
    /// Evicted to the given swap slot.
    Swap { slot: SlotId },
    /// Not yet loaded from its executable.
    File { lazy: LazyFile },
    /// Memory-mapped file page; `resident` holds the frame while loaded.
    Mmap { lazy: LazyFile, resident: Option<usize> },
}

pub struct PageEntry {
    pub vpn: Vpn,
    pub writable: bool,
    pub pinned: bool,
    /// Dirty bit captured when the page was evicted to swap, restored
    /// into the directory when it returns.
    pub dirty_snapshot: bool,
    pub backing: Backing,
}

impl PageEntry {
    pub fn new(vpn: Vpn, writable: bool, backing: Backing) -> PageEntry {
        PageEntry { vpn, writable, pinned: false, dirty_snapshot: false, backing }
    }

    /// Kernel address of the frame holding this page, if resident.
    pub fn frame_kaddr(&self) -> Option<usize> {
        match self.backing {
            Backing::Frame { kaddr, .. } => Some(kaddr),
            Backing::Mmap { resident, .. } => resident,
            _ => None,
        }
    }
}

pub struct SupPageTable {
    pages: BTreeMap<u32, PageEntry>,
}

impl SupPageTable {
    pub fn new() -> SupPageTable {
        SupPageTable { pages: BTreeMap::new() }
    }

    /// Insert an entry for a page that must not already have one.
    pub fn add(&mut self, entry: PageEntry) {
        let prev = self.pages.insert(entry.vpn.addr(), entry);
        assert!(prev.is_none(), "page already has a supplemental entry");
    }

    pub fn lookup(&self, vpn: Vpn) -> Option<&PageEntry> {
        self.pages.get(&vpn.addr())
    }

    pub fn lookup_mut(&mut self, vpn: Vpn) -> Option<&mut PageEntry> {
        self.pages.get_mut(&vpn.addr())
    }

    pub fn contains(&self, vpn: Vpn) -> bool {
        self.pages.contains_key(&vpn.addr())
    }

    /// Remove and return an entry; the caller releases its backing.
    pub fn take(&mut self, vpn: Vpn) -> Option<PageEntry> {
        self.pages.remove(&vpn.addr())
    }

    /// Pin or unpin a page. False if the page has no entry.
    pub fn set_pin(&mut self, vpn: Vpn, pinned: bool) -> bool {
        match self.pages.get_mut(&vpn.addr()) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Addresses of every entry, for teardown sweeps.
    pub fn all_vpns(&self) -> alloc::vec::Vec<Vpn> {
        self.pages.keys().map(|&a| Vpn::containing(a)).collect()
    }
}

impl Default for SupPageTable {
    fn default() -> Self {
        Self::new()
    }
}
