//! Model of the per-task hardware page table: the mappings and the
//! accessed/dirty bits the MMU would maintain.

use alloc::collections::BTreeMap;
use bitflags::bitflags;

use crate::addr::pg_ofs;
use crate::frame::PageId;

bitflags! {
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

#[derive(Clone, Copy)]
pub struct Pte {
    pub page: PageId,
    pub flags: PteFlags,
}

pub struct PageDir {
    map: BTreeMap<usize, Pte>,
}

impl PageDir {
    pub fn new() -> Self {
        PageDir {
            map: BTreeMap::new(),
        }
    }

    /// Install a mapping. Fails if the page is already mapped.
    pub fn set_page(&mut self, vaddr: usize, page: PageId, writable: bool) -> bool {
        debug_assert_eq!(pg_ofs(vaddr), 0);
        if self.map.contains_key(&vaddr) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.map.insert(vaddr, Pte { page, flags });
        true
    }

    pub fn clear_page(&mut self, vaddr: usize) {
        debug_assert_eq!(pg_ofs(vaddr), 0);
        self.map.remove(&vaddr);
    }

    pub fn lookup(&self, vaddr: usize) -> Option<Pte> {
        debug_assert_eq!(pg_ofs(vaddr), 0);
        self.map.get(&vaddr).copied()
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.map.contains_key(&vaddr)
    }

    pub fn is_accessed(&self, vaddr: usize) -> bool {
        self.map
            .get(&vaddr)
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    pub fn is_dirty(&self, vaddr: usize) -> bool {
        self.map
            .get(&vaddr)
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    /// What the MMU does on a load.
    pub fn mark_accessed(&mut self, vaddr: usize) {
        if let Some(pte) = self.map.get_mut(&vaddr) {
            pte.flags |= PteFlags::ACCESSED;
        }
    }

    /// What the MMU does on a store.
    pub fn mark_dirty(&mut self, vaddr: usize) {
        if let Some(pte) = self.map.get_mut(&vaddr) {
            pte.flags |= PteFlags::ACCESSED | PteFlags::DIRTY;
        }
    }

    pub fn clear_accessed(&mut self, vaddr: usize) {
        if let Some(pte) = self.map.get_mut(&vaddr) {
            pte.flags.remove(PteFlags::ACCESSED);
        }
    }

    pub fn mapped_count(&self) -> usize {
        self.map.len()
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}
