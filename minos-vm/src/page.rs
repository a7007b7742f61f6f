//! Supplemental page table: per-task descriptors explaining how to
//! materialise each user page.

use alloc::collections::btree_map::{self, BTreeMap};
use alloc::sync::Arc;

use minos_fs::Inode;

use crate::frame::PframeId;

/// A file-backed page source: read `rbytes` at `ofs`, zero the
/// trailing `zbytes`.
#[derive(Clone)]
pub struct FileMapping {
    pub inode: Arc<Inode>,
    pub ofs: usize,
    pub rbytes: usize,
    pub zbytes: usize,
}

pub enum PageKind {
    /// Zero-filled stack or heap page.
    Anonymous,
    /// Demand-loaded executable page.
    ElfBacked(FileMapping),
    /// Memory-mapped file page; written back to the file on eviction
    /// and unmap.
    MmapBacked { map: FileMapping, map_id: usize },
}

/// Where the page's bytes are right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLocation {
    /// Not resident and not in swap; materialised from the backing
    /// source on fault.
    Nowhere,
    Memory,
    /// In swap, at this starting sector of the swap device.
    Disk(u32),
    /// Never yet resident; no swap slot reserved.
    Valhalla,
}

pub struct VmEntry {
    pub vaddr: usize,
    pub writable: bool,
    pub kind: PageKind,
    pub location: PageLocation,
    pub pframe: PframeId,
}

/// Keyed by page-aligned user virtual address.
pub struct VmTable {
    map: BTreeMap<usize, VmEntry>,
}

impl VmTable {
    pub fn new() -> Self {
        VmTable {
            map: BTreeMap::new(),
        }
    }

    pub fn find_vme(&self, vaddr: usize) -> Option<&VmEntry> {
        self.map.get(&vaddr)
    }

    pub fn find_vme_mut(&mut self, vaddr: usize) -> Option<&mut VmEntry> {
        self.map.get_mut(&vaddr)
    }

    pub(crate) fn insert(&mut self, entry: VmEntry) -> bool {
        match self.map.entry(entry.vaddr) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, vaddr: usize) -> Option<VmEntry> {
        self.map.remove(&vaddr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &VmEntry)> {
        self.map.iter()
    }

    pub fn vaddrs(&self) -> impl Iterator<Item = usize> + '_ {
        self.map.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for VmTable {
    fn default() -> Self {
        Self::new()
    }
}
