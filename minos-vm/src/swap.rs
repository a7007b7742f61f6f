//! Frame allocation under pressure: the swap bitmap, eviction of the
//! LRU tail, and swap-in on fault.

use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::Ordering;

use bitvec::prelude::*;

use minos_fs::dev::BlockDevice;
use minos_fs::structs::SECTOR_SIZE;

use crate::addr::{PG_SIZE, SECTORS_PER_PAGE};
use crate::frame::{FrameTable, PageId};
use crate::page::{PageKind, PageLocation};
use crate::task::Task;
use crate::Vm;

/// Swap device and its slot bitmap; a set bit is an in-use sector.
pub(crate) struct SwapSpace {
    pub(crate) device: Option<Arc<dyn BlockDevice>>,
    bits: BitVec<u8, Lsb0>,
}

impl SwapSpace {
    pub fn new(device: Option<Arc<dyn BlockDevice>>) -> Self {
        let sectors = device.as_ref().map_or(0, |d| d.sector_count() as usize);
        SwapSpace {
            device,
            bits: BitVec::repeat(false, sectors),
        }
    }

    /// Claim a contiguous run of sectors holding one page.
    pub fn alloc_run(&mut self) -> Option<u32> {
        let len = self.bits.len();
        let mut run = 0;
        let mut start = 0;
        for i in 0..len {
            if !self.bits[i] {
                if run == 0 {
                    start = i;
                }
                run += 1;
                if run == SECTORS_PER_PAGE {
                    for j in start..start + SECTORS_PER_PAGE {
                        self.bits.set(j, true);
                    }
                    return Some(start as u32);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    pub fn release(&mut self, start: u32) {
        for i in start as usize..start as usize + SECTORS_PER_PAGE {
            debug_assert!(self.bits[i], "releasing free swap sector {}", i);
            self.bits.set(i, false);
        }
    }
}

impl Vm {
    /// Get a physical frame, evicting once on memory pressure. A
    /// second failure is unrecoverable.
    pub fn alloc_pframe(&self, task: &mut Task, zeroed: bool) -> PageId {
        if let Some(page) = self.frames.lock().palloc(zeroed) {
            return page;
        }
        if !self.swap_out(task) {
            panic!("out of frames and nothing evictable");
        }
        self.frames
            .lock()
            .palloc(zeroed)
            .expect("out of frames after eviction")
    }

    /// Evict the LRU tail: anonymous and ELF pages go to the swap
    /// device, mapped pages are written back to their file. Pinned and
    /// never-resident victims are requeued at the head.
    pub fn swap_out(&self, task: &mut Task) -> bool {
        let (victim_id, vaddr, page_id, data) = {
            let mut frames = self.frames.lock();
            self.lru_update_locked(task, &mut frames);
            let limit = frames.lru_len();
            let mut requeued = 0;
            loop {
                if requeued > limit {
                    return false;
                }
                let id = match frames.lru_pop_tail() {
                    Some(id) => id,
                    None => return false,
                };
                let skip = {
                    let pf = frames.pframe(id);
                    pf.pinned || pf.page.is_none() || pf.task != task.id
                };
                if skip {
                    frames.lru_push_front(id);
                    requeued += 1;
                    continue;
                }
                let (vaddr, page_id) = {
                    let pf = frames.pframe(id);
                    (pf.vaddr, pf.page.unwrap())
                };
                let mut data = vec![0u8; PG_SIZE];
                data.copy_from_slice(frames.page(page_id));
                break (id, vaddr, page_id, data);
            }
        };

        let entry = task
            .vm
            .find_vme_mut(vaddr)
            .expect("evicted frame without SPT entry");
        match &entry.kind {
            PageKind::MmapBacked { map, .. } => {
                let inode = map.inode.clone();
                let (ofs, rbytes) = (map.ofs, map.rbytes);
                let _fs = self.fs.lock();
                match inode.write_at(ofs, &data[..rbytes]) {
                    Ok(n) if n == rbytes => {}
                    _ => panic!("mmap write-back failed at file offset {}", ofs),
                }
                entry.location = PageLocation::Nowhere;
            }
            _ => {
                let mut swap = self.swap.lock();
                let slot = swap.alloc_run().expect("out of swap slots");
                let device = swap.device.clone().expect("no swap device");
                for i in 0..SECTORS_PER_PAGE {
                    device
                        .write_at(
                            slot + i as u32,
                            &data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
                        )
                        .expect("swap write failed");
                }
                entry.location = PageLocation::Disk(slot);
            }
        }

        task.pagedir.clear_page(vaddr);
        {
            let mut frames = self.frames.lock();
            frames.pfree(page_id);
            let pf = frames.pframe_mut(victim_id);
            pf.page = None;
            pf.cnt = 0;
        }
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
        trace!("swap out {:#x}", vaddr);
        true
    }

    /// Bring the page at `vaddr` back from its swap slot, install it
    /// with the entry's writability, and relink the pframe into the
    /// LRU.
    pub fn swap_in(&self, task: &mut Task, vaddr: usize) -> bool {
        let (slot, writable, pframe_id) = match task.vm.find_vme(vaddr) {
            Some(e) => match e.location {
                PageLocation::Disk(slot) => (slot, e.writable, e.pframe),
                _ => return false,
            },
            None => return false,
        };
        let page_id = self.alloc_pframe(task, true);
        let mut data = vec![0u8; PG_SIZE];
        {
            let mut swap = self.swap.lock();
            let device = swap.device.clone().expect("no swap device");
            for i in 0..SECTORS_PER_PAGE {
                device
                    .read_at(
                        slot + i as u32,
                        &mut data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
                    )
                    .expect("swap read failed");
            }
            swap.release(slot);
        }
        {
            let mut frames = self.frames.lock();
            frames.page_mut(page_id).copy_from_slice(&data);
            {
                let pf = frames.pframe_mut(pframe_id);
                pf.page = Some(page_id);
                pf.cnt = 0;
            }
            frames.lru_remove(pframe_id);
            frames.lru_insert(pframe_id);
        }
        task.vm.find_vme_mut(vaddr).unwrap().location = PageLocation::Memory;
        let installed = task.pagedir.set_page(vaddr, page_id, writable);
        assert!(installed, "swap-in found the page already installed");
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
        trace!("swap in {:#x}", vaddr);
        true
    }

    /// Bump the access counter of every page of `task` whose hardware
    /// accessed bit is set and re-sort the LRU ascending.
    pub fn lru_update(&self, task: &Task) {
        let mut frames = self.frames.lock();
        self.lru_update_locked(task, &mut frames);
    }

    pub(crate) fn lru_update_locked(&self, task: &Task, frames: &mut FrameTable) {
        for (vaddr, entry) in task.vm.iter() {
            if task.pagedir.is_accessed(*vaddr) {
                frames.pframe_mut(entry.pframe).cnt += 1;
            }
        }
        frames.lru_sort();
    }
}
