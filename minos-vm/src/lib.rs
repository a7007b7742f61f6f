#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Demand-paged virtual memory of the minos teaching kernel.
//!
//! Each task keeps a supplemental page table (SPT) keyed by
//! page-aligned user virtual address; every entry owns a frame
//! descriptor in a process-wide arena threaded into a global LRU.
//! The page-fault classifier dispatches to stack growth, ELF demand
//! load, mmap load or swap-in; eviction writes anonymous and ELF
//! pages to the swap device and mapped pages back to their files.

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use minos_fs::dev::{BlockRole, DeviceRegistry};
use minos_fs::Filesys;

pub mod addr;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod swap;
pub mod task;

pub use crate::fault::Killed;
pub use crate::frame::{PageId, Pframe, PframeId};
pub use crate::page::{FileMapping, PageKind, PageLocation, VmEntry, VmTable};
pub use crate::pagedir::{PageDir, PteFlags};
pub use crate::task::{MmapEntry, Task, TaskId};

use crate::addr::pg_round_down;
use crate::frame::FrameTable;
use crate::swap::SwapSpace;

/// Process-wide virtual memory state: the physical frame pool, the
/// pframe arena with its global LRU, and the swap device.
pub struct Vm {
    pub(crate) fs: Arc<Filesys>,
    /// Guards the frame pool, the pframe arena and the LRU queue.
    pub(crate) frames: Mutex<FrameTable>,
    /// Guards the swap bitmap and device; leaf lock, taken after the
    /// LRU when both are needed.
    pub(crate) swap: Mutex<SwapSpace>,
    next_task: AtomicUsize,
    pub(crate) faults: AtomicU64,
    pub(crate) swap_outs: AtomicU64,
    pub(crate) swap_ins: AtomicU64,
}

impl Vm {
    /// `frame_count` bounds the physical frames available to user
    /// pages. The swap device is resolved by role and may be absent;
    /// it is only required once eviction first needs it.
    pub fn new(fs: Arc<Filesys>, devices: &DeviceRegistry, frame_count: usize) -> Self {
        let swap_dev = devices.get(BlockRole::Swap);
        Vm {
            fs,
            frames: Mutex::new(FrameTable::new(frame_count)),
            swap: Mutex::new(SwapSpace::new(swap_dev)),
            next_task: AtomicUsize::new(1),
            faults: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
        }
    }

    /// Page faults classified so far.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn filesys(&self) -> &Arc<Filesys> {
        &self.fs
    }

    pub fn new_task(&self) -> Task {
        Task::new(self.next_task.fetch_add(1, Ordering::Relaxed))
    }

    /// (swap-outs, swap-ins) performed so far.
    pub fn swap_stats(&self) -> (u64, u64) {
        (
            self.swap_outs.load(Ordering::Relaxed),
            self.swap_ins.load(Ordering::Relaxed),
        )
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    /// Whether the LRU currently holds `id`. Test hook.
    pub fn lru_contains(&self, id: PframeId) -> bool {
        self.frames.lock().lru_contains(id)
    }

    pub(crate) fn set_pinned(&self, id: PframeId, pinned: bool) {
        self.frames.lock().pframe_mut(id).pinned = pinned;
    }

    /// Create an SPT entry with its pframe and thread the pframe into
    /// the LRU in cnt-ascending order. `None` if the page already has
    /// an entry.
    pub fn insert_vme(
        &self,
        task: &mut Task,
        vaddr: usize,
        writable: bool,
        kind: PageKind,
        location: PageLocation,
        page: Option<PageId>,
    ) -> Option<PframeId> {
        let vaddr = pg_round_down(vaddr);
        if task.vm.find_vme(vaddr).is_some() {
            return None;
        }
        let id = {
            let mut frames = self.frames.lock();
            let id = frames.pframe_create(Pframe {
                vaddr,
                task: task.id,
                cnt: 0,
                pinned: false,
                page,
            });
            frames.lru_insert(id);
            id
        };
        let inserted = task.vm.insert(VmEntry {
            vaddr,
            writable,
            kind,
            location,
            pframe: id,
        });
        debug_assert!(inserted);
        Some(id)
    }

    /// Remove the entry for `vaddr`: unhook the pframe from the LRU,
    /// free its physical page, return any reserved swap slot, and drop
    /// the task's mmap binding for the page.
    pub fn delete_vme(&self, task: &mut Task, vaddr: usize) -> bool {
        let vaddr = pg_round_down(vaddr);
        let entry = match task.vm.remove(vaddr) {
            Some(e) => e,
            None => return false,
        };
        {
            let mut frames = self.frames.lock();
            if let Some(page) = frames.pframe(entry.pframe).page {
                frames.pfree(page);
            }
            frames.lru_remove(entry.pframe);
            frames.pframe_free(entry.pframe);
        }
        if let PageLocation::Disk(slot) = entry.location {
            self.swap.lock().release(slot);
        }
        task.pagedir.clear_page(vaddr);
        task.mmaps.retain(|m| m.vaddr != vaddr);
        true
    }

    /// Tear down a task's whole SPT.
    pub fn vm_destroy(&self, task: &mut Task) {
        let vaddrs: Vec<usize> = task.vm.vaddrs().collect();
        for vaddr in vaddrs {
            self.delete_vme(task, vaddr);
        }
    }
}
