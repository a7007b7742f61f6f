//! The page-fault classifier and its per-case handlers.

use alloc::vec;

use crate::addr::{pg_round_down, PG_SIZE, PHYS_BASE, STACK_LIMIT, USER_BASE};
use crate::page::{PageKind, PageLocation};
use crate::task::Task;
use crate::Vm;

/// The faulting task must be terminated with status -1.
#[derive(Debug, PartialEq, Eq)]
pub struct Killed;

impl Killed {
    pub fn status(&self) -> i32 {
        -1
    }
}

impl Vm {
    /// Classify a user page fault and materialise the page, or decide
    /// the task dies. `esp` is the user stack pointer saved at trap
    /// entry; the error bits mirror the hardware fault code.
    pub fn handle_fault(
        &self,
        task: &mut Task,
        fault_addr: usize,
        esp: usize,
        not_present: bool,
        write: bool,
        _user: bool,
    ) -> Result<(), Killed> {
        self.faults.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        // Access-rights violations are never recoverable.
        if !not_present {
            warn!("rights violation at {:#x}", fault_addr);
            return Err(Killed);
        }
        if fault_addr < USER_BASE || fault_addr >= PHYS_BASE {
            return Err(Killed);
        }
        let page = pg_round_down(fault_addr);

        // A page with bytes in swap must come back before any other
        // classification; the resident expectation wins.
        if let Some(entry) = task.vm.find_vme(page) {
            if let PageLocation::Disk(_) = entry.location {
                let pframe = entry.pframe;
                self.set_pinned(pframe, true);
                let ok = self.swap_in(task, page);
                self.set_pinned(pframe, false);
                assert!(ok, "swap-in failed at {:#x}", page);
                return Ok(());
            }
        }

        if task.vm.find_vme(page).is_none() {
            let probe = esp <= fault_addr
                || fault_addr == esp.wrapping_sub(4)
                || fault_addr == esp.wrapping_sub(32);
            let capped = PHYS_BASE - page <= STACK_LIMIT;
            if probe && capped {
                self.handle_stack_fault(task, fault_addr);
                return Ok(());
            }
            return Err(Killed);
        }

        let (writable, is_mmap, is_elf) = {
            let entry = task.vm.find_vme(page).unwrap();
            (
                entry.writable,
                matches!(entry.kind, PageKind::MmapBacked { .. }),
                matches!(entry.kind, PageKind::ElfBacked(_)),
            )
        };
        if write && !writable {
            return Err(Killed);
        }
        if is_mmap {
            self.handle_mmap_fault(task, fault_addr);
            Ok(())
        } else if is_elf {
            self.handle_load_elf(task, fault_addr);
            Ok(())
        } else {
            Err(Killed)
        }
    }

    /// Pre-materialise stack pages covering a user buffer, so a
    /// syscall can fill it without faulting mid-copy. Pages that do
    /// not look like stack are left alone.
    pub fn borrow_stack(&self, task: &mut Task, esp: usize, addr: usize, size: usize) {
        let mut req = pg_round_down(addr);
        while req < addr + size {
            if task.vm.find_vme(req).is_none() {
                let probe = esp <= req
                    || req == esp.wrapping_sub(4)
                    || req == esp.wrapping_sub(32);
                let capped = req >= USER_BASE
                    && req < PHYS_BASE
                    && PHYS_BASE - req <= STACK_LIMIT;
                if probe && capped {
                    self.handle_stack_fault(task, req);
                }
            }
            req += PG_SIZE;
        }
    }

    /// Drop a borrowed stack range page by page.
    pub fn return_stack(&self, task: &mut Task, addr: usize, size: usize) {
        let mut req = pg_round_down(addr);
        while req < addr + size {
            self.delete_vme(task, req);
            req += PG_SIZE;
        }
    }

    /// Materialise one anonymous page at `vaddr` outside the fault
    /// path, for heap and null-page setup. Fails if the page already
    /// has an entry.
    pub fn map_anonymous_page(&self, task: &mut Task, vaddr: usize, writable: bool) -> bool {
        let page = pg_round_down(vaddr);
        if task.vm.find_vme(page).is_some() {
            return false;
        }
        let page_id = self.alloc_pframe(task, true);
        self.insert_vme(
            task,
            page,
            writable,
            PageKind::Anonymous,
            PageLocation::Memory,
            Some(page_id),
        )
        .expect("anonymous page raced into the SPT");
        task.pagedir.set_page(page, page_id, writable)
    }

    /// Materialise a zero stack page, first ensuring the page above is
    /// present so the stack stays contiguous.
    fn handle_stack_fault(&self, task: &mut Task, fault_addr: usize) {
        let page = pg_round_down(fault_addr);
        let above = page + PG_SIZE;
        if above < PHYS_BASE && task.vm.find_vme(above).is_none() {
            self.handle_stack_fault(task, above);
        }
        let page_id = self.alloc_pframe(task, true);
        self.insert_vme(
            task,
            page,
            true,
            PageKind::Anonymous,
            PageLocation::Memory,
            Some(page_id),
        )
        .expect("stack page raced into the SPT");
        let installed = task.pagedir.set_page(page, page_id, true);
        assert!(installed);
    }

    /// Demand-load an executable page: read the recorded span of the
    /// ELF file, zero the tail, install with the entry's writability.
    fn handle_load_elf(&self, task: &mut Task, fault_addr: usize) {
        let page = pg_round_down(fault_addr);
        let (mapping, writable, pframe_id) = {
            let entry = task.vm.find_vme(page).expect("elf fault without entry");
            match &entry.kind {
                PageKind::ElfBacked(m) => (m.clone(), entry.writable, entry.pframe),
                _ => unreachable!(),
            }
        };
        let page_id = self.alloc_pframe(task, true);
        let mut buf = vec![0u8; PG_SIZE];
        {
            let _fs = self.fs.lock();
            let n = mapping
                .inode
                .read_at(mapping.ofs, &mut buf[..mapping.rbytes])
                .expect("executable read failed");
            assert_eq!(n, mapping.rbytes, "short read from executable");
        }
        self.install_loaded(page_id, pframe_id, &buf);
        task.vm.find_vme_mut(page).unwrap().location = PageLocation::Memory;
        let installed = task.pagedir.set_page(page, page_id, writable);
        assert!(installed, "elf page already installed");
    }

    /// Same shape over the mapped file object; the filesystem lock is
    /// held for the read.
    fn handle_mmap_fault(&self, task: &mut Task, fault_addr: usize) {
        let page = pg_round_down(fault_addr);
        let (mapping, writable, pframe_id) = {
            let entry = task.vm.find_vme(page).expect("mmap fault without entry");
            match &entry.kind {
                PageKind::MmapBacked { map, .. } => (map.clone(), entry.writable, entry.pframe),
                _ => unreachable!(),
            }
        };
        let page_id = self.alloc_pframe(task, true);
        let mut buf = vec![0u8; PG_SIZE];
        {
            let _fs = self.fs.lock();
            let n = mapping
                .inode
                .read_at(mapping.ofs, &mut buf[..mapping.rbytes])
                .expect("mapped file read failed");
            assert_eq!(n, mapping.rbytes, "short read from mapped file");
        }
        self.install_loaded(page_id, pframe_id, &buf);
        task.vm.find_vme_mut(page).unwrap().location = PageLocation::Memory;
        let installed = task.pagedir.set_page(page, page_id, writable);
        assert!(installed, "mmap page already installed");
    }

    /// Copy loaded bytes into the frame and reattach the pframe.
    fn install_loaded(
        &self,
        page_id: crate::frame::PageId,
        pframe_id: crate::frame::PframeId,
        buf: &[u8],
    ) {
        let mut frames = self.frames.lock();
        frames.page_mut(page_id).copy_from_slice(buf);
        {
            let pf = frames.pframe_mut(pframe_id);
            pf.page = Some(page_id);
            pf.cnt = 0;
        }
        if !frames.lru_contains(pframe_id) {
            frames.lru_insert(pframe_id);
        }
    }
}
