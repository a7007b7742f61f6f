//! Task-local state the core needs: SPT, page table, descriptor
//! tables, mapped regions, current directory; plus the user-memory
//! access model that drives the fault path.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use minos_fs::{DirHandle, File, Inode};

use crate::addr::{pg_round_down, PG_SIZE, PHYS_BASE};
use crate::fault::Killed;
use crate::page::{FileMapping, PageKind, PageLocation, VmTable};
use crate::pagedir::{PageDir, PteFlags};
use crate::Vm;

pub type TaskId = usize;

/// One page of one mapped region.
pub struct MmapEntry {
    pub map_id: usize,
    pub vaddr: usize,
}

pub struct Task {
    pub id: TaskId,
    pub vm: VmTable,
    pub pagedir: PageDir,
    /// Descriptors 0 and 1 are the console and never hold a file.
    pub fd_table: Vec<Option<File>>,
    pub mmaps: Vec<MmapEntry>,
    pub cwd: Option<DirHandle>,
    /// User stack pointer as saved at the last trap.
    pub esp: usize,
}

impl Task {
    pub(crate) fn new(id: TaskId) -> Self {
        Task {
            id,
            vm: VmTable::new(),
            pagedir: PageDir::new(),
            fd_table: vec![None, None],
            mmaps: Vec::new(),
            cwd: None,
            esp: PHYS_BASE,
        }
    }

    /// Put `file` in the first free descriptor slot at or above 2.
    pub fn open_fd(&mut self, file: File) -> usize {
        match self.fd_table.iter().skip(2).position(|s| s.is_none()) {
            Some(pos) => {
                let fd = pos + 2;
                self.fd_table[fd] = Some(file);
                fd
            }
            None => {
                self.fd_table.push(Some(file));
                self.fd_table.len() - 1
            }
        }
    }

    pub fn fd(&self, fd: usize) -> Option<&File> {
        self.fd_table.get(fd).and_then(|s| s.as_ref())
    }

    pub fn fd_mut(&mut self, fd: usize) -> Option<&mut File> {
        self.fd_table.get_mut(fd).and_then(|s| s.as_mut())
    }

    pub fn close_fd(&mut self, fd: usize) -> Option<File> {
        self.fd_table.get_mut(fd).and_then(|s| s.take())
    }

    /// Map the initial user stack page just below `PHYS_BASE`.
    pub fn setup_stack(&mut self, vm: &Vm) {
        let page = PHYS_BASE - PG_SIZE;
        let page_id = vm.alloc_pframe(self, true);
        vm.insert_vme(
            self,
            page,
            true,
            PageKind::Anonymous,
            PageLocation::Memory,
            Some(page_id),
        )
        .expect("initial stack page already mapped");
        let installed = self.pagedir.set_page(page, page_id, true);
        assert!(installed);
        self.esp = PHYS_BASE;
    }

    /// Loader contract: record one executable page for demand load.
    pub fn map_elf_page(
        &mut self,
        vm: &Vm,
        inode: Arc<Inode>,
        ofs: usize,
        rbytes: usize,
        zbytes: usize,
        writable: bool,
        vaddr: usize,
    ) -> bool {
        debug_assert_eq!(rbytes + zbytes, PG_SIZE);
        vm.insert_vme(
            self,
            vaddr,
            writable,
            PageKind::ElfBacked(FileMapping {
                inode,
                ofs,
                rbytes,
                zbytes,
            }),
            PageLocation::Nowhere,
            None,
        )
        .is_some()
    }

    /// A user-mode load of one byte; faults in the page if needed.
    pub fn load_byte(&mut self, vm: &Vm, addr: usize) -> Result<u8, Killed> {
        loop {
            let page = pg_round_down(addr);
            match self.pagedir.lookup(page) {
                Some(pte) => {
                    self.pagedir.mark_accessed(page);
                    let frames = vm.frames.lock();
                    return Ok(frames.page(pte.page)[addr - page]);
                }
                None => vm.handle_fault(self, addr, self.esp, true, false, true)?,
            }
        }
    }

    /// A user-mode store of one byte; faults in the page if needed. A
    /// store through a read-only mapping raises a rights violation.
    pub fn store_byte(&mut self, vm: &Vm, addr: usize, value: u8) -> Result<(), Killed> {
        loop {
            let page = pg_round_down(addr);
            match self.pagedir.lookup(page) {
                Some(pte) => {
                    if !pte.flags.contains(PteFlags::WRITABLE) {
                        vm.handle_fault(self, addr, self.esp, false, true, true)?;
                        continue;
                    }
                    self.pagedir.mark_dirty(page);
                    let mut frames = vm.frames.lock();
                    frames.page_mut(pte.page)[addr - page] = value;
                    return Ok(());
                }
                None => vm.handle_fault(self, addr, self.esp, true, true, true)?,
            }
        }
    }

    pub fn read_bytes(&mut self, vm: &Vm, addr: usize, buf: &mut [u8]) -> Result<(), Killed> {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.load_byte(vm, addr + i)?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, vm: &Vm, addr: usize, bytes: &[u8]) -> Result<(), Killed> {
        for (i, b) in bytes.iter().enumerate() {
            self.store_byte(vm, addr + i, *b)?;
        }
        Ok(())
    }

    /// Task teardown: flush every mapped region, destroy the SPT,
    /// close descriptors, drop the current directory.
    pub fn exit(&mut self, vm: &Vm) {
        let map_ids: BTreeSet<usize> = self.mmaps.iter().map(|m| m.map_id).collect();
        for id in map_ids {
            vm.flush_mmap(self, id);
        }
        vm.vm_destroy(self);
        self.fd_table.clear();
        self.cwd = None;
    }
}
