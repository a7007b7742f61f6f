//! Per-task registry of memory-mapped file regions.

use alloc::vec::Vec;

use crate::addr::{pg_round_down, PG_SIZE};
use crate::page::{FileMapping, PageKind, PageLocation};
use crate::task::{MmapEntry, Task};
use crate::Vm;

impl Vm {
    /// Bind the file behind `fd` into the SPT page by page, starting
    /// at the page containing `base`. Every page starts never-resident
    /// and is materialised from the file on first touch. Returns the
    /// map id, or `None` when `fd` is a console descriptor, unknown,
    /// or any target page is already claimed.
    pub fn register_mmap(&self, task: &mut Task, fd: usize, base: usize) -> Option<usize> {
        if fd == 0 || fd == 1 {
            return None;
        }
        let inode = task.fd(fd)?.inode().clone();
        let file_len = inode.len();
        let base = pg_round_down(base);
        let pages = (file_len + PG_SIZE - 1) / PG_SIZE;
        for i in 0..pages {
            if task.vm.find_vme(base + i * PG_SIZE).is_some() {
                warn!("mmap target page {:#x} already mapped", base + i * PG_SIZE);
                return None;
            }
        }
        let mut remaining = file_len;
        let mut ofs = 0;
        let mut vaddr = base;
        while remaining > 0 {
            let rbytes = remaining.min(PG_SIZE);
            let zbytes = PG_SIZE - rbytes;
            self.insert_vme(
                task,
                vaddr,
                true,
                PageKind::MmapBacked {
                    map: FileMapping {
                        inode: inode.clone(),
                        ofs,
                        rbytes,
                        zbytes,
                    },
                    map_id: fd,
                },
                PageLocation::Valhalla,
                None,
            )
            .expect("mmap overlap after pre-check");
            task.mmaps.push(MmapEntry { map_id: fd, vaddr });
            ofs += PG_SIZE;
            vaddr += PG_SIZE;
            remaining -= rbytes;
        }
        Some(fd)
    }

    /// Unmap a region: write back every page whose hardware dirty bit
    /// is set, then drop frames, page-table entries and SPT entries.
    pub fn flush_mmap(&self, task: &mut Task, map_id: usize) -> bool {
        let vaddrs: Vec<usize> = task
            .mmaps
            .iter()
            .filter(|m| m.map_id == map_id)
            .map(|m| m.vaddr)
            .collect();
        if vaddrs.is_empty() {
            return false;
        }
        for vaddr in vaddrs {
            if task.pagedir.is_dirty(vaddr) {
                let (inode, ofs, rbytes) = {
                    let entry = task.vm.find_vme(vaddr).expect("mmap page without entry");
                    match &entry.kind {
                        PageKind::MmapBacked { map, .. } => {
                            (map.inode.clone(), map.ofs, map.rbytes)
                        }
                        _ => unreachable!(),
                    }
                };
                let data = {
                    let frames = self.frames.lock();
                    let pte = task.pagedir.lookup(vaddr).expect("dirty page not mapped");
                    frames.page(pte.page)[..rbytes].to_vec()
                };
                let _fs = self.fs.lock();
                match inode.write_at(ofs, &data) {
                    Ok(n) if n == rbytes => {}
                    _ => return false,
                }
            }
            task.pagedir.clear_page(vaddr);
            self.delete_vme(task, vaddr);
        }
        true
    }
}
