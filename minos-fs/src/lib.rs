#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! On-disk file system of the minos teaching kernel.
//!
//! Sectors reach the device only through a bounded LRU buffer cache.
//! Files are extensible inodes with 123 direct pointers, one
//! single-indirect and one double-indirect pointer block; directories
//! are files holding a dense array of fixed-size entries. Free space
//! is a bitmap persisted as a regular file. `Filesys` is the facade
//! the syscall layer talks to.

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitvec::prelude::*;
use spin::{Mutex, MutexGuard, RwLock};

use crate::dev::buffer_cache::BufferCache;
use crate::dev::{BlockDevice, BlockRole, DevError, DeviceRegistry};
use crate::dirty::Dirty;
use crate::structs::*;

pub mod dev;
mod dirty;
pub mod file;
pub mod structs;
#[cfg(test)]
mod tests;

pub use crate::file::File;

#[derive(Debug, PartialEq, Eq)]
pub enum FsError {
    /// Empty path, empty or oversize name.
    InvalidPath,
    /// Regular file where a directory was required.
    NotDir,
    EntryNotFound,
    EntryExist,
    DirNotEmpty,
    /// The containing directory has been removed.
    DirRemoved,
    /// Out of sectors.
    NoSpace,
    /// Beyond the double-indirect capacity.
    FileTooLarge,
    /// The device does not hold this file system.
    WrongFs,
    DeviceError,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for FsError {}

impl From<DevError> for FsError {
    fn from(_: DevError) -> Self {
        FsError::DeviceError
    }
}

pub type Result<T> = core::result::Result<T, FsError>;

static ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// Bitmap of allocated sectors. A set bit means allocated. Persisted
/// as a regular file whose inode sits at `FREE_MAP_SECTOR`.
struct FreeMap {
    bits: Dirty<BitVec<u8, Lsb0>>,
}

impl FreeMap {
    fn new(sectors: usize) -> Self {
        FreeMap {
            bits: Dirty::new_dirty(BitVec::repeat(false, sectors)),
        }
    }

    fn from_bytes(bytes: Vec<u8>, sectors: usize) -> Self {
        let mut bits = BitVec::from_vec(bytes);
        bits.truncate(sectors);
        FreeMap {
            bits: Dirty::new(bits),
        }
    }

    /// Find a run of `count` clear bits, set them, return the start.
    fn allocate(&mut self, count: usize) -> Option<SectorId> {
        let len = self.bits.len();
        let mut run = 0;
        let mut start = 0;
        for i in 0..len {
            if !self.bits[i] {
                if run == 0 {
                    start = i;
                }
                run += 1;
                if run == count {
                    for j in start..start + count {
                        self.bits.set(j, true);
                    }
                    return Some(start as SectorId);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn release(&mut self, start: SectorId, count: usize) {
        for i in start as usize..start as usize + count {
            debug_assert!(self.bits[i], "releasing free sector {}", i);
            self.bits.set(i, false);
        }
    }

    fn is_allocated(&self, sector: SectorId) -> bool {
        self.bits[sector as usize]
    }
}

/// In-memory inode. Opening the same sector twice yields the same
/// instance; the open count is the `Arc` strong count.
pub struct Inode {
    sector: SectorId,
    data: RwLock<Dirty<DiskInode>>,
    removed: AtomicBool,
    deny_write_cnt: AtomicU32,
    /// Held across directory scan-and-write sequences.
    dlock: Mutex<()>,
    fs: Arc<Filesys>,
}

impl Inode {
    pub fn inumber(&self) -> SectorId {
        self.sector
    }

    pub fn len(&self) -> usize {
        self.data.read().len_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dir(&self) -> bool {
        self.data.read().is_dir()
    }

    pub fn parent(&self) -> SectorId {
        self.data.read().parent()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Free the inode's sectors when the last opener drops it.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "allow_write without deny_write");
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Short reads
    /// only happen at end of file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let length = data.len_bytes();
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() && pos < length {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(length - pos)
                .min(SECTOR_SIZE - sector_ofs);
            let sector = match locate_sector(&self.fs, &data, pos)? {
                Some(s) => s,
                None => break,
            };
            self.fs
                .cache
                .read_block(sector, sector_ofs, &mut buf[done..done + chunk])?;
            pos += chunk;
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at `offset`, extending the file when the write
    /// ends past the current length. Returns 0 while writes are
    /// denied.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if self.deny_write_cnt.load(Ordering::SeqCst) > 0 {
            return Ok(0);
        }
        let mut data = self.data.write();
        let end = offset + buf.len();
        if end > data.len_bytes() {
            let mut grown: DiskInode = **data;
            grow_blocks(
                &self.fs,
                &mut grown,
                bytes_to_sectors(data.len_bytes()),
                bytes_to_sectors(end),
            )?;
            grown.length = end as i32;
            **data = grown;
            self.fs.cache.write_block(self.sector, 0, data.as_buf())?;
            data.sync();
        }
        let length = data.len_bytes();
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() && pos < length {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(length - pos)
                .min(SECTOR_SIZE - sector_ofs);
            let sector = match locate_sector(&self.fs, &data, pos)? {
                Some(s) => s,
                None => break,
            };
            self.fs
                .cache
                .write_block(sector, sector_ofs, &buf[done..done + chunk])?;
            pos += chunk;
            done += chunk;
        }
        Ok(done)
    }

    fn set_parent_sector(&self, parent: SectorId) {
        self.data.write().set_parent(parent);
    }

    /// Write the cached inode image back to its sector if dirty.
    pub(crate) fn sync_image(&self) -> Result<()> {
        let mut data = self.data.write();
        if data.dirty() {
            self.fs.cache.write_block(self.sector, 0, data.as_buf())?;
            data.sync();
        }
        Ok(())
    }

    /// Scan for the next in-use directory entry from `*pos`.
    pub(crate) fn next_dir_entry(&self, pos: &mut usize) -> Result<Option<String>> {
        let _guard = self.dlock.lock();
        let mut e = DirEntry::empty();
        while self.read_at(*pos, e.as_buf_mut())? == DIR_ENTRY_SIZE {
            *pos += DIR_ENTRY_SIZE;
            if e.in_use() {
                return Ok(Some(e.name().to_string()));
            }
        }
        Ok(None)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // Leave the open table before touching sectors, so a racing
        // opener never observes a half-freed inode.
        {
            let mut inodes = self.fs.inodes.write();
            if let Some(w) = inodes.get(&self.sector) {
                if w.upgrade().is_none() {
                    inodes.remove(&self.sector);
                }
            }
        }
        let data = self.data.get_mut();
        if self.removed.load(Ordering::SeqCst) {
            let _ = free_blocks(&self.fs, data);
            self.fs.release_sector(self.sector, 1);
        } else if data.dirty() {
            let _ = self.fs.cache.write_block(self.sector, 0, data.as_buf());
            data.sync();
        }
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Inode {{ sector: {}, disk: {:?} }}", self.sector, **self.data.read())
    }
}

/// An open directory with a read position.
pub struct DirHandle {
    inode: Arc<Inode>,
    pos: usize,
}

impl DirHandle {
    pub fn new(inode: Arc<Inode>) -> Result<Self> {
        if !inode.is_dir() {
            return Err(FsError::NotDir);
        }
        Ok(DirHandle { inode, pos: 0 })
    }

    /// Fresh handle over the same inode.
    pub fn reopen(&self) -> DirHandle {
        DirHandle {
            inode: self.inode.clone(),
            pos: 0,
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Linear scan for `name`. Returns the entry and its byte offset.
    pub fn lookup(&self, name: &str) -> Result<Option<(DirEntry, usize)>> {
        let _guard = self.inode.dlock.lock();
        self.lookup_locked(name)
    }

    fn lookup_locked(&self, name: &str) -> Result<Option<(DirEntry, usize)>> {
        let mut e = DirEntry::empty();
        let mut ofs = 0;
        while self.inode.read_at(ofs, e.as_buf_mut())? == DIR_ENTRY_SIZE {
            if e.in_use() && e.name() == name {
                return Ok(Some((e, ofs)));
            }
            ofs += DIR_ENTRY_SIZE;
        }
        Ok(None)
    }

    /// Open the inode named by `name`.
    pub fn find(&self, name: &str) -> Result<Arc<Inode>> {
        let entry = {
            let _guard = self.inode.dlock.lock();
            self.lookup_locked(name)?
        };
        match entry {
            Some((e, _)) => self.inode.fs.open_inode(e.inode_sector),
            None => Err(FsError::EntryNotFound),
        }
    }

    /// Add an entry for `name` naming `inode_sector`. The child's
    /// parent back-pointer is set before the entry is published.
    pub fn add(&self, name: &str, inode_sector: SectorId) -> Result<()> {
        let entry = DirEntry::new(name, inode_sector).ok_or(FsError::InvalidPath)?;
        let _guard = self.inode.dlock.lock();
        if self.lookup_locked(name)?.is_some() {
            return Err(FsError::EntryExist);
        }
        self.inode.fs.set_parent(self.inode.sector, inode_sector)?;
        // First free slot, else end of file.
        let mut ofs = 0;
        let mut e = DirEntry::empty();
        loop {
            if self.inode.read_at(ofs, e.as_buf_mut())? < DIR_ENTRY_SIZE {
                break;
            }
            if !e.in_use() {
                break;
            }
            ofs += DIR_ENTRY_SIZE;
        }
        if self.inode.write_at(ofs, entry.as_buf())? != DIR_ENTRY_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Remove the entry for `name` and mark its inode for deletion.
    /// A directory with any live entry is refused.
    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.inode.dlock.lock();
        let (e, ofs) = self
            .lookup_locked(name)?
            .ok_or(FsError::EntryNotFound)?;
        let target = self.inode.fs.open_inode(e.inode_sector)?;
        if target.is_dir() && !dir_is_empty(&target)? {
            return Err(FsError::DirNotEmpty);
        }
        let mut cleared = e;
        cleared.clear();
        if self.inode.write_at(ofs, cleared.as_buf())? != DIR_ENTRY_SIZE {
            return Err(FsError::DeviceError);
        }
        target.mark_removed();
        Ok(())
    }

    /// Next in-use entry name, advancing the handle position.
    pub fn readdir(&mut self) -> Result<Option<String>> {
        let inode = self.inode.clone();
        inode.next_dir_entry(&mut self.pos)
    }
}

fn dir_is_empty(dir: &Arc<Inode>) -> Result<bool> {
    let _guard = dir.dlock.lock();
    let mut e = DirEntry::empty();
    let mut ofs = 0;
    while dir.read_at(ofs, e.as_buf_mut())? == DIR_ENTRY_SIZE {
        if e.in_use() {
            return Ok(false);
        }
        ofs += DIR_ENTRY_SIZE;
    }
    Ok(true)
}

/// Result of walking a path to its final component.
pub enum Walked {
    /// The walk stopped at `dir`; `leaf` is the remaining name, owned
    /// by the caller.
    Found { dir: DirHandle, leaf: String },
    /// Create mode made a new directory for the final component.
    Created(DirHandle),
}

pub struct Filesys {
    cache: BufferCache,
    free_map: RwLock<FreeMap>,
    /// Open-inode table: same sector, same instance.
    inodes: RwLock<BTreeMap<SectorId, Weak<Inode>>>,
    /// Coarse lock serialising facade operations.
    op_lock: Mutex<()>,
    self_ptr: Weak<Filesys>,
}

impl Filesys {
    /// Create a fresh file system on the registered filesystem device.
    pub fn format(devices: &DeviceRegistry) -> Result<Arc<Self>> {
        let device = devices
            .get(BlockRole::Filesys)
            .expect("no file system device found, can't initialize file system");
        let sectors = device.sector_count() as usize;
        let fs = Filesys {
            cache: BufferCache::new(device),
            free_map: RwLock::new(FreeMap::new(sectors)),
            inodes: RwLock::new(BTreeMap::new()),
            op_lock: Mutex::new(()),
            self_ptr: Weak::new(),
        }
        .wrap();
        {
            let mut fm = fs.free_map.write();
            fm.bits.set(FREE_MAP_SECTOR as usize, true);
            fm.bits.set(ROOT_DIR_SECTOR as usize, true);
        }
        let map_bytes = (sectors + 7) / 8;
        fs.make_inode(FREE_MAP_SECTOR, map_bytes, false, ROOT_DIR_SECTOR)?;
        fs.make_inode(ROOT_DIR_SECTOR, 0, true, ROOT_DIR_SECTOR)?;
        fs.sync()?;
        Ok(fs)
    }

    /// Load an existing file system from the registered device.
    pub fn mount(devices: &DeviceRegistry) -> Result<Arc<Self>> {
        let device = devices
            .get(BlockRole::Filesys)
            .expect("no file system device found, can't initialize file system");
        let sectors = device.sector_count() as usize;
        // The free map file doubles as the superblock check; read its
        // inode straight off the device before building any state.
        let mut map_inode = DiskInode::zeroed();
        device.read_at(FREE_MAP_SECTOR, map_inode.as_buf_mut())?;
        if map_inode.magic != INODE_MAGIC || map_inode.len_bytes() != (sectors + 7) / 8 {
            return Err(FsError::WrongFs);
        }
        let fs = Filesys {
            cache: BufferCache::new(device),
            // Clean placeholder; replaced below once the file content
            // is in.
            free_map: RwLock::new(FreeMap::from_bytes(
                alloc::vec![0u8; (sectors + 7) / 8],
                sectors,
            )),
            inodes: RwLock::new(BTreeMap::new()),
            op_lock: Mutex::new(()),
            self_ptr: Weak::new(),
        }
        .wrap();
        let mut bytes = alloc::vec![0u8; map_inode.len_bytes()];
        let mut pos = 0;
        while pos < bytes.len() {
            let chunk = (bytes.len() - pos).min(SECTOR_SIZE - pos % SECTOR_SIZE);
            let sector = locate_sector(&fs, &map_inode, pos)?
                .expect("free map file truncated");
            fs.cache
                .read_block(sector, pos % SECTOR_SIZE, &mut bytes[pos..pos + chunk])?;
            pos += chunk;
        }
        *fs.free_map.write() = FreeMap::from_bytes(bytes, sectors);
        Ok(fs)
    }

    fn wrap(self) -> Arc<Self> {
        let fs = Arc::new(self);
        let weak = Arc::downgrade(&fs);
        let ptr = Arc::into_raw(fs) as *mut Self;
        unsafe {
            (*ptr).self_ptr = weak;
            Arc::from_raw(ptr)
        }
    }

    /// The coarse facade lock, exported for callers (fault paths) that
    /// do file I/O outside the facade.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }

    pub fn root_dir(&self) -> Result<DirHandle> {
        DirHandle::new(self.open_inode(ROOT_DIR_SECTOR)?)
    }

    /// Open the inode at `sector`, deduplicating against the open
    /// table.
    pub fn open_inode(&self, sector: SectorId) -> Result<Arc<Inode>> {
        let mut inodes = self.inodes.write();
        if let Some(w) = inodes.get(&sector) {
            if let Some(inode) = w.upgrade() {
                return Ok(inode);
            }
        }
        let mut disk = DiskInode::zeroed();
        self.cache.read_block(sector, 0, disk.as_buf_mut())?;
        assert_eq!(
            disk.magic, INODE_MAGIC,
            "inode sector {}: bad magic {:#x}",
            sector, disk.magic
        );
        let inode = Arc::new(Inode {
            sector,
            data: RwLock::new(Dirty::new(disk)),
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicU32::new(0),
            dlock: Mutex::new(()),
            fs: self.self_ptr.upgrade().unwrap(),
        });
        inodes.insert(sector, Arc::downgrade(&inode));
        Ok(inode)
    }

    /// Write a fresh inode image at `sector` with `length` bytes of
    /// zero-filled data allocated.
    fn make_inode(
        &self,
        sector: SectorId,
        length: usize,
        is_dir: bool,
        parent: SectorId,
    ) -> Result<()> {
        let mut disk = DiskInode::new(is_dir, parent);
        grow_blocks(self, &mut disk, 0, bytes_to_sectors(length))?;
        disk.length = length as i32;
        self.cache.write_block(sector, 0, disk.as_buf())?;
        Ok(())
    }

    /// Maintain the child's parent back-pointer.
    fn set_parent(&self, parent: SectorId, child: SectorId) -> Result<()> {
        let open = self.inodes.read().get(&child).and_then(|w| w.upgrade());
        if let Some(inode) = open {
            inode.set_parent_sector(parent);
            return Ok(());
        }
        let mut disk = DiskInode::zeroed();
        self.cache.read_block(child, 0, disk.as_buf_mut())?;
        disk.set_parent(parent);
        self.cache.write_block(child, 0, disk.as_buf())?;
        Ok(())
    }

    pub(crate) fn alloc_sector(&self) -> Result<SectorId> {
        let s = self
            .free_map
            .write()
            .allocate(1)
            .ok_or(FsError::NoSpace)?;
        trace!("alloc sector {}", s);
        Ok(s)
    }

    pub(crate) fn release_sector(&self, start: SectorId, count: usize) {
        trace!("release sector {} x{}", start, count);
        self.free_map.write().release(start, count);
    }

    /// True if `sector` is currently allocated. Test hook.
    pub fn sector_allocated(&self, sector: SectorId) -> bool {
        self.free_map.read().is_allocated(sector)
    }

    fn zero_sector(&self, sector: SectorId) -> Result<()> {
        self.cache.write_block(sector, 0, &ZEROS)?;
        Ok(())
    }

    fn read_ptr(&self, block: SectorId, idx: usize) -> Result<SectorId> {
        debug_assert!(idx < PTRS_PER_SECTOR);
        let mut word = 0u32;
        self.cache.read_block(block, idx * 4, word.as_buf_mut())?;
        Ok(word)
    }

    fn write_ptr(&self, block: SectorId, idx: usize, value: SectorId) -> Result<()> {
        debug_assert!(idx < PTRS_PER_SECTOR);
        self.cache.write_block(block, idx * 4, value.as_buf())?;
        Ok(())
    }

    /// Walk `path` from root (absolute, or no current directory) or
    /// from `cwd`, to the directory containing the final component.
    pub fn find_end_dir(
        &self,
        cwd: Option<&DirHandle>,
        path: &str,
        create: bool,
    ) -> Result<Walked> {
        let mut dir = match cwd {
            Some(d) if !path.starts_with('/') => d.reopen(),
            _ => self.root_dir()?,
        };
        let tokens: Vec<&str> = path.split('/').filter(|t| !t.is_empty()).collect();
        let depth = tokens.len();
        if depth == 0 {
            return Err(FsError::InvalidPath);
        }
        for (i, token) in tokens.iter().enumerate() {
            let last = i + 1 == depth;
            match dir.lookup(token)? {
                None => {
                    if create && last {
                        let sector = self.alloc_sector()?;
                        let disk = DiskInode::new(true, dir.inode().inumber());
                        if let Err(e) = self.cache.write_block(sector, 0, disk.as_buf()) {
                            self.release_sector(sector, 1);
                            return Err(e.into());
                        }
                        if let Err(e) = dir.add(token, sector) {
                            self.release_sector(sector, 1);
                            return Err(e);
                        }
                        return Ok(Walked::Created(DirHandle::new(self.open_inode(sector)?)?));
                    }
                    return Ok(Walked::Found {
                        dir,
                        leaf: (*token).to_string(),
                    });
                }
                Some((entry, _)) => {
                    if create && last {
                        return Err(FsError::EntryExist);
                    }
                    let inode = self.open_inode(entry.inode_sector)?;
                    if inode.is_dir() {
                        if last {
                            return Ok(Walked::Found {
                                dir,
                                leaf: (*token).to_string(),
                            });
                        }
                        dir = DirHandle::new(inode)?;
                    } else if !last {
                        warn!("path {:?}: regular file in the middle", path);
                        return Err(FsError::NotDir);
                    } else {
                        return Ok(Walked::Found {
                            dir,
                            leaf: (*token).to_string(),
                        });
                    }
                }
            }
        }
        unreachable!()
    }

    /// Create a regular file of `initial_size` zero bytes at `path`.
    pub fn create(&self, cwd: Option<&DirHandle>, path: &str, initial_size: usize) -> Result<()> {
        if path == "." || path == ".." {
            return Err(FsError::InvalidPath);
        }
        let _op = self.op_lock.lock();
        let (dir, leaf) = match self.find_end_dir(cwd, path, false)? {
            Walked::Found { dir, leaf } => (dir, leaf),
            Walked::Created(_) => unreachable!(),
        };
        if dir.inode().is_removed() {
            return Err(FsError::DirRemoved);
        }
        let sector = self.alloc_sector()?;
        let mut disk = DiskInode::new(false, dir.inode().inumber());
        if let Err(e) = grow_blocks(self, &mut disk, 0, bytes_to_sectors(initial_size)) {
            self.release_sector(sector, 1);
            return Err(e);
        }
        disk.length = initial_size as i32;
        if let Err(e) = self.cache.write_block(sector, 0, disk.as_buf()) {
            let _ = free_blocks(self, &disk);
            self.release_sector(sector, 1);
            return Err(e.into());
        }
        if let Err(e) = dir.add(&leaf, sector) {
            let _ = free_blocks(self, &disk);
            self.release_sector(sector, 1);
            return Err(e);
        }
        Ok(())
    }

    /// Open `path`. `/` is the root, `.` the current directory, `..`
    /// its parent; anything else walks the path.
    pub fn open(&self, cwd: Option<&DirHandle>, path: &str) -> Result<File> {
        let _op = self.op_lock.lock();
        let inode = self.resolve(cwd, path)?;
        if inode.is_removed() {
            return Err(FsError::EntryNotFound);
        }
        Ok(File::new(inode))
    }

    fn resolve(&self, cwd: Option<&DirHandle>, path: &str) -> Result<Arc<Inode>> {
        if path.is_empty() {
            return Err(FsError::InvalidPath);
        }
        if path == "/" {
            return self.open_inode(ROOT_DIR_SECTOR);
        }
        if path == ".." {
            let dir = match cwd {
                Some(d) => d.reopen(),
                None => self.root_dir()?,
            };
            if dir.inode().is_removed() {
                return Err(FsError::DirRemoved);
            }
            return self.open_inode(dir.inode().parent());
        }
        if path == "." {
            return match cwd {
                Some(d) => Ok(d.inode().clone()),
                None => self.open_inode(ROOT_DIR_SECTOR),
            };
        }
        match self.find_end_dir(cwd, path, false)? {
            Walked::Found { dir, leaf } => dir.find(&leaf),
            Walked::Created(_) => unreachable!(),
        }
    }

    /// Remove the file or empty directory at `path`.
    pub fn remove(&self, cwd: Option<&DirHandle>, path: &str) -> Result<()> {
        let _op = self.op_lock.lock();
        if path == "/" {
            return Err(FsError::InvalidPath);
        }
        match self.find_end_dir(cwd, path, false)? {
            Walked::Found { dir, leaf } => dir.remove(&leaf),
            Walked::Created(_) => unreachable!(),
        }
    }

    /// Create the directory named by `path`; intermediate components
    /// must exist.
    pub fn mkdir(&self, cwd: Option<&DirHandle>, path: &str) -> Result<()> {
        if path == "." || path == ".." {
            return Err(FsError::InvalidPath);
        }
        let _op = self.op_lock.lock();
        match self.find_end_dir(cwd, path, true)? {
            Walked::Created(_) => Ok(()),
            Walked::Found { .. } => Err(FsError::EntryNotFound),
        }
    }

    /// Open `path` as a directory, for use as a current directory.
    pub fn open_dir(&self, cwd: Option<&DirHandle>, path: &str) -> Result<DirHandle> {
        let _op = self.op_lock.lock();
        let inode = self.resolve(cwd, path)?;
        if inode.is_removed() {
            return Err(FsError::EntryNotFound);
        }
        DirHandle::new(inode)
    }

    /// Replace the task's current directory.
    pub fn chdir(&self, cwd: &mut Option<DirHandle>, path: &str) -> Result<()> {
        let new = self.open_dir(cwd.as_ref(), path)?;
        *cwd = Some(new);
        Ok(())
    }

    /// Flush everything: free map through its file, dirty inode
    /// images, then every dirty buffer; returns only once the device
    /// has them.
    pub fn sync(&self) -> Result<()> {
        self.free_map_flush()?;
        let open: Vec<Arc<Inode>> = self
            .inodes
            .read()
            .values()
            .filter_map(|w| w.upgrade())
            .collect();
        for inode in &open {
            inode.sync_image()?;
        }
        self.cache.pdflush()?;
        self.cache.device().sync()?;
        Ok(())
    }

    /// Write the bitmap back through its backing file. Avoids the
    /// open-inode table so it stays callable from `Drop`.
    fn free_map_flush(&self) -> Result<()> {
        let bytes = {
            let mut fm = self.free_map.write();
            if !fm.bits.dirty() {
                return Ok(());
            }
            let v = fm.bits.as_raw_slice().to_vec();
            fm.bits.sync();
            v
        };
        let mut map_inode = DiskInode::zeroed();
        self.cache
            .read_block(FREE_MAP_SECTOR, 0, map_inode.as_buf_mut())?;
        assert_eq!(map_inode.magic, INODE_MAGIC, "free map inode corrupted");
        let len = bytes.len().min(map_inode.len_bytes());
        let mut pos = 0;
        while pos < len {
            let chunk = (len - pos).min(SECTOR_SIZE - pos % SECTOR_SIZE);
            let sector = locate_sector(self, &map_inode, pos)?
                .expect("free map file truncated");
            self.cache
                .write_block(sector, pos % SECTOR_SIZE, &bytes[pos..pos + chunk])?;
            pos += chunk;
        }
        Ok(())
    }
}

impl Drop for Filesys {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

/// Map a byte offset to its data sector, through the cache for both
/// indirect tiers. `None` past end of file.
fn locate_sector(fs: &Filesys, disk: &DiskInode, pos: usize) -> Result<Option<SectorId>> {
    if pos >= disk.len_bytes() {
        return Ok(None);
    }
    let idx = pos / SECTOR_SIZE;
    let sector = if idx < MAX_SECTORS_DIRECT {
        disk.direct[idx]
    } else if idx < MAX_SECTORS_INDIRECT {
        fs.read_ptr(disk.indirect, idx - MAX_SECTORS_DIRECT)?
    } else if idx < MAX_SECTORS_DOUBLE {
        let n = idx - MAX_SECTORS_INDIRECT;
        let ib = fs.read_ptr(disk.double_indirect, n / PTRS_PER_SECTOR)?;
        fs.read_ptr(ib, n % PTRS_PER_SECTOR)?
    } else {
        panic!("offset {} beyond double-indirect capacity", pos);
    };
    debug_assert_ne!(sector, 0, "hole in allocated range at byte {}", pos);
    Ok(Some(sector))
}

/// One stage of the growth cascade. Dropping an uncommitted stage
/// releases exactly the sectors this stage allocated and zeroes the
/// pointer slots it wrote.
struct AllocStage<'a> {
    fs: &'a Filesys,
    sectors: Vec<SectorId>,
    slots: Vec<(SectorId, usize)>,
    committed: bool,
}

impl<'a> AllocStage<'a> {
    fn new(fs: &'a Filesys) -> Self {
        AllocStage {
            fs,
            sectors: Vec::new(),
            slots: Vec::new(),
            committed: false,
        }
    }

    fn alloc_zeroed(&mut self) -> Result<SectorId> {
        let s = self.fs.alloc_sector()?;
        self.fs.zero_sector(s)?;
        self.sectors.push(s);
        Ok(s)
    }

    fn record_slot(&mut self, block: SectorId, idx: usize) {
        self.slots.push((block, idx));
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a> Drop for AllocStage<'a> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for &(block, idx) in &self.slots {
            let _ = self.fs.write_ptr(block, idx, 0);
        }
        for &s in &self.sectors {
            self.fs.release_sector(s, 1);
        }
    }
}

/// Grow `disk` from `old_sectors` to `new_sectors` data sectors,
/// allocating tier-appropriate pointer blocks. All new data is
/// zero-filled. On any failure every stage unwinds its own
/// allocations; `disk` is the caller's scratch copy.
fn grow_blocks(
    fs: &Filesys,
    disk: &mut DiskInode,
    old_sectors: usize,
    new_sectors: usize,
) -> Result<()> {
    if new_sectors > MAX_SECTORS_DOUBLE {
        return Err(FsError::FileTooLarge);
    }
    if new_sectors <= old_sectors {
        return Ok(());
    }
    let mut res_diblock = AllocStage::new(fs);
    let mut di_pblock = AllocStage::new(fs);
    let mut di_dblock = AllocStage::new(fs);
    let mut i_pblock = AllocStage::new(fs);
    let mut i_dblock = AllocStage::new(fs);
    let mut d_dblock = AllocStage::new(fs);

    if new_sectors > MAX_SECTORS_INDIRECT {
        if disk.double_indirect == 0 {
            disk.double_indirect = res_diblock.alloc_zeroed()?;
        }
        let lo = old_sectors.max(MAX_SECTORS_INDIRECT) - MAX_SECTORS_INDIRECT;
        let hi = new_sectors - MAX_SECTORS_INDIRECT;
        for l in lo / PTRS_PER_SECTOR..=(hi - 1) / PTRS_PER_SECTOR {
            if fs.read_ptr(disk.double_indirect, l)? == 0 {
                let s = di_pblock.alloc_zeroed()?;
                di_pblock.record_slot(disk.double_indirect, l);
                fs.write_ptr(disk.double_indirect, l, s)?;
            }
        }
        for n in lo..hi {
            let ib = fs.read_ptr(disk.double_indirect, n / PTRS_PER_SECTOR)?;
            let s = di_dblock.alloc_zeroed()?;
            di_dblock.record_slot(ib, n % PTRS_PER_SECTOR);
            fs.write_ptr(ib, n % PTRS_PER_SECTOR, s)?;
        }
    }

    if new_sectors > MAX_SECTORS_DIRECT && old_sectors < MAX_SECTORS_INDIRECT {
        if disk.indirect == 0 {
            disk.indirect = i_pblock.alloc_zeroed()?;
        }
        let lo = old_sectors.max(MAX_SECTORS_DIRECT) - MAX_SECTORS_DIRECT;
        let hi = new_sectors.min(MAX_SECTORS_INDIRECT) - MAX_SECTORS_DIRECT;
        for k in lo..hi {
            let s = i_dblock.alloc_zeroed()?;
            i_dblock.record_slot(disk.indirect, k);
            fs.write_ptr(disk.indirect, k, s)?;
        }
    }

    if old_sectors < MAX_SECTORS_DIRECT {
        for n in old_sectors..new_sectors.min(MAX_SECTORS_DIRECT) {
            disk.direct[n] = d_dblock.alloc_zeroed()?;
        }
    }

    res_diblock.commit();
    di_pblock.commit();
    di_dblock.commit();
    i_pblock.commit();
    i_dblock.commit();
    d_dblock.commit();
    Ok(())
}

/// Return every sector owned by `disk` to the free map: data blocks,
/// both indirect subtrees, and the pointer blocks themselves.
fn free_blocks(fs: &Filesys, disk: &DiskInode) -> Result<()> {
    for &s in disk.direct.iter() {
        if s != 0 {
            fs.release_sector(s, 1);
        }
    }
    if disk.indirect != 0 {
        for k in 0..PTRS_PER_SECTOR {
            let s = fs.read_ptr(disk.indirect, k)?;
            if s != 0 {
                fs.release_sector(s, 1);
            }
        }
        fs.release_sector(disk.indirect, 1);
    }
    if disk.double_indirect != 0 {
        for l in 0..PTRS_PER_SECTOR {
            let ib = fs.read_ptr(disk.double_indirect, l)?;
            if ib == 0 {
                continue;
            }
            for k in 0..PTRS_PER_SECTOR {
                let s = fs.read_ptr(ib, k)?;
                if s != 0 {
                    fs.release_sector(s, 1);
                }
            }
            fs.release_sector(ib, 1);
        }
        fs.release_sector(disk.double_indirect, 1);
    }
    Ok(())
}
