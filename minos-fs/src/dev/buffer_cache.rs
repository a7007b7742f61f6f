//! Bounded LRU cache of raw sectors with dirty-bit write-back.
//!
//! Every inode body, pointer block and data sector goes through this
//! cache; it is the only path between the file system and the device.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use super::{BlockDevice, Result};
use crate::structs::{SectorId, SECTOR_SIZE};

/// Cache capacity in sectors.
pub const CACHE_SLOTS: usize = 64;
/// Buffer heads sharing one backing page.
const SLOTS_PER_PAGE: usize = 4;
const PAGE_BYTES: usize = SECTOR_SIZE * SLOTS_PER_PAGE;

bitflags! {
    /// Buffer head state bits. DIRTY implies USED.
    struct BhState: u32 {
        const USED  = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

struct BufferHead {
    state: BhState,
    block_nr: SectorId,
}

/// Index-linked circular LRU over the buffer heads; `CACHE_SLOTS` is
/// the sentinel. The element after the sentinel is the eviction victim.
struct Lru {
    prev: [usize; CACHE_SLOTS + 1],
    next: [usize; CACHE_SLOTS + 1],
}

impl Lru {
    fn new() -> Self {
        let mut prev = [0; CACHE_SLOTS + 1];
        let mut next = [0; CACHE_SLOTS + 1];
        for i in 0..=CACHE_SLOTS {
            prev[i] = if i == 0 { CACHE_SLOTS } else { i - 1 };
            next[i] = if i == CACHE_SLOTS { 0 } else { i + 1 };
        }
        Lru { prev, next }
    }

    fn remove(&mut self, id: usize) {
        let (prev, next) = (self.prev[id], self.next[id]);
        self.next[prev] = next;
        self.prev[next] = prev;
    }

    /// Move `id` to the MRU end.
    fn visit(&mut self, id: usize) {
        self.remove(id);
        let tail = self.prev[CACHE_SLOTS];
        self.next[tail] = id;
        self.prev[id] = tail;
        self.next[id] = CACHE_SLOTS;
        self.prev[CACHE_SLOTS] = id;
    }

    fn victim(&self) -> usize {
        self.next[CACHE_SLOTS]
    }
}

struct CacheInner {
    heads: Vec<BufferHead>,
    pages: Vec<Box<[u8; PAGE_BYTES]>>,
    lru: Lru,
}

impl CacheInner {
    fn slice(&self, id: usize) -> &[u8] {
        let base = (id % SLOTS_PER_PAGE) * SECTOR_SIZE;
        &self.pages[id / SLOTS_PER_PAGE][base..base + SECTOR_SIZE]
    }

    fn slice_mut(&mut self, id: usize) -> &mut [u8] {
        let base = (id % SLOTS_PER_PAGE) * SECTOR_SIZE;
        &mut self.pages[id / SLOTS_PER_PAGE][base..base + SECTOR_SIZE]
    }

    /// Reset a head to the free state: zero slice, zero block number.
    fn reset(&mut self, id: usize) {
        self.slice_mut(id).iter_mut().for_each(|b| *b = 0);
        self.heads[id].state = BhState::empty();
        self.heads[id].block_nr = 0;
    }

    fn write_back(&mut self, device: &dyn BlockDevice, id: usize) -> Result<()> {
        if self.heads[id].state.contains(BhState::DIRTY) {
            let sector = self.heads[id].block_nr;
            device.write_at(sector, self.slice(id))?;
            self.heads[id].state.remove(BhState::DIRTY);
        }
        Ok(())
    }

    /// Return the head caching `sector`, claiming and filling one if
    /// needed. The returned head is moved to the MRU end.
    fn find(&mut self, device: &dyn BlockDevice, sector: SectorId) -> Result<usize> {
        let hit = (0..CACHE_SLOTS).find(|&i| {
            self.heads[i].state.contains(BhState::USED) && self.heads[i].block_nr == sector
        });
        let id = match hit {
            Some(id) => id,
            None => {
                let id = match (0..CACHE_SLOTS)
                    .find(|&i| !self.heads[i].state.contains(BhState::USED))
                {
                    Some(free) => free,
                    None => {
                        let victim = self.lru.victim();
                        log::trace!("bcache: evict head {} (sector {})", victim, self.heads[victim].block_nr);
                        self.write_back(device, victim)?;
                        self.reset(victim);
                        victim
                    }
                };
                self.heads[id].state = BhState::USED;
                self.heads[id].block_nr = sector;
                if let Err(e) = device.read_at(sector, {
                    let base = (id % SLOTS_PER_PAGE) * SECTOR_SIZE;
                    &mut self.pages[id / SLOTS_PER_PAGE][base..base + SECTOR_SIZE]
                }) {
                    self.reset(id);
                    return Err(e);
                }
                id
            }
        };
        self.lru.visit(id);
        Ok(id)
    }
}

pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<CacheInner>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let mut heads = Vec::with_capacity(CACHE_SLOTS);
        let mut pages = Vec::with_capacity(CACHE_SLOTS / SLOTS_PER_PAGE);
        for _ in 0..CACHE_SLOTS {
            heads.push(BufferHead {
                state: BhState::empty(),
                block_nr: 0,
            });
        }
        for _ in 0..CACHE_SLOTS / SLOTS_PER_PAGE {
            pages.push(Box::new([0u8; PAGE_BYTES]));
        }
        BufferCache {
            device,
            inner: Mutex::new(CacheInner {
                heads,
                pages,
                lru: Lru::new(),
            }),
        }
    }

    /// Copy `buf.len()` bytes out of the cached sector at `offset`.
    pub fn read_block(&self, sector: SectorId, offset: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset + buf.len() <= SECTOR_SIZE);
        let mut inner = self.inner.lock();
        let id = inner.find(&*self.device, sector)?;
        buf.copy_from_slice(&inner.slice(id)[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copy `buf` into the cached sector at `offset` and mark it dirty.
    pub fn write_block(&self, sector: SectorId, offset: usize, buf: &[u8]) -> Result<()> {
        debug_assert!(offset + buf.len() <= SECTOR_SIZE);
        let mut inner = self.inner.lock();
        let id = inner.find(&*self.device, sector)?;
        inner.slice_mut(id)[offset..offset + buf.len()].copy_from_slice(buf);
        inner.heads[id].state.insert(BhState::DIRTY);
        Ok(())
    }

    /// Write back every used dirty head. Does not invalidate anything.
    pub fn pdflush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in 0..CACHE_SLOTS {
            if inner.heads[id].state.contains(BhState::USED) {
                inner.write_back(&*self.device, id)?;
            }
        }
        Ok(())
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}
