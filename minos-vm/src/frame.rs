//! Physical frame pool, frame descriptors, and the global LRU.
//!
//! Frame descriptors (pframes) live in an arena and are referred to by
//! identifier; an SPT entry carries the identifier of its pframe, and
//! the pframe carries the entry's virtual address, so neither side
//! owns a pointer into the other.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::addr::PG_SIZE;
use crate::task::TaskId;

pub type PageId = usize;
pub type PframeId = usize;

/// Descriptor of a physical frame owned by one SPT entry. `page` is
/// empty while the contents are swapped out.
pub struct Pframe {
    pub vaddr: usize,
    pub task: TaskId,
    /// Approximate access count; the LRU is kept ascending by it.
    pub cnt: u64,
    pub pinned: bool,
    pub page: Option<PageId>,
}

pub(crate) struct FrameTable {
    pages: Vec<Box<[u8; PG_SIZE]>>,
    free_pages: Vec<PageId>,
    pframes: Vec<Option<Pframe>>,
    free_pframes: Vec<PframeId>,
    /// cnt-ascending queue of pframe ids; the tail is the eviction
    /// victim.
    lru: VecDeque<PframeId>,
}

impl FrameTable {
    pub fn new(frame_count: usize) -> Self {
        let mut pages = Vec::with_capacity(frame_count);
        let mut free_pages = Vec::with_capacity(frame_count);
        for i in 0..frame_count {
            pages.push(Box::new([0u8; PG_SIZE]));
            free_pages.push(frame_count - 1 - i);
        }
        FrameTable {
            pages,
            free_pages,
            pframes: Vec::new(),
            free_pframes: Vec::new(),
            lru: VecDeque::new(),
        }
    }

    pub fn palloc(&mut self, zeroed: bool) -> Option<PageId> {
        let id = self.free_pages.pop()?;
        if zeroed {
            self.pages[id].iter_mut().for_each(|b| *b = 0);
        }
        Some(id)
    }

    pub fn pfree(&mut self, page: PageId) {
        debug_assert!(!self.free_pages.contains(&page));
        self.free_pages.push(page);
    }

    pub fn free_frames(&self) -> usize {
        self.free_pages.len()
    }

    pub fn page(&self, id: PageId) -> &[u8; PG_SIZE] {
        &self.pages[id]
    }

    pub fn page_mut(&mut self, id: PageId) -> &mut [u8; PG_SIZE] {
        &mut self.pages[id]
    }

    pub fn pframe_create(&mut self, pf: Pframe) -> PframeId {
        match self.free_pframes.pop() {
            Some(id) => {
                self.pframes[id] = Some(pf);
                id
            }
            None => {
                self.pframes.push(Some(pf));
                self.pframes.len() - 1
            }
        }
    }

    pub fn pframe_free(&mut self, id: PframeId) {
        debug_assert!(self.pframes[id].is_some());
        self.pframes[id] = None;
        self.free_pframes.push(id);
    }

    pub fn pframe(&self, id: PframeId) -> &Pframe {
        self.pframes[id].as_ref().expect("dead pframe id")
    }

    pub fn pframe_mut(&mut self, id: PframeId) -> &mut Pframe {
        self.pframes[id].as_mut().expect("dead pframe id")
    }

    /// Thread `id` into the queue keeping it cnt-ascending.
    pub fn lru_insert(&mut self, id: PframeId) {
        debug_assert!(!self.lru.contains(&id));
        let cnt = self.pframe(id).cnt;
        let pos = self
            .lru
            .iter()
            .position(|&other| self.pframes[other].as_ref().map_or(false, |p| p.cnt > cnt))
            .unwrap_or_else(|| self.lru.len());
        self.lru.insert(pos, id);
    }

    pub fn lru_remove(&mut self, id: PframeId) {
        if let Some(pos) = self.lru.iter().position(|&x| x == id) {
            self.lru.remove(pos);
        }
    }

    pub fn lru_pop_tail(&mut self) -> Option<PframeId> {
        while let Some(id) = self.lru.pop_back() {
            if self.pframes[id].is_some() {
                return Some(id);
            }
        }
        None
    }

    pub fn lru_push_front(&mut self, id: PframeId) {
        self.lru.push_front(id);
    }

    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    pub fn lru_contains(&self, id: PframeId) -> bool {
        self.lru.contains(&id)
    }

    /// Re-sort ascending after access counters changed.
    pub fn lru_sort(&mut self) {
        let pframes = &self.pframes;
        let mut ids: Vec<PframeId> = self
            .lru
            .iter()
            .copied()
            .filter(|&id| pframes[id].is_some())
            .collect();
        ids.sort_by_key(|&id| pframes[id].as_ref().unwrap().cnt);
        self.lru = ids.into_iter().collect();
    }
}
