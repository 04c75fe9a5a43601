//! Reference-counted page cache with clock eviction.
//!
//! Frames live in a fixed arena indexed by page number. Each touch raises a
//! frame's reference count (saturating at the configured maximum); the sweep
//! walks the arena once per step, decrementing counts, and evicts the first
//! frame that drops below one. Because counts saturate, a bounded number of
//! laps always finds a victim unless every frame is excluded, in which case
//! the insert fails with [`StoreError::BufferExhausted`].
#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::primitives::pager::PagedFile;
use crate::storage::page::DataPage;
use crate::types::page::PAGE_HDR_LEN;
use crate::types::{PageNo, Result, StoreError};

/// Initial reference count for pages that are simply being read.
pub const PRIORITY_DEFAULT: u32 = 1;
/// Initial reference count for record pages that were just written.
pub const PRIORITY_RECORD: u32 = 2;
/// Initial reference count for overflow chain heads, revisited on append.
pub const PRIORITY_CHAIN_HEAD: u32 = 3;
/// Default ceiling for per-frame reference counts.
pub const DEFAULT_MAX_REF_COUNT: u32 = 16;

struct Frame {
    page: DataPage,
    ref_count: u32,
}

impl Frame {
    fn touch(&mut self, max: u32) {
        self.ref_count = self.ref_count.saturating_add(1).min(max);
    }
}

/// Point-in-time buffer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferStats {
    /// Capacity in pages.
    pub buffers: usize,
    /// Pages currently cached.
    pub used: usize,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to go to the file.
    pub misses: u64,
    /// Frames released by the clock sweep.
    pub evictions: u64,
    /// Dirty pages written to the file.
    pub writebacks: u64,
}

impl BufferStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded cache of decoded pages; the only component that writes pages.
pub struct ClockPageBuffer {
    file: PagedFile,
    frames: Vec<Option<Frame>>,
    index: FxHashMap<PageNo, usize>,
    vacant: Vec<usize>,
    hand: usize,
    max_ref_count: u32,
    stats: BufferStats,
}

impl ClockPageBuffer {
    /// Buffer of `capacity` frames writing back through `file`.
    pub fn new(file: PagedFile, capacity: usize, max_ref_count: u32) -> Self {
        Self {
            file,
            frames: (0..capacity).map(|_| None).collect(),
            index: FxHashMap::default(),
            vacant: (0..capacity).rev().collect(),
            hand: 0,
            max_ref_count: max_ref_count.max(1),
            stats: BufferStats {
                buffers: capacity,
                ..BufferStats::default()
            },
        }
    }

    /// Number of frames.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Pages currently cached.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no page is cached.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether `page` is cached.
    pub fn contains(&self, page: PageNo) -> bool {
        self.index.contains_key(&page)
    }

    /// Work area size of the pages this buffer manages.
    pub fn work_size(&self) -> usize {
        self.file.page_size() as usize - PAGE_HDR_LEN
    }

    /// Backing file.
    pub fn file(&self) -> &PagedFile {
        &self.file
    }

    /// Cached page, counting a hit and touching it; `None` counts a miss.
    pub fn get(&mut self, page: PageNo) -> Option<&mut DataPage> {
        match self.index.get(&page).copied() {
            Some(idx) => {
                self.stats.hits += 1;
                let max = self.max_ref_count;
                self.frames.get_mut(idx)?.as_mut().map(|frame| {
                    frame.touch(max);
                    &mut frame.page
                })
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Cached page without touching it or the counters.
    pub fn peek(&self, page: PageNo) -> Option<&DataPage> {
        let idx = *self.index.get(&page)?;
        self.frames.get(idx)?.as_ref().map(|frame| &frame.page)
    }

    /// Current reference count of a cached page.
    pub fn ref_count(&self, page: PageNo) -> Option<u32> {
        let idx = *self.index.get(&page)?;
        self.frames.get(idx)?.as_ref().map(|frame| frame.ref_count)
    }

    /// Caches `page` with `initial_ref` as its eviction priority.
    ///
    /// Re-inserting a cached page only touches the cached copy.
    pub fn insert(&mut self, page: DataPage, initial_ref: u32) -> Result<&mut DataPage> {
        let no = page.no();
        if let Some(idx) = self.index.get(&no).copied() {
            let max = self.max_ref_count;
            let frame = self.frame_mut(idx)?;
            frame.touch(max);
            return Ok(&mut frame.page);
        }
        while self.index.len() >= self.frames.len() {
            self.evict_one(no)?;
        }
        let idx = self.vacant.pop().ok_or(StoreError::BufferExhausted {
            capacity: self.frames.len(),
        })?;
        let ref_count = initial_ref.clamp(1, self.max_ref_count);
        self.frames[idx] = Some(Frame { page, ref_count });
        self.index.insert(no, idx);
        trace!(page = no.0, ref_count, "buffer.insert");
        Ok(&mut self.frame_mut(idx)?.page)
    }

    /// Cached page, reading and decoding it from the file on a miss.
    pub fn load(&mut self, page: PageNo) -> Result<&mut DataPage> {
        if let Some(idx) = self.index.get(&page).copied() {
            self.stats.hits += 1;
            let max = self.max_ref_count;
            let frame = self.frame_mut(idx)?;
            frame.touch(max);
            return Ok(&mut frame.page);
        }
        self.stats.misses += 1;
        let bytes = self.file.read_page(page)?;
        let decoded = DataPage::decode(page, &bytes)?;
        self.insert(decoded, PRIORITY_DEFAULT)
    }

    /// Raises a cached page's reference count to at least `priority`.
    pub fn prioritize(&mut self, page: PageNo, priority: u32) {
        let max = self.max_ref_count;
        if let Some(idx) = self.index.get(&page).copied() {
            if let Some(frame) = self.frames.get_mut(idx).and_then(Option::as_mut) {
                frame.ref_count = frame.ref_count.max(priority.min(max));
            }
        }
    }

    /// Drops a page from the cache, writing it back first if dirty.
    pub fn remove(&mut self, page: PageNo) -> Result<Option<DataPage>> {
        let Some(idx) = self.index.get(&page).copied() else {
            return Ok(None);
        };
        self.write_back(idx)?;
        Ok(self.release(idx).map(|frame| frame.page))
    }

    /// Writes every dirty page without evicting anything.
    pub fn flush(&mut self) -> Result<usize> {
        let mut written = 0;
        for idx in 0..self.frames.len() {
            if self.write_back(idx)? {
                written += 1;
            }
        }
        if written > 0 {
            debug!(written, "buffer.flush");
        }
        Ok(written)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            used: self.index.len(),
            ..self.stats
        }
    }

    /// Page numbers currently cached, in ascending order.
    pub fn cached_pages(&self) -> Vec<PageNo> {
        let mut pages: Vec<PageNo> = self.index.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    fn frame_mut(&mut self, idx: usize) -> Result<&mut Frame> {
        self.frames
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or(StoreError::Invalid("buffer index points at an empty frame"))
    }

    /// Releases one frame, never choosing `incoming` or the page after it.
    fn evict_one(&mut self, incoming: PageNo) -> Result<()> {
        let capacity = self.frames.len();
        let successor = incoming.successor();
        let bound = capacity.saturating_mul(self.max_ref_count as usize + 1);
        for _ in 0..bound {
            let idx = self.hand;
            self.hand = (self.hand + 1) % capacity;
            let Some(frame) = self.frames[idx].as_mut() else {
                continue;
            };
            let no = frame.page.no();
            if no == incoming || Some(no) == successor {
                continue;
            }
            frame.ref_count = frame.ref_count.saturating_sub(1);
            if frame.ref_count < 1 {
                let dirty = self.write_back(idx)?;
                self.release(idx);
                self.stats.evictions += 1;
                debug!(page = no.0, dirty, "buffer.evict");
                return Ok(());
            }
        }
        warn!(capacity, incoming = incoming.0, "buffer.exhausted");
        Err(StoreError::BufferExhausted { capacity })
    }

    fn write_back(&mut self, idx: usize) -> Result<bool> {
        let Some(frame) = self.frames.get_mut(idx).and_then(Option::as_mut) else {
            return Ok(false);
        };
        if !frame.page.is_dirty() {
            return Ok(false);
        }
        let bytes = frame.page.to_bytes()?;
        self.file.write_page(frame.page.no(), &bytes)?;
        frame.page.mark_clean();
        self.stats.writebacks += 1;
        Ok(true)
    }

    fn release(&mut self, idx: usize) -> Option<Frame> {
        let frame = self.frames.get_mut(idx)?.take()?;
        self.index.remove(&frame.page.no());
        self.vacant.push(idx);
        Some(frame)
    }
}
