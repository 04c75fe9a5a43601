//! Bounded index of record pages with reusable space.
#![forbid(unsafe_code)]

use tracing::{trace, warn};

use crate::types::PageNo;

/// One registry entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct FreeSpace {
    /// Record page with spare room.
    pub page: PageNo,
    /// Free bytes when the entry was recorded.
    pub free: u32,
}

/// Pages with spare room, sorted ascending by free bytes.
///
/// Scanning from the smallest entry makes the first fit also the tightest
/// fit. The list is capped; on overflow the entries with the least room are
/// dropped first.
#[derive(Clone, Debug)]
pub struct FreeSpaceRegistry {
    entries: Vec<FreeSpace>,
    capacity: usize,
    min_free: u32,
}

impl FreeSpaceRegistry {
    /// Empty registry holding at most `capacity` entries and ignoring pages
    /// with `min_free` bytes or less.
    pub fn new(capacity: usize, min_free: u32) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            capacity,
            min_free,
        }
    }

    /// Rebuilds a registry from persisted `(page, free)` pairs.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (PageNo, u32)>,
        capacity: usize,
        min_free: u32,
    ) -> Self {
        let mut registry = Self::new(capacity, min_free);
        for (page, free) in entries {
            registry.record(page, free);
        }
        registry
    }

    /// Smallest entry offering at least `needed` bytes.
    pub fn find_candidate(&self, needed: usize) -> Option<PageNo> {
        self.entries
            .iter()
            .find(|entry| entry.free as usize >= needed)
            .map(|entry| entry.page)
    }

    /// Records the free space of `page`, replacing any previous entry.
    ///
    /// Pages at or below the minimum threshold are dropped instead. Returns
    /// whether the page is registered afterwards.
    pub fn record(&mut self, page: PageNo, free: u32) -> bool {
        self.forget(page);
        if free <= self.min_free || self.capacity == 0 {
            return false;
        }
        let at = self
            .entries
            .partition_point(|entry| (entry.free, entry.page) < (free, page));
        self.entries.insert(at, FreeSpace { page, free });
        if self.entries.len() > self.capacity {
            let dropped = self.entries.remove(0);
            trace!(page = dropped.page.0, free = dropped.free, "free_space.drop");
            return dropped.page != page;
        }
        true
    }

    /// Removes the entry for `page`; returns whether one existed.
    pub fn forget(&mut self, page: PageNo) -> bool {
        match self.entries.iter().position(|entry| entry.page == page) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    /// Corrects a stale entry after a candidate turned out to hold
    /// `actual_free` bytes rather than what was recorded.
    pub fn reconcile(&mut self, page: PageNo, actual_free: u32) {
        let recorded = self.free_bytes(page);
        warn!(
            page = page.0,
            recorded = recorded.unwrap_or(0),
            actual = actual_free,
            "free_space.reconcile"
        );
        self.record(page, actual_free);
    }

    /// Recorded free bytes for `page`.
    pub fn free_bytes(&self, page: PageNo) -> Option<u32> {
        self.entries
            .iter()
            .find(|entry| entry.page == page)
            .map(|entry| entry.free)
    }

    /// Whether `page` has an entry.
    pub fn contains(&self, page: PageNo) -> bool {
        self.free_bytes(page).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most entries kept before the fullest pages are dropped.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in ascending order of free bytes.
    pub fn entries(&self) -> &[FreeSpace] {
        &self.entries
    }

    /// Pairs in the persisted form.
    pub fn to_pairs(&self) -> Vec<(PageNo, u32)> {
        self.entries.iter().map(|e| (e.page, e.free)).collect()
    }
}
