use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Hooks the record store calls as values move between storage shapes.
///
/// Counters live in the implementation, never in process-wide state, so
/// two stores opened side by side report independently.
pub trait StoreMetrics: Send + Sync {
    /// A value was stored; `overflow` tells whether it went to a chain.
    fn value_stored(&self, overflow: bool);

    /// A value was removed.
    fn value_removed(&self);

    /// A value was extended by `bytes`.
    fn value_appended(&self, bytes: usize);

    /// An overflow value shrank back onto a single page.
    fn chain_collapsed(&self);

    /// An empty record page was returned to the file.
    fn page_reclaimed(&self);

    /// A free-space candidate turned out to hold less than recorded.
    fn stale_candidate(&self);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn value_stored(&self, _overflow: bool) {}
    fn value_removed(&self) {}
    fn value_appended(&self, _bytes: usize) {}
    fn chain_collapsed(&self) {}
    fn page_reclaimed(&self) {}
    fn stale_candidate(&self) {}
}

/// Atomic counters for every [`StoreMetrics`] event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Values stored on a single page.
    pub inline_stored: AtomicU64,
    /// Values stored as overflow chains.
    pub overflow_stored: AtomicU64,
    /// Values removed.
    pub removed: AtomicU64,
    /// Append calls.
    pub appends: AtomicU64,
    /// Bytes added by appends.
    pub appended_bytes: AtomicU64,
    /// Chains collapsed to single-page records.
    pub chains_collapsed: AtomicU64,
    /// Record pages reclaimed after their last record left.
    pub pages_reclaimed: AtomicU64,
    /// Free-space registry entries found stale.
    pub stale_candidates: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn value_stored(&self, overflow: bool) {
        if overflow {
            self.overflow_stored.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inline_stored.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn value_removed(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    fn value_appended(&self, bytes: usize) {
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.appended_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn chain_collapsed(&self) {
        self.chains_collapsed.fetch_add(1, Ordering::Relaxed);
    }

    fn page_reclaimed(&self) {
        self.pages_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    fn stale_candidate(&self) {
        self.stale_candidates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Values stored on a single page.
    pub inline_stored: u64,
    /// Values stored in an overflow chain.
    pub overflow_stored: u64,
    /// Values removed.
    pub removed: u64,
    /// Append calls.
    pub appends: u64,
    /// Bytes added by appends.
    pub appended_bytes: u64,
    /// Chains rewritten into a single page record.
    pub chains_collapsed: u64,
    /// Emptied record pages returned to the free list.
    pub pages_reclaimed: u64,
    /// Registry candidates that turned out too full.
    pub stale_candidates: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inline_stored: self.inline_stored.load(Ordering::Relaxed),
            overflow_stored: self.overflow_stored.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            appends: self.appends.load(Ordering::Relaxed),
            appended_bytes: self.appended_bytes.load(Ordering::Relaxed),
            chains_collapsed: self.chains_collapsed.load(Ordering::Relaxed),
            pages_reclaimed: self.pages_reclaimed.load(Ordering::Relaxed),
            stale_candidates: self.stale_candidates.load(Ordering::Relaxed),
        }
    }
}

/// Default metrics sink.
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}
