//! Record and node storage on slotted pages.
//!
//! Implements the page format, overflow chains, the free-space registry and
//! the clock page buffer, plus the two stores built from them.

/// Clock page buffer with bounded eviction sweeps.
pub mod buffer;

/// Value codecs applied before values reach a page.
pub mod codec;

/// Open store file: header, buffer and free-space registry.
pub mod file;

/// Bounded registry of pages with reusable space.
pub mod free_space;

/// Key index collaborator used by the keyed record API.
pub mod index;

/// Slotted data pages.
pub mod page;

mod metrics;
mod node_store;
mod options;
mod overflow;
mod record_store;

/// Storage configuration.
pub use options::{
    StoreOptions, DEFAULT_BUFFER_PAGES, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_MAX_FREE_ENTRIES,
    DEFAULT_MIN_FREE, MIN_BUFFER_PAGES,
};

/// Metrics hooks.
pub use metrics::{default_metrics, CounterMetrics, MetricsSnapshot, NoopMetrics, StoreMetrics};

pub use buffer::{BufferStats, ClockPageBuffer};
pub use codec::{CodecKind, ValueCodec};
pub use file::DataFile;
pub use free_space::{FreeSpace, FreeSpaceRegistry};
pub use index::{KeyPredicate, Lookup, MemoryIndex, ValueIndex};
pub use node_store::{NodeStore, RelocationListener};
pub use overflow::{OverflowChain, MAX_CHAIN_LEN};
pub use page::{DataPage, RecordKind, RecordPos};
pub use record_store::{RecordStore, ValueShape};
