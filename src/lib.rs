//! Paged variable-length record store.
//!
//! Values are kept as records on fixed-size slotted pages, spill into
//! overflow chains when larger than a page, and reach the disk through a
//! reference-counted clock page buffer.

#![warn(missing_docs)]

pub mod admin;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{NodeStore, RecordStore, StoreOptions};
pub use types::{DocumentId, PageNo, Pointer, Result, StoreError};
