//! Low-level primitives the stores are built on.
//!
//! Positioned file I/O, whole-page access with the file header, and the
//! file-wide timeout lock.

/// File-wide reader/writer lock with bounded waits.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Whole-page access and the file header on page 0.
pub mod pager;
