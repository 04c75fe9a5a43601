//! Identifiers, pointers, on-disk page metadata and the crate error type.
#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

pub mod checksum;
pub mod page;
mod pointer;

pub use pointer::Pointer;

/// Physical page number inside a store file. Page 0 holds the file header.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct PageNo(pub u32);

/// Identifies the document that owns a run of node pages.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct DocumentId(pub u32);

impl PageNo {
    /// The header page; never handed out for data.
    pub const HEADER: PageNo = PageNo(0);

    /// The page that follows this one in file order, if representable.
    pub fn successor(self) -> Option<PageNo> {
        self.0.checked_add(1).map(PageNo)
    }

    /// Decodes an on-disk link where zero and negative values mean "none".
    pub fn from_link(raw: i64) -> Option<PageNo> {
        if raw <= 0 {
            return None;
        }
        u32::try_from(raw).ok().map(PageNo)
    }

    /// Encodes an optional link in the on-disk representation.
    pub fn to_link(link: Option<PageNo>) -> i64 {
        link.map_or(-1, |page| i64::from(page.0))
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

impl From<u32> for DocumentId {
    fn from(value: u32) -> Self {
        DocumentId(value)
    }
}

/// Lock mode named in a [`StoreError::LockTimeout`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Shared access for reads.
    Read,
    /// Exclusive access for mutations.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Context attached to a consistency failure so repair tooling can locate it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CorruptionReport {
    /// Page on which the inconsistency was observed.
    pub page: Option<PageNo>,
    /// Record pointer being resolved, when there was one.
    pub pointer: Option<Pointer>,
    /// What was wrong.
    pub reason: &'static str,
    /// Length the structure claimed.
    pub expected: Option<u64>,
    /// Length actually found.
    pub found: Option<u64>,
}

impl CorruptionReport {
    /// Starts a report for a problem on `page`.
    pub fn page(page: PageNo, reason: &'static str) -> Self {
        Self {
            page: Some(page),
            pointer: None,
            reason,
            expected: None,
            found: None,
        }
    }

    /// Starts a report for a problem resolving `pointer`.
    pub fn pointer(pointer: Pointer, reason: &'static str) -> Self {
        Self {
            page: Some(pointer.page()),
            pointer: Some(pointer),
            reason,
            expected: None,
            found: None,
        }
    }

    /// Starts a report not tied to a page, such as a damaged file header.
    pub fn file(reason: &'static str) -> Self {
        Self {
            page: None,
            pointer: None,
            reason,
            expected: None,
            found: None,
        }
    }

    /// Attaches the claimed and observed lengths.
    pub fn lengths(mut self, expected: u64, found: u64) -> Self {
        self.expected = Some(expected);
        self.found = Some(found);
        self
    }
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason)?;
        match (self.pointer, self.page) {
            (Some(pointer), _) => write!(f, " (pointer {pointer})")?,
            (None, Some(page)) => write!(f, " (page {page})")?,
            (None, None) => {}
        }
        if let (Some(expected), Some(found)) = (self.expected, self.found) {
            write!(f, ": expected {expected} bytes, found {found}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by the record store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Failure reported by the backing file.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A record does not fit in the remaining space of a page.
    #[error("page {page} full: need {needed} bytes, {available} available")]
    PageFull {
        /// Page that rejected the record.
        page: PageNo,
        /// Bytes the record needs including its slot overhead.
        needed: usize,
        /// Bytes left in the page work area.
        available: usize,
    },
    /// The page issued every slot id it can address.
    #[error("page {page} has no slot ids left")]
    SlotsExhausted {
        /// Page whose slot counter is exhausted.
        page: PageNo,
    },
    /// The pointer does not resolve to a live record.
    #[error("no record at {pointer}")]
    SlotNotFound {
        /// The unresolved pointer.
        pointer: Pointer,
    },
    /// Length or structural mismatch found while reading.
    #[error("corruption: {0}")]
    Corruption(CorruptionReport),
    /// The file lock could not be taken in time.
    #[error("{mode} lock not acquired within {waited:?}")]
    LockTimeout {
        /// Requested lock mode.
        mode: LockMode,
        /// How long the caller waited.
        waited: Duration,
    },
    /// A mutation was attempted on a store opened read-only.
    #[error("store is read-only")]
    ReadOnly,
    /// The page buffer found no evictable entry within its sweep bound.
    #[error("page buffer exhausted: no evictable page among {capacity} buffers")]
    BufferExhausted {
        /// Configured buffer capacity in pages.
        capacity: usize,
    },
    /// Compression or decompression failed.
    #[error("codec: {0}")]
    Codec(#[from] snap::Error),
    /// Options that cannot describe a usable store.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Caller passed an argument the store cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl StoreError {
    /// Shorthand for a corruption error on a page.
    pub fn corruption(page: PageNo, reason: &'static str) -> Self {
        StoreError::Corruption(CorruptionReport::page(page, reason))
    }

    /// True when retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }

    /// True for errors describing damaged or dangling on-disk structures.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StoreError::SlotNotFound { .. } | StoreError::Corruption(_)
        )
    }
}

impl From<CorruptionReport> for StoreError {
    fn from(report: CorruptionReport) -> Self {
        StoreError::Corruption(report)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
