#![forbid(unsafe_code)]

//! Offline inspection and verification of store files.
//!
//! Every function here opens the file read-only; nothing is repaired.

mod inspect;
mod options;
mod util;
mod verify;

/// File and page summaries.
///
/// Report header fields, page counts by status and per-page record tables.
pub use inspect::{
    inspect_page, page_summary, summarize, summarize_file, FileSummary, PageSummary,
    RecordSummary, StatusCounts,
};

/// Configuration options for opening a store file in admin mode.
pub use options::AdminOpenOptions;

/// Read-only open of either store kind.
pub use util::open_file;

/// Store integrity verification.
///
/// Verifies the page structures of a store file and reports any issues found.
pub use verify::{verify, verify_file, VerifyCounts, VerifyFinding, VerifyReport, VerifySeverity};
