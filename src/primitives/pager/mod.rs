#![forbid(unsafe_code)]

mod meta;

use std::sync::Arc;

use crate::primitives::io::FileIo;
use crate::types::{PageNo, Result, StoreError};

pub use meta::{FileHeader, FileKind, FILE_FORMAT_VERSION, FILE_MAGIC, FREE_ENTRY_LEN, HDR_FIXED_LEN};

/// Whole-page reads and writes against a backing file.
///
/// Page `n` lives at byte offset `n * page_size`; page 0 is the file header.
#[derive(Clone)]
pub struct PagedFile {
    io: Arc<dyn FileIo>,
    page_size: u32,
}

impl PagedFile {
    /// Wraps `io` with a fixed page size.
    pub fn new(io: Arc<dyn FileIo>, page_size: u32) -> Self {
        Self { io, page_size }
    }

    /// Physical page size.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Underlying file handle.
    pub fn io(&self) -> &dyn FileIo {
        self.io.as_ref()
    }

    fn offset(&self, page: PageNo) -> u64 {
        u64::from(page.0) * u64::from(self.page_size)
    }

    /// Reads one full page.
    pub fn read_page(&self, page: PageNo) -> Result<Vec<u8>> {
        if page == PageNo::HEADER {
            return Err(StoreError::Invalid("page 0 holds the file header"));
        }
        let mut buf = vec![0u8; self.page_size as usize];
        self.io.read_at(self.offset(page), &mut buf)?;
        Ok(buf)
    }

    /// Writes one full page.
    pub fn write_page(&self, page: PageNo, buf: &[u8]) -> Result<()> {
        if page == PageNo::HEADER {
            return Err(StoreError::Invalid("page 0 holds the file header"));
        }
        if buf.len() != self.page_size as usize {
            return Err(StoreError::Invalid("page buffer has wrong length"));
        }
        self.io.write_at(self.offset(page), buf)
    }

    /// Number of page-sized slots the file currently spans, header included.
    pub fn pages_on_disk(&self) -> Result<u64> {
        Ok(self.io.len()? / u64::from(self.page_size))
    }

    /// Flushes the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}
