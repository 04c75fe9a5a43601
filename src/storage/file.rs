//! Page file shared by the record and node stores.
//!
//! Owns the header, the page buffer and the free-space registry for one
//! open file. Every page access goes through the buffer.
#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::primitives::pager::{FileHeader, FileKind, PagedFile};
use crate::storage::buffer::{BufferStats, ClockPageBuffer};
use crate::storage::codec::CodecKind;
use crate::storage::free_space::FreeSpaceRegistry;
use crate::storage::options::StoreOptions;
use crate::storage::page::DataPage;
use crate::types::page::{PageStatus, PAGE_HDR_LEN};
use crate::types::{PageNo, Result, StoreError};

/// Open store file.
pub struct DataFile {
    file: PagedFile,
    header: FileHeader,
    pages: Mutex<ClockPageBuffer>,
    free_space: FreeSpaceRegistry,
    options: StoreOptions,
    closed: bool,
}

impl DataFile {
    /// Creates a new file at `path`; fails if it already exists.
    pub fn create(path: impl AsRef<Path>, kind: FileKind, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        if options.read_only {
            return Err(StoreError::ReadOnly);
        }
        let io = StdFileIo::open(path, OpenMode::CreateNew)?;
        Self::create_with_io(Arc::new(io), kind, options)
    }

    /// Creates a new file on top of an arbitrary [`FileIo`].
    pub fn create_with_io(io: Arc<dyn FileIo>, kind: FileKind, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let header = FileHeader::new(kind, options.codec.id(), options.page_size);
        header.store(io.as_ref())?;
        io.sync_all()?;
        info!(?kind, page_size = header.page_size, "file.create");
        Ok(Self::assemble(io, header, options))
    }

    /// Opens an existing file, which must hold a `kind` store.
    pub fn open(path: impl AsRef<Path>, kind: FileKind, options: StoreOptions) -> Result<Self> {
        let mode = if options.read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        let io = StdFileIo::open(path, mode)?;
        Self::open_with_io(Arc::new(io), Some(kind), options)
    }

    /// Opens an existing file on top of an arbitrary [`FileIo`].
    ///
    /// Page size and codec are taken from the header.
    pub fn open_with_io(
        io: Arc<dyn FileIo>,
        expected: Option<FileKind>,
        mut options: StoreOptions,
    ) -> Result<Self> {
        let header = FileHeader::load(io.as_ref())?;
        if let Some(kind) = expected {
            if header.kind != kind {
                return Err(StoreError::Config(format!(
                    "file holds a {:?} store, expected {:?}",
                    header.kind, kind
                )));
            }
        }
        if header.page_size != options.page_size {
            debug!(
                configured = options.page_size,
                on_disk = header.page_size,
                "file.page_size_from_header"
            );
            options.page_size = header.page_size;
        }
        options.max_free_entries = options
            .max_free_entries
            .min(FileHeader::max_free_entries(header.page_size));
        options.codec = CodecKind::from_id(header.codec)?;
        options.validate()?;
        info!(
            kind = ?header.kind,
            page_size = header.page_size,
            last_page = header.last_page,
            free_entries = header.free_space.len(),
            read_only = options.read_only,
            "file.open"
        );
        Ok(Self::assemble(io, header, options))
    }

    fn assemble(io: Arc<dyn FileIo>, header: FileHeader, options: StoreOptions) -> Self {
        let file = PagedFile::new(io, header.page_size);
        let free_space = FreeSpaceRegistry::from_entries(
            header.free_space.iter().copied(),
            options.max_free_entries,
            options.min_free,
        );
        let pages = ClockPageBuffer::new(file.clone(), options.buffer_pages, options.max_ref_count);
        Self {
            file,
            header,
            pages: Mutex::new(pages),
            free_space,
            options,
            closed: false,
        }
    }

    /// Effective options, with page size and codec as stored in the file.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// In-memory copy of the file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Store kind recorded in the header.
    pub fn kind(&self) -> FileKind {
        self.header.kind
    }

    /// Codec fixed at creation.
    pub fn codec(&self) -> CodecKind {
        self.options.codec
    }

    /// Bytes per page available for records.
    pub fn work_size(&self) -> usize {
        self.header.page_size as usize - PAGE_HDR_LEN
    }

    /// Highest allocated page number.
    pub fn last_page(&self) -> u32 {
        self.header.last_page
    }

    /// Whether the file was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Fails with [`StoreError::ReadOnly`] on a read-only file.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn check_page(&self, page: PageNo) -> Result<()> {
        if page == PageNo::HEADER || page.0 > self.header.last_page {
            return Err(StoreError::corruption(page, "page number outside the file"));
        }
        Ok(())
    }

    /// Runs `f` on a page loaded through the buffer.
    pub fn with_page<R>(&self, page: PageNo, f: impl FnOnce(&DataPage) -> Result<R>) -> Result<R> {
        self.check_page(page)?;
        let mut pages = self.pages.lock();
        f(pages.load(page)?)
    }

    /// Runs `f` on a page loaded through the buffer, for mutation.
    pub fn with_page_mut<R>(
        &mut self,
        page: PageNo,
        f: impl FnOnce(&mut DataPage) -> Result<R>,
    ) -> Result<R> {
        self.check_page(page)?;
        f(self.pages.get_mut().load(page)?)
    }

    /// Copy of a page as currently seen by the store, without touching the
    /// buffer's reference counts.
    pub fn page_snapshot(&self, page: PageNo) -> Result<DataPage> {
        self.check_page(page)?;
        let pages = self.pages.lock();
        if let Some(cached) = pages.peek(page) {
            return Ok(cached.clone());
        }
        let bytes = self.file.read_page(page)?;
        DataPage::decode(page, &bytes)
    }

    /// Hands out a page with `status`, reusing the freed-page chain before
    /// extending the file.
    pub fn allocate_page(&mut self, status: PageStatus, priority: u32) -> Result<PageNo> {
        self.ensure_writable()?;
        if let Some(head) = self.header.free_head {
            self.check_page(head)?;
            let pages = self.pages.get_mut();
            let page = pages.load(head)?;
            if page.status() != PageStatus::FreeList {
                return Err(StoreError::corruption(head, "free chain points at a live page"));
            }
            let next = page.next_in_chain();
            page.reset(status);
            pages.prioritize(head, priority);
            self.header.free_head = next;
            debug!(page = head.0, ?status, "file.reuse_page");
            return Ok(head);
        }
        let next = self
            .header
            .last_page
            .checked_add(1)
            .ok_or(StoreError::Invalid("file has no page numbers left"))?;
        let page = DataPage::new(PageNo(next), status, self.work_size());
        self.pages.get_mut().insert(page, priority)?;
        self.header.last_page = next;
        debug!(page = next, ?status, "file.extend");
        Ok(PageNo(next))
    }

    /// Returns a page to the freed-page chain and drops it from the registry.
    pub fn free_page(&mut self, page: PageNo) -> Result<()> {
        self.ensure_writable()?;
        self.check_page(page)?;
        self.free_space.forget(page);
        let free_head = self.header.free_head;
        let cached = self.pages.get_mut().load(page)?;
        if cached.status() == PageStatus::FreeList {
            return Err(StoreError::corruption(page, "page freed twice"));
        }
        cached.reset(PageStatus::FreeList);
        cached.set_next_in_chain(free_head);
        self.header.free_head = Some(page);
        debug!(page = page.0, "file.free_page");
        Ok(())
    }

    /// Registry of record pages with reusable space.
    pub fn free_space(&self) -> &FreeSpaceRegistry {
        &self.free_space
    }

    /// Mutable access to the free-space registry.
    pub fn free_space_mut(&mut self) -> &mut FreeSpaceRegistry {
        &mut self.free_space
    }

    /// Records the current free bytes of a record page.
    pub fn note_free_space(&mut self, page: PageNo, free: usize) {
        let free = u32::try_from(free).unwrap_or(u32::MAX);
        self.free_space.record(page, free);
    }

    /// Raises the eviction priority of a cached page.
    pub fn prioritize(&mut self, page: PageNo, priority: u32) {
        self.pages.get_mut().prioritize(page, priority);
    }

    /// Buffer counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.pages.lock().stats()
    }

    /// Writes dirty pages and the header, then syncs if configured.
    pub fn flush(&mut self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        let written = self.pages.get_mut().flush()?;
        self.header.free_space = self.free_space.to_pairs();
        self.header.store(self.file.io())?;
        if self.options.sync_on_flush {
            self.file.sync()?;
        }
        debug!(
            pages = written,
            last_page = self.header.last_page,
            free_entries = self.header.free_space.len(),
            "file.flush"
        );
        Ok(())
    }

    /// Flushes and marks the file closed.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if self.closed || self.options.read_only {
            return;
        }
        if let Err(err) = self.flush() {
            warn!(error = %err, "file.flush_on_drop_failed");
        }
    }
}
