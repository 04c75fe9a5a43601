use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::pager::FileHeader;
use crate::storage::buffer::DEFAULT_MAX_REF_COUNT;
use crate::storage::codec::CodecKind;
use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HDR_LEN};
use crate::types::{Result, StoreError};

/// Default page buffer capacity.
pub const DEFAULT_BUFFER_PAGES: usize = 64;
/// Smallest page buffer a store accepts.
pub const MIN_BUFFER_PAGES: usize = 4;
/// Pages with this many free bytes or fewer are not considered for reuse.
pub const DEFAULT_MIN_FREE: u32 = 64;
/// Default cap on the free-space registry.
pub const DEFAULT_MAX_FREE_ENTRIES: usize = 128;
/// Default file lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Configuration supplied when creating or opening a store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Physical page size in bytes; fixed when the file is created.
    pub page_size: u32,
    /// Page buffer capacity in pages.
    pub buffer_pages: usize,
    /// Free-space threshold below which a page is not offered for reuse.
    pub min_free: u32,
    /// Maximum entries kept in the free-space registry.
    pub max_free_entries: usize,
    /// How long to wait for the file lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Ceiling for page reference counts, which bounds the eviction sweep.
    pub max_ref_count: u32,
    /// Reject every mutation and open the file read-only.
    pub read_only: bool,
    /// Value codec for newly created record stores.
    pub codec: CodecKind,
    /// Whether `flush` also syncs the file to stable storage.
    pub sync_on_flush: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pages: DEFAULT_BUFFER_PAGES,
            min_free: DEFAULT_MIN_FREE,
            max_free_entries: DEFAULT_MAX_FREE_ENTRIES,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_ref_count: DEFAULT_MAX_REF_COUNT,
            read_only: false,
            codec: CodecKind::Plain,
            sync_on_flush: true,
        }
    }
}

impl StoreOptions {
    /// Sets the physical page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the page buffer capacity.
    pub fn buffer_pages(mut self, pages: usize) -> Self {
        self.buffer_pages = pages;
        self
    }

    /// Sets the reuse threshold for partially filled pages.
    pub fn min_free(mut self, bytes: u32) -> Self {
        self.min_free = bytes;
        self
    }

    /// Sets the free-space registry cap.
    pub fn max_free_entries(mut self, entries: usize) -> Self {
        self.max_free_entries = entries;
        self
    }

    /// Sets the file lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    /// Sets the reference count ceiling of the page buffer.
    pub fn max_ref_count(mut self, count: u32) -> Self {
        self.max_ref_count = count;
        self
    }

    /// Opens read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Selects the value codec for new record stores.
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    /// Controls whether flushes sync the file.
    pub fn sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    /// File lock timeout as a duration.
    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Bytes per page available for records.
    pub fn work_size(&self) -> usize {
        (self.page_size as usize).saturating_sub(PAGE_HDR_LEN)
    }

    /// Rejects combinations that cannot describe a usable store.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(StoreError::Config(format!(
                "page_size must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.buffer_pages < MIN_BUFFER_PAGES {
            return Err(StoreError::Config(format!(
                "buffer_pages must be at least {MIN_BUFFER_PAGES}, got {}",
                self.buffer_pages
            )));
        }
        let header_room = FileHeader::max_free_entries(self.page_size);
        if self.max_free_entries > header_room {
            return Err(StoreError::Config(format!(
                "max_free_entries {} does not fit a {} byte header page (max {header_room})",
                self.max_free_entries, self.page_size
            )));
        }
        if self.min_free as usize >= self.work_size() {
            return Err(StoreError::Config(format!(
                "min_free {} leaves no reusable space in a {} byte work area",
                self.min_free,
                self.work_size()
            )));
        }
        if self.max_ref_count == 0 {
            return Err(StoreError::Config("max_ref_count must be positive".into()));
        }
        Ok(())
    }

    /// Parses options from a TOML document; missing keys keep defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: StoreOptions =
            toml::from_str(text).map_err(|err| StoreError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = StoreOptions::default();
        options.validate().unwrap();
        assert_eq!(options.work_size(), 4064);
        assert_eq!(options.lock_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn builder_overrides_fields() {
        let options = StoreOptions::default()
            .page_size(8192)
            .buffer_pages(16)
            .lock_timeout(Duration::from_millis(250))
            .codec(CodecKind::Snappy)
            .read_only(true);
        assert_eq!(options.page_size, 8192);
        assert_eq!(options.buffer_pages, 16);
        assert_eq!(options.lock_timeout_ms, 250);
        assert_eq!(options.codec, CodecKind::Snappy);
        assert!(options.read_only);
    }

    #[test]
    fn validate_rejects_bad_values() {
        for options in [
            StoreOptions::default().page_size(3000),
            StoreOptions::default().page_size(1024),
            StoreOptions::default().buffer_pages(1),
            StoreOptions::default().page_size(2048).max_free_entries(500),
            StoreOptions::default().min_free(5000),
            StoreOptions::default().max_ref_count(0),
        ] {
            assert!(matches!(options.validate(), Err(StoreError::Config(_))), "{options:?}");
        }
    }

    #[test]
    fn toml_fills_missing_keys_with_defaults() {
        let options = StoreOptions::from_toml_str(
            r#"
            page_size = 8192
            buffer_pages = 12
            codec = "snappy"
            "#,
        )
        .unwrap();
        assert_eq!(options.page_size, 8192);
        assert_eq!(options.buffer_pages, 12);
        assert_eq!(options.codec, CodecKind::Snappy);
        assert_eq!(options.min_free, DEFAULT_MIN_FREE);
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        assert!(matches!(
            StoreOptions::from_toml_str("pagesize = 4096"),
            Err(StoreError::Config(_))
        ));
    }
}
