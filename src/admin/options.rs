use crate::storage::{StoreOptions, DEFAULT_BUFFER_PAGES, DEFAULT_LOCK_TIMEOUT_MS};

/// Common options used when opening a store file for administrative commands.
///
/// Admin commands never write; files are always opened read-only and the
/// page size and codec come from the file header.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Page buffer capacity in pages.
    pub buffer_pages: usize,
    /// Lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            buffer_pages: DEFAULT_BUFFER_PAGES,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl AdminOpenOptions {
    /// Store options for a read-only admin open.
    pub fn store_options(&self) -> StoreOptions {
        let mut options = StoreOptions::default()
            .buffer_pages(self.buffer_pages)
            .read_only(true);
        options.lock_timeout_ms = self.lock_timeout_ms;
        options
    }
}
