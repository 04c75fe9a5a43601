#![forbid(unsafe_code)]

use super::page::header;
use super::PageNo;

/// Incremental checksum used for headers.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Current digest; does not consume the state.
    fn finalize(&self) -> u32;
}

/// `crc32fast` backed [`Checksum`].
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of an encoded data page: page number, header fields before the
/// checksum slot, and the whole work area.
pub fn page_crc32(page_no: PageNo, page: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&page_no.0.to_be_bytes());
    let split = header::CRC32.start.min(page.len());
    hasher.update(&page[..split]);
    if page.len() > header::CRC32.end {
        hasher.update(&page[header::CRC32.end..]);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::PAGE_HDR_LEN;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn page_crc32_ignores_its_own_slot() {
        let mut page = vec![0u8; PAGE_HDR_LEN + 16];
        let crc = page_crc32(PageNo(1), &page);
        page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(page_crc32(PageNo(1), &page), crc);

        page[PAGE_HDR_LEN] = 1;
        assert_ne!(page_crc32(PageNo(1), &page), crc);
        page[PAGE_HDR_LEN] = 0;
        assert_ne!(page_crc32(PageNo(2), &page), crc);
    }
}
