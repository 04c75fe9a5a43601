//! Overflow chains: one value spread across a linked run of pages.
//!
//! The head page (`MULTI_PAGE`) stores the total value length and the page
//! number of the tail; continuation pages (`LOB`) store their own byte count.
//! Every page except the tail is filled to the work area size, so an append
//! only needs the head and the tail.
#![forbid(unsafe_code)]

use tracing::{debug, trace, warn};

use crate::storage::buffer::{PRIORITY_CHAIN_HEAD, PRIORITY_RECORD};
use crate::storage::file::DataFile;
use crate::storage::page::DataPage;
use crate::types::page::PageStatus;
use crate::types::{CorruptionReport, PageNo, Pointer, Result, StoreError};

/// Longest value a chain can hold; the head stores it as a signed 32-bit length.
pub const MAX_CHAIN_LEN: usize = i32::MAX as usize;

/// Handle on a chain, identified by its head page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OverflowChain {
    head: PageNo,
}

impl OverflowChain {
    /// Chain starting at `head`.
    pub fn new(head: PageNo) -> Self {
        Self { head }
    }

    /// Head page of the chain.
    pub fn head(&self) -> PageNo {
        self.head
    }

    /// Whether `slot` is the slot id a chain head issued for its value.
    pub fn owns_slot(head: &DataPage, slot: u16) -> bool {
        head.status() == PageStatus::MultiPage && head.next_slot().checked_sub(1) == Some(slot)
    }

    /// Writes `value` into a new chain and returns it with its slot id.
    pub fn create(file: &mut DataFile, value: &[u8]) -> Result<(Self, u16)> {
        let total = chain_len(value.len())?;
        let work = file.work_size();
        let head = file.allocate_page(PageStatus::MultiPage, PRIORITY_CHAIN_HEAD)?;
        let (first, rest) = value.split_at(value.len().min(work));
        let slot = file.with_page_mut(head, |page| {
            page.work_area_mut()[..first.len()].copy_from_slice(first);
            page.set_data_length(total);
            page.set_record_count(1);
            page.issue_slot()
        })?;
        let (tail, added) = extend(file, head, rest)?;
        file.with_page_mut(head, |page| {
            page.set_last_in_chain(Some(tail));
            Ok(())
        })?;
        trace!(head = head.0, pages = added + 1, len = value.len(), "overflow.create");
        Ok((Self { head }, slot))
    }

    /// Logical length recorded on the head.
    pub fn len(&self, file: &DataFile) -> Result<usize> {
        file.with_page(self.head, |page| {
            expect_status(page, PageStatus::MultiPage)?;
            Ok(page.data_len())
        })
    }

    /// Pages of the chain in order, head first.
    pub fn pages(&self, file: &DataFile) -> Result<Vec<PageNo>> {
        let mut pages = vec![self.head];
        let mut next = file.with_page(self.head, |page| {
            expect_status(page, PageStatus::MultiPage)?;
            Ok(page.next_in_chain())
        })?;
        while let Some(no) = next {
            if pages.len() > file.last_page() as usize {
                return Err(CorruptionReport::page(self.head, "overflow chain does not terminate").into());
            }
            pages.push(no);
            next = file.with_page(no, |page| {
                expect_status(page, PageStatus::Lob)?;
                Ok(page.next_in_chain())
            })?;
        }
        Ok(pages)
    }

    /// Concatenates the chain's bytes.
    ///
    /// A length that disagrees with the head is logged and the bytes are
    /// returned anyway.
    pub fn read(&self, file: &DataFile) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let (total, mut next) = file.with_page(self.head, |page| {
            expect_status(page, PageStatus::MultiPage)?;
            let total = page.data_len();
            out.reserve(total);
            out.extend_from_slice(&page.work_area()[..total.min(page.work_size())]);
            Ok((total, page.next_in_chain()))
        })?;
        let mut pages = 1usize;
        while let Some(no) = next {
            if pages > file.last_page() as usize {
                return Err(CorruptionReport::page(self.head, "overflow chain does not terminate").into());
            }
            pages += 1;
            next = file.with_page(no, |page| {
                expect_status(page, PageStatus::Lob)?;
                let used = page.data_len().min(page.work_size());
                out.extend_from_slice(&page.work_area()[..used]);
                Ok(page.next_in_chain())
            })?;
        }
        if out.len() != total {
            warn!(
                head = self.head.0,
                expected = total,
                found = out.len(),
                pages,
                "overflow.length_mismatch"
            );
        }
        trace!(head = self.head.0, pages, len = out.len(), "overflow.read");
        Ok(out)
    }

    /// Appends `chunk`, touching only the head and the current tail.
    pub fn append(&self, file: &mut DataFile, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let work = file.work_size();
        let (total, last, next) = file.with_page(self.head, |page| {
            expect_status(page, PageStatus::MultiPage)?;
            Ok((page.data_len(), page.last_in_chain(), page.next_in_chain()))
        })?;
        let new_total = chain_len(total + chunk.len())?;
        let tail = match (last, next) {
            (Some(tail), _) => tail,
            (None, None) => self.head,
            (None, Some(_)) => {
                warn!(head = self.head.0, "overflow.missing_tail_link");
                *self.pages(file)?.last().unwrap_or(&self.head)
            }
        };
        let used = if tail == self.head {
            total.min(work)
        } else {
            file.with_page(tail, |page| {
                expect_status(page, PageStatus::Lob)?;
                Ok(page.data_len())
            })?
        };
        let fill = work.saturating_sub(used).min(chunk.len());
        if fill > 0 {
            let is_head = tail == self.head;
            file.with_page_mut(tail, |page| {
                page.work_area_mut()[used..used + fill].copy_from_slice(&chunk[..fill]);
                if !is_head {
                    page.set_data_length((used + fill) as u32);
                }
                Ok(())
            })?;
        }
        let (new_tail, added) = extend(file, tail, &chunk[fill..])?;
        file.with_page_mut(self.head, |page| {
            page.set_data_length(new_total);
            page.set_last_in_chain(Some(new_tail));
            Ok(())
        })?;
        trace!(
            head = self.head.0,
            appended = chunk.len(),
            pages_added = added,
            len = new_total,
            "overflow.append"
        );
        Ok(())
    }

    /// Replaces the chain's value in place, reusing its pages and adding or
    /// releasing pages as the length requires.
    pub fn rewrite(&self, file: &mut DataFile, value: &[u8]) -> Result<()> {
        let total = chain_len(value.len())?;
        let work = file.work_size();
        let existing = self.pages(file)?;
        let chunks: Vec<&[u8]> = if value.is_empty() {
            vec![value]
        } else {
            value.chunks(work).collect()
        };
        let mut chain: Vec<PageNo> = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let no = match existing.get(i) {
                Some(no) => *no,
                None => file.allocate_page(PageStatus::Lob, PRIORITY_RECORD)?,
            };
            file.with_page_mut(no, |page| {
                page.work_area_mut()[..chunk.len()].copy_from_slice(chunk);
                page.set_data_length(if i == 0 { total } else { chunk.len() as u32 });
                page.set_next_in_chain(None);
                Ok(())
            })?;
            if let Some(prev) = chain.last().copied() {
                file.with_page_mut(prev, |page| {
                    page.set_next_in_chain(Some(no));
                    Ok(())
                })?;
            }
            chain.push(no);
        }
        let tail = chain.last().copied().unwrap_or(self.head);
        file.with_page_mut(self.head, |page| {
            page.set_last_in_chain(Some(tail));
            Ok(())
        })?;
        for leftover in existing.iter().skip(chain.len()) {
            file.free_page(*leftover)?;
        }
        debug!(
            head = self.head.0,
            pages = chain.len(),
            released = existing.len().saturating_sub(chain.len()),
            len = value.len(),
            "overflow.rewrite"
        );
        Ok(())
    }

    /// Releases every page of the chain, head included.
    pub fn delete(self, file: &mut DataFile) -> Result<usize> {
        let pages = self.pages(file)?;
        for no in &pages {
            file.free_page(*no)?;
        }
        debug!(head = self.head.0, pages = pages.len(), "overflow.delete");
        Ok(pages.len())
    }

    /// Pointer addressing this chain's value.
    pub fn pointer(&self, slot: u16) -> Pointer {
        Pointer::new(self.head, slot)
    }
}

/// Links fresh continuation pages holding `bytes` after `tail`; returns the
/// new tail and the number of pages added.
fn extend(file: &mut DataFile, mut tail: PageNo, bytes: &[u8]) -> Result<(PageNo, usize)> {
    let mut added = 0;
    for chunk in bytes.chunks(file.work_size()) {
        let no = file.allocate_page(PageStatus::Lob, PRIORITY_RECORD)?;
        file.with_page_mut(no, |page| {
            page.work_area_mut()[..chunk.len()].copy_from_slice(chunk);
            page.set_data_length(chunk.len() as u32);
            Ok(())
        })?;
        file.with_page_mut(tail, |page| {
            page.set_next_in_chain(Some(no));
            Ok(())
        })?;
        tail = no;
        added += 1;
    }
    Ok((tail, added))
}

fn chain_len(len: usize) -> Result<u32> {
    if len > MAX_CHAIN_LEN {
        return Err(StoreError::Invalid("value longer than an overflow chain can hold"));
    }
    Ok(len as u32)
}

fn expect_status(page: &DataPage, expected: PageStatus) -> Result<()> {
    if page.status() != expected {
        return Err(CorruptionReport::page(page.no(), "unexpected page status in overflow chain").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::FileKind;
    use crate::storage::options::StoreOptions;
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, DataFile) {
        let dir = tempdir().unwrap();
        let file = DataFile::create(
            dir.path().join("chain.dbx"),
            FileKind::Records,
            StoreOptions::default().buffer_pages(4),
        )
        .unwrap();
        (dir, file)
    }

    fn payload(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = vec![0u8; len];
        rng.fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn ten_thousand_bytes_span_three_pages() -> Result<()> {
        let (_dir, mut file) = setup();
        let value = payload(10_000, 1);
        let (chain, slot) = OverflowChain::create(&mut file, &value)?;
        let pages = chain.pages(&file)?;
        assert_eq!(pages.len(), 3);
        assert_eq!(chain.len(&file)?, 10_000);
        let head = file.page_snapshot(chain.head())?;
        assert_eq!(head.last_in_chain(), pages.last().copied());
        assert!(OverflowChain::owns_slot(&head, slot));
        assert_eq!(file.page_snapshot(pages[1])?.data_len(), file.work_size());
        assert_eq!(chain.read(&file)?, value);
        Ok(())
    }

    #[test]
    fn append_fills_tail_then_links_pages() -> Result<()> {
        let (_dir, mut file) = setup();
        let mut value = payload(5_000, 2);
        let (chain, _) = OverflowChain::create(&mut file, &value)?;
        for round in 0..5u64 {
            let chunk = payload(1_500, 10 + round);
            chain.append(&mut file, &chunk)?;
            value.extend_from_slice(&chunk);
        }
        assert_eq!(chain.len(&file)?, value.len());
        assert_eq!(chain.read(&file)?, value);
        let pages = chain.pages(&file)?;
        assert_eq!(pages.len(), value.len().div_ceil(file.work_size()));
        for no in &pages[1..pages.len() - 1] {
            assert_eq!(file.page_snapshot(*no)?.data_len(), file.work_size());
        }
        Ok(())
    }

    #[test]
    fn rewrite_trims_and_extends() -> Result<()> {
        let (_dir, mut file) = setup();
        let (chain, _) = OverflowChain::create(&mut file, &payload(20_000, 3))?;
        let before = chain.pages(&file)?;

        let shorter = payload(6_000, 4);
        chain.rewrite(&mut file, &shorter)?;
        assert_eq!(chain.read(&file)?, shorter);
        let after = chain.pages(&file)?;
        assert_eq!(after, before[..2].to_vec());
        for released in &before[2..] {
            assert_eq!(file.page_snapshot(*released)?.status(), PageStatus::FreeList);
        }

        let longer = payload(13_000, 5);
        chain.rewrite(&mut file, &longer)?;
        assert_eq!(chain.read(&file)?, longer);
        assert_eq!(chain.pages(&file)?.len(), 4);
        Ok(())
    }

    #[test]
    fn delete_releases_every_page() -> Result<()> {
        let (_dir, mut file) = setup();
        let (chain, _) = OverflowChain::create(&mut file, &payload(9_000, 6))?;
        let pages = chain.pages(&file)?;
        assert_eq!(chain.delete(&mut file)?, pages.len());
        for no in pages {
            assert_eq!(file.page_snapshot(no)?.status(), PageStatus::FreeList);
        }
        Ok(())
    }

    #[test]
    fn short_chain_is_read_with_warning() -> Result<()> {
        let (_dir, mut file) = setup();
        let value = payload(9_000, 7);
        let (chain, _) = OverflowChain::create(&mut file, &value)?;
        file.with_page_mut(chain.head(), |page| {
            page.set_data_length(9_500);
            Ok(())
        })?;
        let read = chain.read(&file)?;
        assert_eq!(read, value);
        Ok(())
    }

    #[test]
    fn reading_a_record_page_as_chain_is_corruption() -> Result<()> {
        let (_dir, mut file) = setup();
        let page = file.allocate_page(PageStatus::Record, PRIORITY_RECORD)?;
        match OverflowChain::new(page).read(&file) {
            Err(StoreError::Corruption(report)) => assert_eq!(report.page, Some(page)),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }
}
