use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::primitives::pager::FileKind;
use crate::storage::page::RecordKind;
use crate::storage::{CodecKind, DataFile, FreeSpace};
use crate::types::page::PageStatus;
use crate::types::{PageNo, Result, StoreError};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_file;

const PREVIEW_BYTES: usize = 64;

/// Overview of a store file.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    /// Path the file was opened from.
    pub path: String,
    /// File size on disk.
    pub size_bytes: u64,
    /// Store kind recorded in the header.
    pub kind: FileKind,
    /// On-disk format version.
    pub version: u16,
    /// Value codec recorded in the header.
    pub codec: CodecKind,
    /// Physical page size.
    pub page_size: u32,
    /// Usable bytes per page after the page header.
    pub work_size: usize,
    /// Highest allocated page number.
    pub last_page: u32,
    /// First page of the freed-page chain.
    pub free_head: Option<u32>,
    /// Pages by status.
    pub pages: StatusCounts,
    /// Persisted free-space registry entries.
    pub free_space: Vec<FreeSpace>,
}

/// Pages by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    /// Slotted record pages.
    pub record: u64,
    /// Overflow continuation pages.
    pub lob: u64,
    /// Pages on the freed-page chain.
    pub free_list: u64,
    /// Overflow chain heads.
    pub multi_page: u64,
    /// Pages that failed to decode.
    pub unreadable: u64,
}

/// Header fields and record table of one page.
#[derive(Debug, Clone, Serialize)]
pub struct PageSummary {
    /// Page number.
    pub page: u32,
    /// What the page holds.
    pub status: PageStatus,
    /// Records on the page.
    pub record_count: u16,
    /// Bytes used, or the whole value length on a chain head.
    pub data_length: u32,
    /// Next slot id the page will issue.
    pub next_slot: u16,
    /// Forward page link.
    pub next_in_chain: Option<u32>,
    /// Backward page link, or the tail on a chain head.
    pub last_in_chain: Option<u32>,
    /// Free bytes in the work area.
    pub remaining: usize,
    /// Record table of a record page.
    pub records: Vec<RecordSummary>,
    /// Hex of the first bytes of the work area.
    pub preview: String,
}

/// One entry of a page's record table.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    /// Slot id.
    pub slot: u16,
    /// Offset of the record inside the work area.
    pub offset: usize,
    /// Payload length.
    pub len: usize,
    /// Whether the payload references an overflow chain.
    pub overflow_ref: bool,
    /// Page the record moved to, for a forwarding link.
    pub forward_to: Option<u32>,
}

/// Summarizes the store file at `path`.
pub fn summarize(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<FileSummary> {
    let path = path.as_ref();
    let data = open_file(path, opts)?;
    let mut summary = summarize_file(&data)?;
    summary.path = path.display().to_string();
    summary.size_bytes = fs::metadata(path)?.len();
    Ok(summary)
}

/// Summarizes an open file; path and size are left empty.
pub fn summarize_file(data: &DataFile) -> Result<FileSummary> {
    let header = data.header();
    let mut pages = StatusCounts::default();
    for raw in 1..=data.last_page() {
        match data.page_snapshot(PageNo(raw)) {
            Ok(page) => match page.status() {
                PageStatus::Record => pages.record += 1,
                PageStatus::Lob => pages.lob += 1,
                PageStatus::FreeList => pages.free_list += 1,
                PageStatus::MultiPage => pages.multi_page += 1,
            },
            Err(StoreError::Corruption(_)) => pages.unreadable += 1,
            Err(err) => return Err(err),
        }
    }
    Ok(FileSummary {
        path: String::new(),
        size_bytes: 0,
        kind: header.kind,
        version: header.version,
        codec: data.codec(),
        page_size: header.page_size,
        work_size: data.work_size(),
        last_page: header.last_page,
        free_head: header.free_head.map(|p| p.0),
        pages,
        free_space: data.free_space().entries().to_vec(),
    })
}

/// Describes page `page` of the store file at `path`.
pub fn inspect_page(path: impl AsRef<Path>, opts: &AdminOpenOptions, page: u32) -> Result<PageSummary> {
    let data = open_file(path.as_ref(), opts)?;
    page_summary(&data, PageNo(page))
}

/// Describes one page of an open file.
pub fn page_summary(data: &DataFile, no: PageNo) -> Result<PageSummary> {
    let page = data.page_snapshot(no)?;
    let mut records = Vec::new();
    if page.status() == PageStatus::Record {
        for pos in page.records() {
            let pos = pos?;
            records.push(RecordSummary {
                slot: pos.slot,
                offset: pos.offset,
                len: pos.len,
                overflow_ref: pos.kind == RecordKind::OverflowRef,
                forward_to: match pos.kind {
                    RecordKind::Link(target) => Some(target.0),
                    _ => None,
                },
            });
        }
    }
    let shown = page.data_len().min(page.work_size()).min(PREVIEW_BYTES);
    Ok(PageSummary {
        page: no.0,
        status: page.status(),
        record_count: page.record_count(),
        data_length: page.header().data_length,
        next_slot: page.next_slot(),
        next_in_chain: page.next_in_chain().map(|p| p.0),
        last_in_chain: page.last_in_chain().map(|p| p.0),
        remaining: if page.status() == PageStatus::Record {
            page.remaining()
        } else {
            0
        },
        records,
        preview: hex::encode(&page.work_area()[..shown]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RecordStore, StoreOptions};
    use tempfile::tempdir;

    #[test]
    fn summary_counts_pages_by_status() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i.dbx");
        let store = RecordStore::create(&path, StoreOptions::default())?;
        let pointer = store.store(b"hello")?;
        store.store(&vec![1u8; 10_000])?;
        store.close()?;

        let summary = summarize(&path, &AdminOpenOptions::default())?;
        assert_eq!(summary.kind, FileKind::Records);
        assert_eq!(summary.pages.record, 1);
        assert_eq!(summary.pages.multi_page, 1);
        assert_eq!(summary.pages.lob, 2);
        assert_eq!(summary.size_bytes, 5 * 4096);

        let page = inspect_page(&path, &AdminOpenOptions::default(), pointer.page().0)?;
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].len, 5);
        assert!(page.preview.ends_with(&hex::encode(b"hello")));
        Ok(())
    }
}
