use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;

use crate::primitives::pager::FileKind;
use crate::storage::page::RecordKind;
use crate::storage::{DataFile, DataPage};
use crate::types::page::PageStatus;
use crate::types::{PageNo, Result, StoreError};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_file;

const MAX_FINDINGS: usize = 64;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Wasted or unreachable space; no value is lost.
    Warning,
    /// Damaged structure; values may be unreadable.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Page the finding concerns, if any.
    pub page: Option<u32>,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Pages after the header.
    pub pages: u64,
    /// Slotted record pages.
    pub record_pages: u64,
    /// Overflow chain heads.
    pub chain_heads: u64,
    /// Overflow continuation pages.
    pub chain_pages: u64,
    /// Pages on the freed-page chain.
    pub free_pages: u64,
    /// Records across all record pages, forwarding links included.
    pub records: u64,
    /// Forwarding links left behind by node page splits.
    pub forward_links: u64,
    /// Pages that could not be decoded.
    pub unreadable_pages: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Kind of store the file holds.
    pub kind: FileKind,
    /// Whether verification passed without any error finding.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the pages examined.
    pub counts: VerifyCounts,
}

impl VerifyReport {
    /// Findings of `severity`.
    pub fn count(&self, severity: VerifySeverity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

/// Verifies the store file at `path`, opened read-only.
///
/// # Errors
///
/// Returns an error if the file or its header cannot be read, or on I/O
/// failure while scanning. Damaged pages become findings.
pub fn verify(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<VerifyReport> {
    let data = open_file(path.as_ref(), opts)?;
    verify_file(&data)
}

/// Checks every page of an open file: checksums, record tables, overflow
/// chains against their recorded length, the freed-page chain, page links
/// of node stores and free-space registry entries.
pub fn verify_file(data: &DataFile) -> Result<VerifyReport> {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let last = data.last_page();
    counts.pages = u64::from(last);

    let mut statuses = vec![None; last as usize + 1];
    let mut owned_lob: HashSet<PageNo> = HashSet::new();
    let mut referenced_heads: Vec<(PageNo, PageNo)> = Vec::new();
    let mut forward_links: Vec<(PageNo, u16, PageNo)> = Vec::new();

    for raw in 1..=last {
        let no = PageNo(raw);
        let page = match load(data, no, &mut findings)? {
            Some(page) => page,
            None => {
                counts.unreadable_pages += 1;
                continue;
            }
        };
        statuses[raw as usize] = Some(page.status());
        match page.status() {
            PageStatus::Record => {
                counts.record_pages += 1;
                check_records(
                    &page,
                    &mut counts,
                    &mut referenced_heads,
                    &mut forward_links,
                    &mut findings,
                );
            }
            PageStatus::MultiPage => {
                counts.chain_heads += 1;
                check_chain(data, &page, &mut owned_lob, &mut findings)?;
            }
            PageStatus::Lob => counts.chain_pages += 1,
            PageStatus::FreeList => {}
        }
    }

    for raw in 1..=last {
        let no = PageNo(raw);
        if statuses[raw as usize] == Some(PageStatus::Lob) && !owned_lob.contains(&no) {
            push(&mut findings, VerifySeverity::Warning, Some(no), "overflow page not owned by any chain");
        }
    }

    for (holder, head) in referenced_heads {
        let status = statuses.get(head.0 as usize).copied().flatten();
        if status != Some(PageStatus::MultiPage) {
            push(
                &mut findings,
                VerifySeverity::Error,
                Some(holder),
                format!("overflow reference to page {head} which is not a chain head"),
            );
        }
    }

    for (holder, slot, target) in forward_links {
        let status = statuses.get(target.0 as usize).copied().flatten();
        let resolves = status == Some(PageStatus::Record)
            && load(data, target, &mut findings)?.is_some_and(|p| p.locate(slot).is_ok());
        if !resolves {
            push(
                &mut findings,
                VerifySeverity::Error,
                Some(holder),
                format!("forwarding link in slot {slot} does not resolve on page {target}"),
            );
        }
    }

    check_free_chain(data, &statuses, &mut counts, &mut findings)?;

    if data.kind() == FileKind::Nodes {
        check_node_links(data, &statuses, &mut findings)?;
    }

    for entry in data.free_space().entries() {
        let status = statuses.get(entry.page.0 as usize).copied().flatten();
        if status != Some(PageStatus::Record) {
            push(
                &mut findings,
                VerifySeverity::Warning,
                Some(entry.page),
                "free-space registry lists a page that is not a record page",
            );
        }
    }

    let success = !findings.iter().any(|f: &VerifyFinding| f.severity == VerifySeverity::Error);
    Ok(VerifyReport {
        kind: data.kind(),
        success,
        findings,
        counts,
    })
}

fn load(data: &DataFile, no: PageNo, findings: &mut Vec<VerifyFinding>) -> Result<Option<DataPage>> {
    match data.page_snapshot(no) {
        Ok(page) => Ok(Some(page)),
        Err(StoreError::Corruption(report)) => {
            push(findings, VerifySeverity::Error, Some(no), report.to_string());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn check_records(
    page: &DataPage,
    counts: &mut VerifyCounts,
    referenced_heads: &mut Vec<(PageNo, PageNo)>,
    forward_links: &mut Vec<(PageNo, u16, PageNo)>,
    findings: &mut Vec<VerifyFinding>,
) {
    let mut seen = 0u64;
    let mut slots = HashSet::new();
    for pos in page.records() {
        let pos = match pos {
            Ok(pos) => pos,
            Err(err) => {
                push(findings, VerifySeverity::Error, Some(page.no()), err.to_string());
                return;
            }
        };
        seen += 1;
        if !slots.insert(pos.slot) {
            push(
                findings,
                VerifySeverity::Error,
                Some(page.no()),
                format!("slot {} appears twice", pos.slot),
            );
        }
        if pos.slot >= page.next_slot() {
            push(
                findings,
                VerifySeverity::Error,
                Some(page.no()),
                format!("slot {} was never issued by this page", pos.slot),
            );
        }
        if let RecordKind::Link(target) = pos.kind {
            counts.forward_links += 1;
            forward_links.push((page.no(), pos.slot, target));
        }
        if pos.kind == RecordKind::OverflowRef {
            match <[u8; 8]>::try_from(page.payload(&pos)) {
                Ok(raw) => {
                    let head = u64::from_be_bytes(raw);
                    referenced_heads.push((page.no(), PageNo(u32::try_from(head).unwrap_or(u32::MAX))));
                }
                Err(_) => push(
                    findings,
                    VerifySeverity::Error,
                    Some(page.no()),
                    format!("overflow reference in slot {} has {} bytes", pos.slot, pos.len),
                ),
            }
        }
    }
    counts.records += seen;
    if seen != u64::from(page.record_count()) {
        push(
            findings,
            VerifySeverity::Error,
            Some(page.no()),
            format!("header counts {} records, found {seen}", page.record_count()),
        );
    }
}

fn check_chain(
    data: &DataFile,
    head: &DataPage,
    owned_lob: &mut HashSet<PageNo>,
    findings: &mut Vec<VerifyFinding>,
) -> Result<()> {
    let work = data.work_size();
    let total = head.data_len();
    let mut linked = total.min(work);
    let mut tail = head.no();
    let mut next = head.next_in_chain();
    let mut hops = 0u32;
    while let Some(no) = next {
        hops += 1;
        if hops > data.last_page() || no.0 > data.last_page() {
            push(findings, VerifySeverity::Error, Some(head.no()), "overflow chain does not terminate inside the file");
            return Ok(());
        }
        let Some(page) = load(data, no, findings)? else {
            return Ok(());
        };
        if page.status() != PageStatus::Lob {
            push(
                findings,
                VerifySeverity::Error,
                Some(head.no()),
                format!("overflow chain links to page {no} with status {:?}", page.status()),
            );
            return Ok(());
        }
        if !owned_lob.insert(no) {
            push(findings, VerifySeverity::Error, Some(no), "overflow page shared by two chains");
            return Ok(());
        }
        if page.next_in_chain().is_some() && page.data_len() != work {
            push(findings, VerifySeverity::Warning, Some(no), "intermediate overflow page is not full");
        }
        linked += page.data_len();
        tail = no;
        next = page.next_in_chain();
    }
    if linked != total {
        push(
            findings,
            VerifySeverity::Error,
            Some(head.no()),
            format!("overflow chain holds {linked} bytes, head records {total}"),
        );
    }
    if head.last_in_chain().unwrap_or(head.no()) != tail {
        push(findings, VerifySeverity::Warning, Some(head.no()), "chain head does not point at its tail");
    }
    Ok(())
}

fn check_free_chain(
    data: &DataFile,
    statuses: &[Option<PageStatus>],
    counts: &mut VerifyCounts,
    findings: &mut Vec<VerifyFinding>,
) -> Result<()> {
    let mut members = HashSet::new();
    let mut next = data.header().free_head;
    while let Some(no) = next {
        if no.0 > data.last_page() || !members.insert(no) {
            push(findings, VerifySeverity::Error, Some(no), "freed-page chain leaves the file or loops");
            break;
        }
        if statuses[no.0 as usize] != Some(PageStatus::FreeList) {
            push(findings, VerifySeverity::Error, Some(no), "freed-page chain reaches a live page");
            break;
        }
        next = match load(data, no, findings)? {
            Some(page) => page.next_in_chain(),
            None => None,
        };
    }
    counts.free_pages = members.len() as u64;
    for (raw, status) in statuses.iter().enumerate().skip(1) {
        let no = PageNo(raw as u32);
        if *status == Some(PageStatus::FreeList) && !members.contains(&no) {
            push(findings, VerifySeverity::Warning, Some(no), "free page is not on the freed-page chain");
        }
    }
    Ok(())
}

fn check_node_links(
    data: &DataFile,
    statuses: &[Option<PageStatus>],
    findings: &mut Vec<VerifyFinding>,
) -> Result<()> {
    for (raw, status) in statuses.iter().enumerate().skip(1) {
        if *status != Some(PageStatus::Record) {
            continue;
        }
        let no = PageNo(raw as u32);
        let Some(page) = load(data, no, findings)? else {
            continue;
        };
        if let Some(next) = page.next_in_chain() {
            let back = match statuses.get(next.0 as usize).copied().flatten() {
                Some(PageStatus::Record) => load(data, next, findings)?.and_then(|p| p.last_in_chain()),
                _ => None,
            };
            if back != Some(no) {
                push(
                    findings,
                    VerifySeverity::Error,
                    Some(no),
                    format!("next data page {next} does not link back"),
                );
            }
        }
    }
    Ok(())
}

fn push(
    findings: &mut Vec<VerifyFinding>,
    severity: VerifySeverity,
    page: Option<PageNo>,
    message: impl Into<String>,
) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity,
            page: page.map(|p| p.0),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RecordStore, StoreOptions};
    use tempfile::tempdir;

    #[test]
    fn healthy_store_verifies_clean() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.dbx");
        let store = RecordStore::create(&path, StoreOptions::default())?;
        let small = store.store(b"small")?;
        store.store(&vec![3u8; 20_000])?;
        let doomed = store.store(&vec![4u8; 9_000])?;
        store.remove(doomed)?;
        store.remove(small)?;
        let live = store.verify()?;
        assert!(live.success, "{:?}", live.findings);
        store.close()?;

        let report = verify(&path, &AdminOpenOptions::default())?;
        assert!(report.success, "{:?}", report.findings);
        assert_eq!(report.counts.chain_heads, 1);
        assert_eq!(report.counts.chain_pages, 4);
        assert_eq!(report.counts.free_pages, 4);
        assert_eq!(report.count(VerifySeverity::Warning), 0);
        Ok(())
    }
}
