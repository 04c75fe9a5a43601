//! Node store: document-ordered records with positional pointers.
//!
//! Each document's nodes fill a doubly linked run of record pages
//! (`next_in_chain` forward, `last_in_chain` backward). Records keep their
//! slot id when a page split moves them and leave a forwarding link on the
//! page they came from, so old pointers keep resolving. A slot id that is
//! neither a record nor a link on its page does not exist.
#![forbid(unsafe_code)]

use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::admin::{verify_file, VerifyReport};
use crate::primitives::concurrency::FileLock;
use crate::primitives::pager::FileKind;
use crate::storage::buffer::{BufferStats, PRIORITY_RECORD};
use crate::storage::file::DataFile;
use crate::storage::options::StoreOptions;
use crate::storage::overflow::OverflowChain;
use crate::storage::page::{RecordKind, RecordPos};
use crate::types::page::{PageStatus, SLOT_OVERHEAD};
use crate::types::{CorruptionReport, DocumentId, PageNo, Pointer, Result, StoreError};

const REF_LEN: usize = 8;

/// Told about every node a page split moves.
pub trait RelocationListener {
    /// The node at `old` now lives at `new`.
    fn relocated(&mut self, old: Pointer, new: Pointer);
}

impl<F: FnMut(Pointer, Pointer)> RelocationListener for F {
    fn relocated(&mut self, old: Pointer, new: Pointer) {
        self(old, new)
    }
}

struct NodeState {
    data: DataFile,
    tails: FxHashMap<DocumentId, PageNo>,
}

/// Paged store of document nodes.
pub struct NodeStore {
    state: FileLock<NodeState>,
}

impl NodeStore {
    /// Creates a new node store file.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Ok(Self::with_file(DataFile::create(path, FileKind::Nodes, options)?))
    }

    /// Opens an existing node store file. Document tails are not persisted;
    /// the first append to a document after reopening starts a new page.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Ok(Self::with_file(DataFile::open(path, FileKind::Nodes, options)?))
    }

    /// Wraps an already open file.
    pub fn with_file(data: DataFile) -> Self {
        let timeout = data.options().lock_timeout_duration();
        Self {
            state: FileLock::new(
                NodeState {
                    data,
                    tails: FxHashMap::default(),
                },
                timeout,
            ),
        }
    }

    /// Appends `value` as the last node of `doc`.
    pub fn append(&self, doc: DocumentId, value: &[u8]) -> Result<Pointer> {
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let (kind, payload) = encode_node(&mut state.data, value)?;
        let tail = match state.tails.get(&doc).copied() {
            Some(page) if status_of(&state.data, page)? == PageStatus::Record => Some(page),
            _ => None,
        };
        if let Some(page) = tail {
            if let Some(slot) = try_insert(&mut state.data, page, None, kind, &payload)? {
                trace!(doc = doc.0, page = page.0, slot, "node.append");
                return Ok(Pointer::new(page, slot));
            }
        }
        let page = link_new_page(&mut state.data, tail)?;
        let slot = state
            .data
            .with_page_mut(page, |p| p.insert_record(kind, &payload))?;
        state.tails.insert(doc, page);
        trace!(doc = doc.0, page = page.0, slot, "node.append_new_page");
        Ok(Pointer::new(page, slot))
    }

    /// Inserts `value` directly after the node at `after`.
    ///
    /// When the page is full it is split at the insertion point; every node
    /// moved to the new page is reported to `listener`.
    pub fn insert_after(
        &self,
        doc: DocumentId,
        after: Pointer,
        value: &[u8],
        listener: &mut dyn RelocationListener,
    ) -> Result<Pointer> {
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let (page, pos, _) = locate_node(&state.data, after)?;
        let (kind, payload) = encode_node(&mut state.data, value)?;
        if let Some(slot) = try_insert(&mut state.data, page, Some(pos.end()), kind, &payload)? {
            trace!(doc = doc.0, page = page.0, slot, "node.insert_after");
            return Ok(Pointer::new(page, slot));
        }

        let split = link_new_page(&mut state.data, Some(page))?;
        let (tail, next_slot) = state.data.with_page_mut(page, |p| {
            let tail = p.split_off(pos.end(), split)?;
            Ok((tail, p.next_slot()))
        })?;
        state.data.with_page_mut(split, |p| {
            p.inherit_slot_counter(next_slot);
            p.absorb(&tail)
        })?;
        for slot in &tail.slots {
            listener.relocated(Pointer::new(page, *slot), Pointer::new(split, *slot));
        }
        for last in state.tails.values_mut() {
            if *last == page {
                *last = split;
            }
        }
        debug!(
            page = page.0,
            split = split.0,
            moved = tail.slots.len(),
            "node.split"
        );

        let inserted = match try_insert(&mut state.data, page, None, kind, &payload)? {
            Some(slot) => Pointer::new(page, slot),
            None => match try_insert(&mut state.data, split, Some(0), kind, &payload)? {
                Some(slot) => Pointer::new(split, slot),
                None => {
                    let extra = link_new_page(&mut state.data, Some(page))?;
                    state.data.with_page_mut(extra, |p| {
                        p.inherit_slot_counter(next_slot);
                        Ok(())
                    })?;
                    let slot = state
                        .data
                        .with_page_mut(extra, |p| p.insert_record(kind, &payload))?;
                    Pointer::new(extra, slot)
                }
            },
        };
        trace!(doc = doc.0, pointer = %inserted, "node.insert_after_split");
        Ok(inserted)
    }

    /// Reads the node at `pointer`.
    pub fn get(&self, pointer: Pointer) -> Result<Vec<u8>> {
        let state = self.state.read()?;
        let (page, pos, _) = locate_node(&state.data, pointer)?;
        read_node(&state.data, page, &pos)
    }

    /// Overwrites a node whose stored size does not change: an inline value
    /// of the same length, or an overflow value that stays oversized.
    pub fn update(&self, pointer: Pointer, value: &[u8]) -> Result<()> {
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let (page, pos, _) = locate_node(&state.data, pointer)?;
        match pos.kind {
            RecordKind::Inline if pos.len == value.len() => state
                .data
                .with_page_mut(page, |p| p.replace(pos.slot, value)),
            RecordKind::OverflowRef if !fits_inline(&state.data, value.len()) => {
                let head = state.data.with_page(page, |p| chain_head(p.no(), p.payload(&pos)))?;
                head.rewrite(&mut state.data, value)
            }
            _ => Err(StoreError::Invalid("node update must keep the stored size")),
        }
    }

    /// Removes the node at `pointer` together with any links leading to it,
    /// reclaiming pages that become empty.
    pub fn remove(&self, pointer: Pointer) -> Result<()> {
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let (page, pos, links) = locate_node(&state.data, pointer)?;
        if pos.kind == RecordKind::OverflowRef {
            let head = state.data.with_page(page, |p| chain_head(p.no(), p.payload(&pos)))?;
            head.delete(&mut state.data)?;
        }
        for link in links {
            remove_slot(state, link, pos.slot)?;
        }
        remove_slot(state, page, pos.slot)?;
        trace!(%pointer, page = page.0, "node.remove");
        Ok(())
    }

    /// Visits nodes in document order starting at the first record of
    /// `start`, following the forward page links. The visitor returns
    /// `false` to stop. Returns the number of nodes visited.
    pub fn scan(&self, start: PageNo, mut visitor: impl FnMut(Pointer, &[u8]) -> bool) -> Result<usize> {
        let state = self.state.read()?;
        let data = &state.data;
        let mut visited = 0;
        let mut hops = 0u32;
        let mut next = Some(start);
        while let Some(page) = next {
            hops += 1;
            if hops > data.last_page() {
                return Err(CorruptionReport::page(start, "node page chain does not terminate").into());
            }
            let (records, following) = data.with_page(page, |p| {
                if p.status() != PageStatus::Record {
                    return Err(StoreError::corruption(page, "node chain reaches a non-record page"));
                }
                let mut records = Vec::with_capacity(p.record_count() as usize);
                for pos in p.records() {
                    let pos = pos?;
                    if !matches!(pos.kind, RecordKind::Link(_)) {
                        records.push((pos.slot, pos.kind, p.payload(&pos).to_vec()));
                    }
                }
                Ok((records, p.next_in_chain()))
            })?;
            for (slot, kind, payload) in records {
                let value = match kind {
                    RecordKind::OverflowRef => chain_head(page, &payload)?.read(data)?,
                    _ => payload,
                };
                visited += 1;
                if !visitor(Pointer::new(page, slot), &value) {
                    return Ok(visited);
                }
            }
            next = following;
        }
        Ok(visited)
    }

    /// Forgets where `doc` ends; later appends start a new page.
    pub fn close_document(&self, doc: DocumentId) -> Result<()> {
        self.state.write()?.tails.remove(&doc);
        Ok(())
    }

    /// Writes dirty pages and the file header.
    pub fn flush(&self) -> Result<()> {
        self.state.write()?.data.flush()
    }

    /// Flushes and releases the file.
    pub fn close(self) -> Result<()> {
        self.state.into_inner().data.close()
    }

    /// Hit, miss and eviction counters of the page buffer.
    pub fn buffer_stats(&self) -> Result<BufferStats> {
        Ok(self.state.read()?.data.buffer_stats())
    }

    /// Consistency check of every page in the file.
    pub fn verify(&self) -> Result<VerifyReport> {
        verify_file(&self.state.read()?.data)
    }
}

fn fits_inline(data: &DataFile, len: usize) -> bool {
    len + SLOT_OVERHEAD <= data.work_size()
}

fn encode_node(data: &mut DataFile, value: &[u8]) -> Result<(RecordKind, Vec<u8>)> {
    if fits_inline(data, value.len()) {
        return Ok((RecordKind::Inline, value.to_vec()));
    }
    let (chain, _) = OverflowChain::create(data, value)?;
    Ok((
        RecordKind::OverflowRef,
        u64::from(chain.head().0).to_be_bytes().to_vec(),
    ))
}

fn chain_head(page: PageNo, payload: &[u8]) -> Result<OverflowChain> {
    let raw: [u8; REF_LEN] = payload
        .try_into()
        .map_err(|_| CorruptionReport::page(page, "overflow reference has wrong length")
            .lengths(REF_LEN as u64, payload.len() as u64))?;
    let head = u32::try_from(u64::from_be_bytes(raw))
        .map_err(|_| CorruptionReport::page(page, "overflow reference out of range"))?;
    Ok(OverflowChain::new(PageNo(head)))
}

fn status_of(data: &DataFile, page: PageNo) -> Result<PageStatus> {
    data.with_page(page, |p| Ok(p.status()))
}

/// Inserts at `offset` (or the end) unless the page lacks room or slot ids.
fn try_insert(
    data: &mut DataFile,
    page: PageNo,
    offset: Option<usize>,
    kind: RecordKind,
    payload: &[u8],
) -> Result<Option<u16>> {
    data.with_page_mut(page, |p| {
        if p.slots_exhausted() || p.remaining() < payload.len() + SLOT_OVERHEAD {
            return Ok(None);
        }
        let at = offset.unwrap_or(p.data_len());
        p.insert_record_at(at, kind, payload).map(Some)
    })
}

/// Allocates a record page and links it after `prev`.
fn link_new_page(data: &mut DataFile, prev: Option<PageNo>) -> Result<PageNo> {
    let page = data.allocate_page(PageStatus::Record, PRIORITY_RECORD)?;
    let Some(prev) = prev else {
        return Ok(page);
    };
    let next = data.with_page_mut(prev, |p| {
        let next = p.next_in_chain();
        p.set_next_in_chain(Some(page));
        Ok(next)
    })?;
    data.with_page_mut(page, |p| {
        p.set_last_in_chain(Some(prev));
        p.set_next_in_chain(next);
        Ok(())
    })?;
    if let Some(next) = next {
        data.with_page_mut(next, |p| {
            p.set_last_in_chain(Some(page));
            Ok(())
        })?;
    }
    Ok(page)
}

/// Removes one record or link, reclaiming the page once empty.
fn remove_slot(state: &mut NodeState, page: PageNo, slot: u16) -> Result<()> {
    let count = state.data.with_page_mut(page, |p| {
        p.remove(slot)?;
        Ok(p.record_count())
    })?;
    if count > 0 {
        return Ok(());
    }
    reclaim(state, page)
}

/// Frees an empty page, then walks back along its run dropping links into
/// freed pages. Links only point forward, so one backward pass finds them.
fn reclaim(state: &mut NodeState, page: PageNo) -> Result<()> {
    let mut freed = vec![page];
    let mut cursor = unlink_and_free(state, page)?;
    let mut hops = 0u32;
    while let Some(current) = cursor {
        hops += 1;
        if hops > state.data.last_page() {
            return Err(CorruptionReport::page(page, "node page chain does not terminate").into());
        }
        let (stale, prev) = state.data.with_page(current, |p| {
            let mut stale = Vec::new();
            for pos in p.records() {
                let pos = pos?;
                if matches!(pos.kind, RecordKind::Link(target) if freed.contains(&target)) {
                    stale.push(pos.slot);
                }
            }
            Ok((stale, p.last_in_chain()))
        })?;
        cursor = prev;
        if stale.is_empty() {
            continue;
        }
        let count = state.data.with_page_mut(current, |p| {
            for slot in &stale {
                p.remove(*slot)?;
            }
            Ok(p.record_count())
        })?;
        trace!(page = current.0, dropped = stale.len(), "node.stale_links");
        if count == 0 {
            cursor = unlink_and_free(state, current)?;
            freed.push(current);
        }
    }
    Ok(())
}

/// Unlinks `page` from its run and frees it. Returns the previous page.
fn unlink_and_free(state: &mut NodeState, page: PageNo) -> Result<Option<PageNo>> {
    let (prev, next) = state
        .data
        .with_page(page, |p| Ok((p.last_in_chain(), p.next_in_chain())))?;
    if let Some(prev) = prev {
        state.data.with_page_mut(prev, |p| {
            p.set_next_in_chain(next);
            Ok(())
        })?;
    }
    if let Some(next) = next {
        state.data.with_page_mut(next, |p| {
            p.set_last_in_chain(prev);
            Ok(())
        })?;
    }
    state.data.free_page(page)?;
    match prev {
        Some(prev) => state
            .tails
            .values_mut()
            .filter(|last| **last == page)
            .for_each(|last| *last = prev),
        None => state.tails.retain(|_, last| *last != page),
    }
    debug!(page = page.0, ?prev, ?next, "node.page_reclaimed");
    Ok(prev)
}

/// Finds the record for `pointer`, following the links splits left behind.
/// Also returns the pages holding those links, in the order visited.
fn locate_node(data: &DataFile, pointer: Pointer) -> Result<(PageNo, RecordPos, Vec<PageNo>)> {
    let (mut page, slot) = pointer.decode();
    let mut links = Vec::new();
    loop {
        let pos = data.with_page(page, |p| {
            if p.status() != PageStatus::Record {
                return Err(StoreError::SlotNotFound { pointer });
            }
            match p.locate(slot) {
                Err(StoreError::SlotNotFound { .. }) => Err(StoreError::SlotNotFound { pointer }),
                other => other,
            }
        })?;
        match pos.kind {
            RecordKind::Link(target) if links.len() < data.last_page() as usize => {
                links.push(page);
                page = target;
            }
            RecordKind::Link(_) => {
                return Err(CorruptionReport::pointer(pointer, "forwarding links form a cycle").into());
            }
            _ => return Ok((page, pos, links)),
        }
    }
}

fn read_node(data: &DataFile, page: PageNo, pos: &RecordPos) -> Result<Vec<u8>> {
    let payload = data.with_page(page, |p| Ok(p.payload(pos).to_vec()))?;
    match pos.kind {
        RecordKind::OverflowRef => chain_head(page, &payload)?.read(data),
        _ => Ok(payload),
    }
}
