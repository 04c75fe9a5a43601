//! Slotted data pages.
//!
//! The work area holds `[slot:2][length:4][payload]` triples packed from
//! offset 0 up to the header's data length. There is no slot directory;
//! records are found by scanning. The top bit of the length word marks a
//! record whose payload references an overflow chain.
//!
//! A record moved off the page by a split leaves a forwarding link behind:
//! the slot id with its top bit set, followed by the target page number in
//! place of the length word. A link is exactly [`SLOT_OVERHEAD`] bytes, so
//! replacing a record with one never grows the page.
#![forbid(unsafe_code)]

use std::ops::Range;

use crate::types::checksum::page_crc32;
use crate::types::page::{
    header, stored_crc32, PageHeader, PageStatus, MAX_SLOT_ID, PAGE_HDR_LEN, SLOT_OVERHEAD,
};
use crate::types::{CorruptionReport, PageNo, Pointer, Result, StoreError};

const OVERFLOW_FLAG: u32 = 0x8000_0000;
const LINK_FLAG: u16 = 0x8000;
/// Largest payload a record length word can describe.
pub const MAX_RECORD_LEN: usize = (OVERFLOW_FLAG - 1) as usize;

/// How a record's payload is to be interpreted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordKind {
    /// Payload is the value itself.
    Inline,
    /// Payload is the head page number of an overflow chain.
    OverflowRef,
    /// No payload; the record with this slot id now lives on the page.
    Link(PageNo),
}

/// Location of one record inside a page work area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordPos {
    /// Slot id of the record.
    pub slot: u16,
    /// Offset of the record's slot id.
    pub offset: usize,
    /// Payload interpretation.
    pub kind: RecordKind,
    /// Payload length.
    pub len: usize,
}

impl RecordPos {
    /// Byte range of the payload.
    pub fn payload(&self) -> Range<usize> {
        self.offset + SLOT_OVERHEAD..self.end()
    }

    /// Offset just past the record.
    pub fn end(&self) -> usize {
        self.offset + SLOT_OVERHEAD + self.len
    }
}

/// Records cut off a page by [`DataPage::split_off`].
#[derive(Clone, Debug, Default)]
pub struct SplitTail {
    /// Raw triples, ready to be appended to another page.
    pub bytes: Vec<u8>,
    /// Slot ids of the moved records, in page order.
    pub slots: Vec<u16>,
}

/// Decoded page: header plus work area.
#[derive(Clone, Debug)]
pub struct DataPage {
    no: PageNo,
    header: PageHeader,
    data: Vec<u8>,
    dirty: bool,
}

impl DataPage {
    /// Empty page with the given status; starts dirty.
    pub fn new(no: PageNo, status: PageStatus, work_size: usize) -> Self {
        Self {
            no,
            header: PageHeader::new(status),
            data: vec![0u8; work_size],
            dirty: true,
        }
    }

    /// Parses a full physical page, checking its checksum and bounds.
    pub fn decode(no: PageNo, bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= PAGE_HDR_LEN {
            return Err(StoreError::corruption(no, "page shorter than its header"));
        }
        let header = PageHeader::decode(no, bytes)?;
        let stored = stored_crc32(no, bytes)?;
        let actual = page_crc32(no, bytes);
        if stored != actual {
            return Err(CorruptionReport::page(no, "page checksum mismatch")
                .lengths(u64::from(stored), u64::from(actual))
                .into());
        }
        let work_size = bytes.len() - PAGE_HDR_LEN;
        if header.status != PageStatus::MultiPage && header.data_length as usize > work_size {
            return Err(CorruptionReport::page(no, "data length exceeds work area")
                .lengths(u64::from(header.data_length), work_size as u64)
                .into());
        }
        Ok(Self {
            no,
            header,
            data: bytes[PAGE_HDR_LEN..].to_vec(),
            dirty: false,
        })
    }

    /// Serializes into a full physical page buffer, checksum included.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_HDR_LEN + self.data.len() {
            return Err(StoreError::Invalid("page buffer has wrong length"));
        }
        self.header.encode(buf)?;
        buf[PAGE_HDR_LEN..].copy_from_slice(&self.data);
        let crc = page_crc32(self.no, buf);
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Serializes into a freshly allocated physical page.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_HDR_LEN + self.data.len()];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Page number.
    pub fn no(&self) -> PageNo {
        self.no
    }

    /// Decoded page header.
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    /// What the page currently holds.
    pub fn status(&self) -> PageStatus {
        self.header.status
    }

    /// Records on the page, forwarding links included.
    pub fn record_count(&self) -> u16 {
        self.header.record_count
    }

    /// Header data length: bytes used, or the whole value length on a chain head.
    pub fn data_len(&self) -> usize {
        self.header.data_length as usize
    }

    /// Size of the work area.
    pub fn work_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes still free in the work area of a record page.
    pub fn remaining(&self) -> usize {
        self.work_size().saturating_sub(self.data_len())
    }

    /// Whether the page differs from its on-disk image.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flags the page for write-back.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clears the write-back flag after a flush.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Next page of a chain or node run.
    pub fn next_in_chain(&self) -> Option<PageNo> {
        self.header.next_in_chain
    }

    /// Previous node page, or the tail of an overflow chain on its head.
    pub fn last_in_chain(&self) -> Option<PageNo> {
        self.header.last_in_chain
    }

    /// Points the forward link at `next`.
    pub fn set_next_in_chain(&mut self, next: Option<PageNo>) {
        self.header.next_in_chain = next;
        self.dirty = true;
    }

    /// Points the backward link at `last`.
    pub fn set_last_in_chain(&mut self, last: Option<PageNo>) {
        self.header.last_in_chain = last;
        self.dirty = true;
    }

    /// Overwrites the header data length.
    pub fn set_data_length(&mut self, len: u32) {
        self.header.data_length = len;
        self.dirty = true;
    }

    /// Overwrites the header record count.
    pub fn set_record_count(&mut self, count: u16) {
        self.header.record_count = count;
        self.dirty = true;
    }

    /// Next slot id this page will issue.
    pub fn next_slot(&self) -> u16 {
        self.header.next_slot
    }

    /// Continues the slot counter of another page; never moves it backwards.
    pub fn inherit_slot_counter(&mut self, next_slot: u16) {
        if next_slot > self.header.next_slot {
            self.header.next_slot = next_slot;
            self.dirty = true;
        }
    }

    /// Whether the slot counter has no ids left.
    pub fn slots_exhausted(&self) -> bool {
        self.header.next_slot >= MAX_SLOT_ID
    }

    /// Takes the next slot id.
    pub fn issue_slot(&mut self) -> Result<u16> {
        if self.slots_exhausted() {
            return Err(StoreError::SlotsExhausted { page: self.no });
        }
        let slot = self.header.next_slot;
        self.header.next_slot += 1;
        self.dirty = true;
        Ok(slot)
    }

    /// Clears the page for reuse under a new status.
    ///
    /// The slot counter survives so pointers into the old incarnation stay
    /// unresolvable; it restarts only once exhausted.
    pub fn reset(&mut self, status: PageStatus) {
        let next_slot = if self.slots_exhausted() {
            0
        } else {
            self.header.next_slot
        };
        self.header = PageHeader::new(status);
        self.header.next_slot = next_slot;
        self.data.fill(0);
        self.dirty = true;
    }

    /// Raw work area, used by overflow chain pages.
    pub fn work_area(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw work area; marks the page dirty.
    pub fn work_area_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    /// Appends an inline record and returns its slot id.
    pub fn insert(&mut self, payload: &[u8]) -> Result<u16> {
        self.insert_record(RecordKind::Inline, payload)
    }

    /// Appends a record of `kind` after the last record.
    pub fn insert_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<u16> {
        self.insert_record_at(self.data_len(), kind, payload)
    }

    /// Inserts a record at `offset`, which must be a record boundary,
    /// shifting the following records right.
    pub fn insert_record_at(&mut self, offset: usize, kind: RecordKind, payload: &[u8]) -> Result<u16> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(StoreError::Invalid("record longer than a length word can describe"));
        }
        if matches!(kind, RecordKind::Link(_)) {
            return Err(StoreError::Invalid("links are only written by a split"));
        }
        let data_len = self.data_len();
        if offset > data_len {
            return Err(StoreError::Invalid("insert offset beyond data length"));
        }
        let needed = SLOT_OVERHEAD + payload.len();
        if needed > self.remaining() {
            return Err(StoreError::PageFull {
                page: self.no,
                needed,
                available: self.remaining(),
            });
        }
        let slot = self.issue_slot()?;
        self.data.copy_within(offset..data_len, offset + needed);
        self.write_triple(offset, slot, kind, payload.len());
        self.data[offset + SLOT_OVERHEAD..offset + needed].copy_from_slice(payload);
        self.header.data_length += needed as u32;
        self.header.record_count += 1;
        self.dirty = true;
        Ok(slot)
    }

    fn write_triple(&mut self, offset: usize, slot: u16, kind: RecordKind, len: usize) {
        let mut word = len as u32;
        if kind == RecordKind::OverflowRef {
            word |= OVERFLOW_FLAG;
        }
        self.data[offset..offset + 2].copy_from_slice(&slot.to_be_bytes());
        self.data[offset + 2..offset + SLOT_OVERHEAD].copy_from_slice(&word.to_be_bytes());
    }

    fn write_link(&mut self, offset: usize, slot: u16, target: PageNo) {
        self.data[offset..offset + 2].copy_from_slice(&(slot | LINK_FLAG).to_be_bytes());
        self.data[offset + 2..offset + SLOT_OVERHEAD].copy_from_slice(&target.0.to_be_bytes());
    }

    /// Decodes the record starting at `offset`.
    pub fn record_at(&self, offset: usize) -> Result<RecordPos> {
        let data_len = self.data_len();
        if offset + SLOT_OVERHEAD > data_len {
            return Err(CorruptionReport::page(self.no, "record header past data length")
                .lengths(SLOT_OVERHEAD as u64, data_len.saturating_sub(offset) as u64)
                .into());
        }
        let slot = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
        let word = u32::from_be_bytes([
            self.data[offset + 2],
            self.data[offset + 3],
            self.data[offset + 4],
            self.data[offset + 5],
        ]);
        if slot & LINK_FLAG != 0 {
            return Ok(RecordPos {
                slot: slot & !LINK_FLAG,
                offset,
                kind: RecordKind::Link(PageNo(word)),
                len: 0,
            });
        }
        let kind = if word & OVERFLOW_FLAG != 0 {
            RecordKind::OverflowRef
        } else {
            RecordKind::Inline
        };
        let pos = RecordPos {
            slot,
            offset,
            kind,
            len: (word & !OVERFLOW_FLAG) as usize,
        };
        if pos.end() > data_len {
            return Err(CorruptionReport::pointer(
                Pointer::new(self.no, slot),
                "record extends past data length",
            )
            .lengths(pos.len as u64, (data_len - offset - SLOT_OVERHEAD) as u64)
            .into());
        }
        Ok(pos)
    }

    /// Finds a record by slot id.
    pub fn locate(&self, slot: u16) -> Result<RecordPos> {
        for pos in self.records() {
            let pos = pos?;
            if pos.slot == slot {
                return Ok(pos);
            }
        }
        Err(StoreError::SlotNotFound {
            pointer: Pointer::new(self.no, slot),
        })
    }

    /// Payload bytes of a located record.
    pub fn payload(&self, pos: &RecordPos) -> &[u8] {
        &self.data[pos.payload()]
    }

    /// Kind and payload of the record with `slot`.
    pub fn record(&self, slot: u16) -> Result<(RecordKind, &[u8])> {
        let pos = self.locate(slot)?;
        Ok((pos.kind, self.payload(&pos)))
    }

    /// Removes a record and compacts the records behind it.
    pub fn remove(&mut self, slot: u16) -> Result<RecordPos> {
        let pos = self.locate(slot)?;
        let data_len = self.data_len();
        let span = pos.end() - pos.offset;
        self.data.copy_within(pos.end()..data_len, pos.offset);
        self.data[data_len - span..data_len].fill(0);
        self.header.data_length -= span as u32;
        self.header.record_count = self.header.record_count.saturating_sub(1);
        self.dirty = true;
        Ok(pos)
    }

    /// Extends the last record on the page in place.
    ///
    /// Fails with [`StoreError::PageFull`] when the record is not the last
    /// one or the page has no room for `more`.
    pub fn append(&mut self, slot: u16, more: &[u8]) -> Result<()> {
        let pos = self.locate(slot)?;
        if pos.kind != RecordKind::Inline {
            return Err(StoreError::Invalid("cannot append to an overflow reference"));
        }
        let available = if pos.end() == self.data_len() {
            self.remaining()
        } else {
            0
        };
        if more.len() > available || pos.len + more.len() > MAX_RECORD_LEN {
            return Err(StoreError::PageFull {
                page: self.no,
                needed: more.len(),
                available,
            });
        }
        let end = pos.end();
        self.data[end..end + more.len()].copy_from_slice(more);
        self.write_triple(pos.offset, slot, pos.kind, pos.len + more.len());
        self.header.data_length += more.len() as u32;
        self.dirty = true;
        Ok(())
    }

    /// Replaces a record's payload in place, keeping its slot id and kind.
    pub fn replace(&mut self, slot: u16, payload: &[u8]) -> Result<()> {
        let pos = self.locate(slot)?;
        if payload.len() > pos.len && payload.len() - pos.len > self.remaining() {
            return Err(StoreError::PageFull {
                page: self.no,
                needed: payload.len() - pos.len,
                available: self.remaining(),
            });
        }
        let data_len = self.data_len();
        let new_end = pos.offset + SLOT_OVERHEAD + payload.len();
        self.data.copy_within(pos.end()..data_len, new_end);
        let new_len = data_len + payload.len() - pos.len;
        if new_len < data_len {
            self.data[new_len..data_len].fill(0);
        }
        self.write_triple(pos.offset, slot, pos.kind, payload.len());
        self.data[pos.offset + SLOT_OVERHEAD..new_end].copy_from_slice(payload);
        self.header.data_length = new_len as u32;
        self.dirty = true;
        Ok(())
    }

    /// Cuts every record from `offset` (a record boundary) to the end,
    /// leaving a link to `target` in place of each one. Links already in
    /// that range stay where they are and are not part of the tail.
    pub fn split_off(&mut self, offset: usize, target: PageNo) -> Result<SplitTail> {
        let data_len = self.data_len();
        let mut tail = SplitTail::default();
        let mut kept = Vec::new();
        let mut cursor = offset;
        while cursor < data_len {
            let pos = self.record_at(cursor)?;
            match pos.kind {
                RecordKind::Link(to) => kept.push((pos.slot, to)),
                _ => {
                    tail.bytes.extend_from_slice(&self.data[pos.offset..pos.end()]);
                    tail.slots.push(pos.slot);
                    kept.push((pos.slot, target));
                }
            }
            cursor = pos.end();
        }
        self.data[offset..data_len].fill(0);
        let mut at = offset;
        for (slot, to) in kept {
            self.write_link(at, slot, to);
            at += SLOT_OVERHEAD;
        }
        self.header.data_length = at as u32;
        self.dirty = true;
        Ok(tail)
    }

    /// Appends records cut from another page, keeping their slot ids.
    pub fn absorb(&mut self, tail: &SplitTail) -> Result<()> {
        if tail.bytes.len() > self.remaining() {
            return Err(StoreError::PageFull {
                page: self.no,
                needed: tail.bytes.len(),
                available: self.remaining(),
            });
        }
        let start = self.data_len();
        self.data[start..start + tail.bytes.len()].copy_from_slice(&tail.bytes);
        self.header.data_length += tail.bytes.len() as u32;
        self.header.record_count += tail.slots.len() as u16;
        self.dirty = true;
        Ok(())
    }

    /// Iterates records in page order.
    pub fn records(&self) -> Records<'_> {
        Records {
            page: self,
            offset: 0,
            failed: false,
        }
    }
}

/// Iterator over the records of a [`DataPage`].
pub struct Records<'a> {
    page: &'a DataPage,
    offset: usize,
    failed: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<RecordPos>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.page.data_len() {
            return None;
        }
        match self.page.record_at(self.offset) {
            Ok(pos) => {
                self.offset = pos.end();
                Some(Ok(pos))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
