//! On-disk data page header shared by the record and node stores.

use core::convert::{TryFrom, TryInto};

use super::{PageNo, Result, StoreError};

/// Bytes reserved at the front of every data page.
pub const PAGE_HDR_LEN: usize = 32;
/// Default physical page size.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest page size a store accepts.
pub const MIN_PAGE_SIZE: u32 = 2048;
/// Largest page size a store accepts.
pub const MAX_PAGE_SIZE: u32 = 65536;
/// Bytes each record spends on its slot id and length word.
pub const SLOT_OVERHEAD: usize = 6;
/// Slot ids are stored as signed 16-bit values on disk.
pub const MAX_SLOT_ID: u16 = i16::MAX as u16;

/// Byte offsets inside the 32-byte page header.
pub mod header {
    use core::ops::Range;

    /// Page status byte.
    pub const STATUS: usize = 0;
    /// Unused.
    pub const RESERVED: usize = 1;
    /// Record count.
    pub const RECORD_COUNT: Range<usize> = 2..4;
    /// Data length.
    pub const DATA_LENGTH: Range<usize> = 4..8;
    /// Next slot.
    pub const NEXT_SLOT: Range<usize> = 8..10;
    /// Unused.
    pub const PADDING: Range<usize> = 10..12;
    /// Next in chain.
    pub const NEXT_IN_CHAIN: Range<usize> = 12..20;
    /// Last in chain.
    pub const LAST_IN_CHAIN: Range<usize> = 20..28;
    /// Checksum over page number, header and work area.
    pub const CRC32: Range<usize> = 28..32;
}

/// What a page currently holds.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Slotted page of small records.
    Record = 20,
    /// Continuation page of an overflow chain.
    Lob = 21,
    /// Reclaimed page waiting on the free chain.
    FreeList = 22,
    /// Head page of an overflow chain.
    MultiPage = 23,
}

impl PageStatus {
    /// Raw tag byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageStatus {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            20 => Ok(PageStatus::Record),
            21 => Ok(PageStatus::Lob),
            22 => Ok(PageStatus::FreeList),
            23 => Ok(PageStatus::MultiPage),
            _ => Err(StoreError::Invalid("unknown page status")),
        }
    }
}

/// Decoded page header.
///
/// On an overflow head `data_length` is the logical length of the whole
/// value; everywhere else it is the number of bytes used in the work area.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Page status tag.
    pub status: PageStatus,
    /// Live records on the page.
    pub record_count: u16,
    /// Bytes used (or total chain length on a chain head).
    pub data_length: u32,
    /// Next slot id the page will issue.
    pub next_slot: u16,
    /// Following page in an overflow chain, node sequence or free chain.
    pub next_in_chain: Option<PageNo>,
    /// Tail of an overflow chain, or the previous page of a node sequence.
    pub last_in_chain: Option<PageNo>,
}

impl PageHeader {
    /// Fresh header for an empty page.
    pub fn new(status: PageStatus) -> Self {
        Self {
            status,
            record_count: 0,
            data_length: 0,
            next_slot: 0,
            next_in_chain: None,
            last_in_chain: None,
        }
    }

    /// Writes the header (without checksum) into `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(StoreError::Invalid("page header buffer too small"));
        }
        let record_count =
            i16::try_from(self.record_count).map_err(|_| StoreError::Invalid("record count overflow"))?;
        let data_length =
            i32::try_from(self.data_length).map_err(|_| StoreError::Invalid("data length overflow"))?;
        let next_slot =
            i16::try_from(self.next_slot).map_err(|_| StoreError::Invalid("slot counter overflow"))?;
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::STATUS] = self.status.as_u8();
        hdr[header::RESERVED] = 0;
        hdr[header::RECORD_COUNT].copy_from_slice(&record_count.to_be_bytes());
        hdr[header::DATA_LENGTH].copy_from_slice(&data_length.to_be_bytes());
        hdr[header::NEXT_SLOT].copy_from_slice(&next_slot.to_be_bytes());
        hdr[header::PADDING].fill(0);
        hdr[header::NEXT_IN_CHAIN].copy_from_slice(&PageNo::to_link(self.next_in_chain).to_be_bytes());
        hdr[header::LAST_IN_CHAIN].copy_from_slice(&PageNo::to_link(self.last_in_chain).to_be_bytes());
        Ok(())
    }

    /// Parses the fixed header fields of `src`.
    pub fn decode(page: PageNo, src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(StoreError::corruption(page, "page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        let status = PageStatus::try_from(hdr[header::STATUS])
            .map_err(|_| StoreError::corruption(page, "unknown page status"))?;
        let record_count = i16::from_be_bytes(field(page, &hdr[header::RECORD_COUNT])?);
        let data_length = i32::from_be_bytes(field(page, &hdr[header::DATA_LENGTH])?);
        let next_slot = i16::from_be_bytes(field(page, &hdr[header::NEXT_SLOT])?);
        if record_count < 0 || data_length < 0 || next_slot < 0 {
            return Err(StoreError::corruption(page, "negative page header field"));
        }
        let next_in_chain = i64::from_be_bytes(field(page, &hdr[header::NEXT_IN_CHAIN])?);
        let last_in_chain = i64::from_be_bytes(field(page, &hdr[header::LAST_IN_CHAIN])?);
        Ok(Self {
            status,
            record_count: record_count as u16,
            data_length: data_length as u32,
            next_slot: next_slot as u16,
            next_in_chain: PageNo::from_link(next_in_chain),
            last_in_chain: PageNo::from_link(last_in_chain),
        })
    }
}

/// Reads the stored checksum of an encoded page.
pub fn stored_crc32(page: PageNo, src: &[u8]) -> Result<u32> {
    if src.len() < PAGE_HDR_LEN {
        return Err(StoreError::corruption(page, "page header truncated"));
    }
    Ok(u32::from_be_bytes(field(page, &src[header::CRC32])?))
}

fn field<const N: usize>(page: PageNo, bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| StoreError::corruption(page, "page header field truncated"))
}
