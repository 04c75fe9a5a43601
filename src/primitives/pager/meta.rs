use std::convert::TryInto;
use std::io::ErrorKind;
use std::ops::Range;

use crate::primitives::io::FileIo;
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{CorruptionReport, PageNo, Result, StoreError};

/// Magic bytes at the start of every store file.
pub const FILE_MAGIC: [u8; 8] = *b"DBXSTORE";
/// Current header format version.
pub const FILE_FORMAT_VERSION: u16 = 1;

const HDR_MAGIC: Range<usize> = 0..8;
const HDR_VERSION: Range<usize> = 8..10;
const HDR_KIND: usize = 10;
const HDR_CODEC: usize = 11;
const HDR_PAGE_SIZE: Range<usize> = 12..16;
const HDR_LAST_PAGE: Range<usize> = 16..24;
const HDR_FREE_HEAD: Range<usize> = 24..32;
const HDR_CRC32: Range<usize> = 32..36;
const HDR_FREE_COUNT: Range<usize> = 36..40;
/// Length of the fixed part of the header, before the free-space entries.
pub const HDR_FIXED_LEN: usize = 40;
/// Bytes per persisted free-space entry (`page:int64`, `free:int32`).
pub const FREE_ENTRY_LEN: usize = 12;

/// Which façade owns the file.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Keyed variable-length value store.
    Records = 1,
    /// Sequential document node store.
    Nodes = 2,
}

impl TryFrom<u8> for FileKind {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FileKind::Records),
            2 => Ok(FileKind::Nodes),
            _ => Err(CorruptionReport::file("unknown file kind").into()),
        }
    }
}

/// Contents of page 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Header format version.
    pub version: u16,
    /// Façade that created the file.
    pub kind: FileKind,
    /// Codec id applied to stored values.
    pub codec: u8,
    /// Physical page size in bytes.
    pub page_size: u32,
    /// Highest page number ever allocated; zero for an empty file.
    pub last_page: u32,
    /// First page of the reclaimed-page chain.
    pub free_head: Option<PageNo>,
    /// Persisted free-space registry, `(page, free bytes)`.
    pub free_space: Vec<(PageNo, u32)>,
}

impl FileHeader {
    /// Header of a freshly created file.
    pub fn new(kind: FileKind, codec: u8, page_size: u32) -> Self {
        Self {
            version: FILE_FORMAT_VERSION,
            kind,
            codec,
            page_size,
            last_page: 0,
            free_head: None,
            free_space: Vec::new(),
        }
    }

    /// Most free-space entries that fit in a header page of `page_size`.
    pub fn max_free_entries(page_size: u32) -> usize {
        (page_size as usize).saturating_sub(HDR_FIXED_LEN) / FREE_ENTRY_LEN
    }

    /// Serializes into a full page buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size as usize;
        if buf.len() < page_size {
            return Err(StoreError::Invalid("header buffer too small"));
        }
        if self.free_space.len() > Self::max_free_entries(self.page_size) {
            return Err(StoreError::Invalid("free-space list does not fit the header page"));
        }
        buf[..page_size].fill(0);
        buf[HDR_MAGIC].copy_from_slice(&FILE_MAGIC);
        buf[HDR_VERSION].copy_from_slice(&self.version.to_be_bytes());
        buf[HDR_KIND] = self.kind as u8;
        buf[HDR_CODEC] = self.codec;
        buf[HDR_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[HDR_LAST_PAGE].copy_from_slice(&i64::from(self.last_page).to_be_bytes());
        buf[HDR_FREE_HEAD].copy_from_slice(&PageNo::to_link(self.free_head).to_be_bytes());
        let count = self.free_space.len() as i32;
        buf[HDR_FREE_COUNT].copy_from_slice(&count.to_be_bytes());
        let mut off = HDR_FIXED_LEN;
        for (page, free) in &self.free_space {
            let free = i32::try_from(*free).map_err(|_| StoreError::Invalid("free bytes overflow"))?;
            buf[off..off + 8].copy_from_slice(&i64::from(page.0).to_be_bytes());
            buf[off + 8..off + FREE_ENTRY_LEN].copy_from_slice(&free.to_be_bytes());
            off += FREE_ENTRY_LEN;
        }
        let crc = header_crc32(&buf[..off]);
        buf[HDR_CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Parses a full header page.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HDR_FIXED_LEN {
            return Err(CorruptionReport::file("file header truncated").into());
        }
        if buf[HDR_MAGIC] != FILE_MAGIC {
            return Err(CorruptionReport::file("invalid file magic").into());
        }
        let version = u16::from_be_bytes(fixed(&buf[HDR_VERSION])?);
        if version != FILE_FORMAT_VERSION {
            return Err(CorruptionReport::file("unsupported file format version").into());
        }
        let kind = FileKind::try_from(buf[HDR_KIND])?;
        let codec = buf[HDR_CODEC];
        let page_size = u32::from_be_bytes(fixed(&buf[HDR_PAGE_SIZE])?);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(CorruptionReport::file("page size out of range").into());
        }
        let last_page = i64::from_be_bytes(fixed(&buf[HDR_LAST_PAGE])?);
        let last_page = u32::try_from(last_page)
            .map_err(|_| StoreError::from(CorruptionReport::file("last page out of range")))?;
        let free_head = PageNo::from_link(i64::from_be_bytes(fixed(&buf[HDR_FREE_HEAD])?));
        let count = i32::from_be_bytes(fixed(&buf[HDR_FREE_COUNT])?);
        let count = usize::try_from(count)
            .map_err(|_| StoreError::from(CorruptionReport::file("negative free-space count")))?;
        let end = HDR_FIXED_LEN + count * FREE_ENTRY_LEN;
        if count > Self::max_free_entries(page_size) || end > buf.len() {
            return Err(CorruptionReport::file("free-space list overruns header").into());
        }
        let stored = u32::from_be_bytes(fixed(&buf[HDR_CRC32])?);
        let actual = header_crc32(&buf[..end]);
        if stored != actual {
            return Err(CorruptionReport::file("file header checksum mismatch")
                .lengths(u64::from(stored), u64::from(actual))
                .into());
        }
        let mut free_space = Vec::with_capacity(count);
        for entry in buf[HDR_FIXED_LEN..end].chunks_exact(FREE_ENTRY_LEN) {
            let page = i64::from_be_bytes(fixed(&entry[..8])?);
            let free = i32::from_be_bytes(fixed(&entry[8..])?);
            match (u32::try_from(page), u32::try_from(free)) {
                (Ok(page), Ok(free)) if page > 0 && page <= last_page => {
                    free_space.push((PageNo(page), free))
                }
                _ => return Err(CorruptionReport::file("invalid free-space entry").into()),
            }
        }
        Ok(Self {
            version,
            kind,
            codec,
            page_size,
            last_page,
            free_head,
            free_space,
        })
    }

    /// Reads and validates page 0 of `io`.
    pub fn load(io: &dyn FileIo) -> Result<Self> {
        let mut fixed_part = [0u8; HDR_FIXED_LEN];
        read_header_bytes(io, &mut fixed_part)?;
        let page_size = u32::from_be_bytes(fixed(&fixed_part[HDR_PAGE_SIZE])?);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(CorruptionReport::file("page size out of range").into());
        }
        let mut buf = vec![0u8; page_size as usize];
        read_header_bytes(io, &mut buf)?;
        Self::decode(&buf)
    }

    /// Writes the header into page 0 of `io`.
    pub fn store(&self, io: &dyn FileIo) -> Result<()> {
        let mut buf = vec![0u8; self.page_size as usize];
        self.encode(&mut buf)?;
        io.write_at(0, &buf)
    }
}

fn read_header_bytes(io: &dyn FileIo, buf: &mut [u8]) -> Result<()> {
    match io.read_at(0, buf) {
        Ok(()) => Ok(()),
        Err(StoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            Err(CorruptionReport::file("file header truncated").into())
        }
        Err(err) => Err(err),
    }
}

fn header_crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32Fast::default();
    crc.update(&bytes[..HDR_CRC32.start]);
    crc.update(&bytes[HDR_CRC32.end..]);
    crc.finalize()
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| CorruptionReport::file("file header field truncated").into())
}
