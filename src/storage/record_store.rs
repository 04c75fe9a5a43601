//! Record store: variable-length values addressed by [`Pointer`].
//!
//! Values that fit a page (payload plus slot overhead within the work area)
//! live as records on slotted pages found through the free-space registry;
//! larger values become overflow chains. A [`ValueIndex`] supplies the keyed
//! API on top. Index and pages sit behind one [`FileLock`].
#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::admin::{verify_file, VerifyReport};
use crate::primitives::concurrency::{FileLock, LockSnapshot};
use crate::primitives::pager::{FileHeader, FileKind};
use crate::storage::buffer::{BufferStats, PRIORITY_RECORD};
use crate::storage::codec::ValueCodec;
use crate::storage::file::DataFile;
use crate::storage::free_space::FreeSpace;
use crate::storage::index::{KeyPredicate, Lookup, MemoryIndex, ValueIndex};
use crate::storage::metrics::{default_metrics, StoreMetrics};
use crate::storage::options::StoreOptions;
use crate::storage::overflow::OverflowChain;
use crate::storage::page::{DataPage, RecordKind, RecordPos};
use crate::types::page::{PageStatus, SLOT_OVERHEAD};
use crate::types::{CorruptionReport, PageNo, Pointer, Result, StoreError};

/// How a stored value is laid out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueShape {
    /// One record on a slotted page.
    SinglePage,
    /// An overflow chain over these pages, head first.
    Overflow {
        /// Chain pages in order.
        pages: Vec<PageNo>,
    },
}

enum Location {
    Record(RecordPos),
    Chain(OverflowChain),
}

enum Placement {
    Stored { slot: u16, remaining: usize },
    NotRecord(PageStatus),
    Short(usize),
    Exhausted,
}

struct RecordState<I> {
    data: DataFile,
    index: I,
}

/// Paged store of variable-length values.
pub struct RecordStore<I: ValueIndex = MemoryIndex> {
    state: FileLock<RecordState<I>>,
    codec: Box<dyn ValueCodec>,
    metrics: Arc<dyn StoreMetrics>,
}

impl RecordStore<MemoryIndex> {
    /// Creates a new store file with an in-memory key index.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::create_with_index(path, options, MemoryIndex::new())
    }

    /// Opens an existing store file with an empty in-memory key index.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_with_index(path, options, MemoryIndex::new())
    }
}

impl<I: ValueIndex> RecordStore<I> {
    /// Creates a new store file keyed through `index`.
    pub fn create_with_index(path: impl AsRef<Path>, options: StoreOptions, index: I) -> Result<Self> {
        let data = DataFile::create(path, FileKind::Records, options)?;
        Ok(Self::with_file(data, index))
    }

    /// Opens an existing store file keyed through `index`.
    pub fn open_with_index(path: impl AsRef<Path>, options: StoreOptions, index: I) -> Result<Self> {
        let data = DataFile::open(path, FileKind::Records, options)?;
        Ok(Self::with_file(data, index))
    }

    /// Wraps an already open file.
    pub fn with_file(data: DataFile, index: I) -> Self {
        let codec = data.codec().build();
        let timeout = data.options().lock_timeout_duration();
        Self {
            state: FileLock::new(RecordState { data, index }, timeout),
            codec,
            metrics: default_metrics(),
        }
    }

    /// Routes store events to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stores `value` and returns its pointer.
    pub fn store(&self, value: &[u8]) -> Result<Pointer> {
        let encoded = self.codec.encode(value)?;
        let mut state = self.state.write()?;
        state.data.ensure_writable()?;
        self.store_value(&mut state.data, &encoded)
    }

    /// Reads the value at `pointer`.
    pub fn fetch(&self, pointer: Pointer) -> Result<Vec<u8>> {
        let stored = {
            let state = self.state.read()?;
            read_value(&state.data, pointer)?
        };
        self.codec.decode(stored)
    }

    /// Replaces the value at `pointer` and returns where it now lives.
    ///
    /// The pointer is kept when the value is rewritten in place; a value that
    /// changes between single-page and overflow form gets a new pointer.
    pub fn update(&self, pointer: Pointer, value: &[u8]) -> Result<Pointer> {
        let encoded = self.codec.encode(value)?;
        let mut state = self.state.write()?;
        state.data.ensure_writable()?;
        self.update_value(&mut state.data, pointer, &encoded)
    }

    /// Removes the value at `pointer`.
    pub fn remove(&self, pointer: Pointer) -> Result<()> {
        let mut state = self.state.write()?;
        state.data.ensure_writable()?;
        self.remove_value(&mut state.data, pointer)
    }

    /// Extends the value at `pointer` and returns where it now lives.
    pub fn append(&self, pointer: Pointer, chunk: &[u8]) -> Result<Pointer> {
        if !self.codec.supports_append() {
            return Err(StoreError::Invalid("value codec does not support append"));
        }
        let mut state = self.state.write()?;
        state.data.ensure_writable()?;
        self.append_value(&mut state.data, pointer, chunk)
    }

    /// Layout of the value at `pointer`.
    pub fn shape(&self, pointer: Pointer) -> Result<ValueShape> {
        let state = self.state.read()?;
        match resolve(&state.data, pointer)? {
            Location::Record(_) => Ok(ValueShape::SinglePage),
            Location::Chain(chain) => Ok(ValueShape::Overflow {
                pages: chain.pages(&state.data)?,
            }),
        }
    }

    /// Maps `key` to `value`, overwriting any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Pointer> {
        let encoded = self.codec.encode(value)?;
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let pointer = match state.index.find_value(key)? {
            Lookup::Found(old) => {
                let new = self.update_value(&mut state.data, old, &encoded)?;
                if new != old {
                    state.index.add_value(key, new)?;
                }
                new
            }
            Lookup::NotFound => {
                let new = self.store_value(&mut state.data, &encoded)?;
                state.index.add_value(key, new)?;
                new
            }
        };
        Ok(pointer)
    }

    /// Stores `value` under `key` unless the key is taken.
    ///
    /// Returns the new pointer, or `None` when the key already existed.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Pointer>> {
        let encoded = self.codec.encode(value)?;
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        if let Lookup::Found(_) = state.index.find_value(key)? {
            return Ok(None);
        }
        let pointer = self.store_value(&mut state.data, &encoded)?;
        state.index.add_value(key, pointer)?;
        Ok(Some(pointer))
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let stored = {
            let state = self.state.read()?;
            match state.index.find_value(key)? {
                Lookup::Found(pointer) => read_value(&state.data, pointer)?,
                Lookup::NotFound => return Ok(None),
            }
        };
        self.codec.decode(stored).map(Some)
    }

    /// Returns true when the key index has an entry for `key`.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let state = self.state.read()?;
        Ok(matches!(state.index.find_value(key)?, Lookup::Found(_)))
    }

    /// Replaces the value of an existing key; `None` when the key is absent.
    pub fn update_key(&self, key: &[u8], value: &[u8]) -> Result<Option<Pointer>> {
        let encoded = self.codec.encode(value)?;
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let Lookup::Found(old) = state.index.find_value(key)? else {
            return Ok(None);
        };
        let new = self.update_value(&mut state.data, old, &encoded)?;
        if new != old {
            state.index.add_value(key, new)?;
        }
        Ok(Some(new))
    }

    /// Appends to the value of `key`, creating it when absent.
    pub fn append_key(&self, key: &[u8], chunk: &[u8]) -> Result<Pointer> {
        if !self.codec.supports_append() {
            return Err(StoreError::Invalid("value codec does not support append"));
        }
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        let pointer = match state.index.find_value(key)? {
            Lookup::Found(old) => self.append_value(&mut state.data, old, chunk)?,
            Lookup::NotFound => self.store_value(&mut state.data, chunk)?,
        };
        state.index.add_value(key, pointer)?;
        Ok(pointer)
    }

    /// Removes `key` and its value; returns whether the key existed.
    pub fn remove_key(&self, key: &[u8]) -> Result<bool> {
        let mut guard = self.state.write()?;
        let state = &mut *guard;
        state.data.ensure_writable()?;
        match state.index.remove_value(key)? {
            Lookup::Found(pointer) => {
                self.remove_value(&mut state.data, pointer)?;
                Ok(true)
            }
            Lookup::NotFound => Ok(false),
        }
    }

    /// Keys selected by `predicate` with their values, in key order.
    pub fn find(&self, predicate: &KeyPredicate) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let stored = {
            let state = self.state.read()?;
            let mut out = Vec::new();
            for (key, pointer) in state.index.query(predicate)? {
                out.push((key, read_value(&state.data, pointer)?));
            }
            out
        };
        stored
            .into_iter()
            .map(|(key, value)| Ok((key, self.codec.decode(value)?)))
            .collect()
    }

    /// Every key, in key order.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.state.read()?;
        Ok(state
            .index
            .query(&KeyPredicate::All)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Writes dirty pages and the file header.
    pub fn flush(&self) -> Result<()> {
        self.state.write()?.data.flush()
    }

    /// Flushes and releases the file, returning the key index.
    pub fn close(self) -> Result<I> {
        let RecordState { data, index } = self.state.into_inner();
        data.close()?;
        Ok(index)
    }

    /// Hit, miss and eviction counters of the page buffer.
    pub fn buffer_stats(&self) -> Result<BufferStats> {
        Ok(self.state.read()?.data.buffer_stats())
    }

    /// Copy of the file header as currently held in memory.
    pub fn file_header(&self) -> Result<FileHeader> {
        Ok(self.state.read()?.data.header().clone())
    }

    /// Copy of a page as the store currently sees it.
    pub fn page_snapshot(&self, page: PageNo) -> Result<DataPage> {
        self.state.read()?.data.page_snapshot(page)
    }

    /// Free-space registry entries, tightest first.
    pub fn free_space(&self) -> Result<Vec<FreeSpace>> {
        Ok(self.state.read()?.data.free_space().entries().to_vec())
    }

    /// Bytes per page available for records.
    pub fn work_size(&self) -> Result<usize> {
        Ok(self.state.read()?.data.work_size())
    }

    /// State of the file lock, for diagnostics.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.state.snapshot()
    }

    /// Consistency check of every page in the file.
    pub fn verify(&self) -> Result<VerifyReport> {
        verify_file(&self.state.read()?.data)
    }

    fn store_value(&self, data: &mut DataFile, bytes: &[u8]) -> Result<Pointer> {
        let needed = bytes.len() + SLOT_OVERHEAD;
        if needed > data.work_size() {
            let (chain, slot) = OverflowChain::create(data, bytes)?;
            self.metrics.value_stored(true);
            return Ok(chain.pointer(slot));
        }
        while let Some(page) = data.free_space().find_candidate(needed) {
            match place(data, page, bytes)? {
                Placement::Stored { slot, remaining } => {
                    data.note_free_space(page, remaining);
                    data.prioritize(page, PRIORITY_RECORD);
                    self.metrics.value_stored(false);
                    trace!(page = page.0, slot, len = bytes.len(), "record.store");
                    return Ok(Pointer::new(page, slot));
                }
                Placement::NotRecord(status) => {
                    warn!(page = page.0, ?status, "free_space.not_a_record_page");
                    data.free_space_mut().forget(page);
                }
                Placement::Short(actual) => {
                    self.metrics.stale_candidate();
                    data.free_space_mut().reconcile(page, actual as u32);
                }
                Placement::Exhausted => {
                    debug!(page = page.0, "free_space.slots_exhausted");
                    data.free_space_mut().forget(page);
                }
            }
        }
        let page = data.allocate_page(PageStatus::Record, PRIORITY_RECORD)?;
        match place(data, page, bytes)? {
            Placement::Stored { slot, remaining } => {
                data.note_free_space(page, remaining);
                self.metrics.value_stored(false);
                trace!(page = page.0, slot, len = bytes.len(), "record.store");
                Ok(Pointer::new(page, slot))
            }
            _ => Err(StoreError::corruption(page, "fresh record page rejected a record")),
        }
    }

    fn remove_value(&self, data: &mut DataFile, pointer: Pointer) -> Result<()> {
        let (page, slot) = pointer.decode();
        match resolve(data, pointer)? {
            Location::Record(_) => {
                let (count, remaining) = data.with_page_mut(page, |p| {
                    p.remove(slot)?;
                    Ok((p.record_count(), p.remaining()))
                })?;
                if count == 0 {
                    data.free_page(page)?;
                    self.metrics.page_reclaimed();
                    debug!(page = page.0, "record.page_reclaimed");
                } else {
                    data.note_free_space(page, remaining);
                }
                trace!(%pointer, "record.remove");
            }
            Location::Chain(chain) => {
                chain.delete(data)?;
            }
        }
        self.metrics.value_removed();
        Ok(())
    }

    fn update_value(&self, data: &mut DataFile, pointer: Pointer, bytes: &[u8]) -> Result<Pointer> {
        let fits = bytes.len() + SLOT_OVERHEAD <= data.work_size();
        let (page, slot) = pointer.decode();
        match resolve(data, pointer)? {
            Location::Chain(chain) if !fits => {
                chain.rewrite(data, bytes)?;
                Ok(pointer)
            }
            Location::Chain(chain) => {
                chain.delete(data)?;
                self.metrics.chain_collapsed();
                let new = self.store_value(data, bytes)?;
                debug!(old = %pointer, new = %new, "record.collapse");
                Ok(new.with_tag(pointer.tag()))
            }
            Location::Record(_) => {
                if fits {
                    let replaced = data.with_page_mut(page, |p| match p.replace(slot, bytes) {
                        Ok(()) => Ok(Some(p.remaining())),
                        Err(StoreError::PageFull { .. }) => Ok(None),
                        Err(err) => Err(err),
                    })?;
                    if let Some(remaining) = replaced {
                        data.note_free_space(page, remaining);
                        trace!(%pointer, len = bytes.len(), "record.update_in_place");
                        return Ok(pointer);
                    }
                }
                self.remove_value(data, pointer)?;
                let new = self.store_value(data, bytes)?;
                debug!(old = %pointer, new = %new, "record.relocate");
                Ok(new.with_tag(pointer.tag()))
            }
        }
    }

    fn append_value(&self, data: &mut DataFile, pointer: Pointer, chunk: &[u8]) -> Result<Pointer> {
        let (page, slot) = pointer.decode();
        let new = match resolve(data, pointer)? {
            Location::Chain(chain) => {
                chain.append(data, chunk)?;
                pointer
            }
            Location::Record(pos) => {
                let mut fast = None;
                if pos.len + chunk.len() + SLOT_OVERHEAD <= data.work_size() {
                    fast = data.with_page_mut(page, |p| match p.append(slot, chunk) {
                        Ok(()) => Ok(Some(p.remaining())),
                        Err(StoreError::PageFull { .. }) => Ok(None),
                        Err(err) => Err(err),
                    })?;
                }
                match fast {
                    Some(remaining) => {
                        data.note_free_space(page, remaining);
                        pointer
                    }
                    None => {
                        let mut value = data.with_page(page, |p| Ok(p.payload(&pos).to_vec()))?;
                        value.extend_from_slice(chunk);
                        self.remove_value(data, pointer)?;
                        let new = self.store_value(data, &value)?;
                        debug!(old = %pointer, new = %new, len = value.len(), "record.append_relocate");
                        new.with_tag(pointer.tag())
                    }
                }
            }
        };
        self.metrics.value_appended(chunk.len());
        Ok(new)
    }
}

fn place(data: &mut DataFile, page: PageNo, bytes: &[u8]) -> Result<Placement> {
    data.with_page_mut(page, |p| {
        if p.status() != PageStatus::Record {
            return Ok(Placement::NotRecord(p.status()));
        }
        if p.slots_exhausted() {
            return Ok(Placement::Exhausted);
        }
        if p.remaining() < bytes.len() + SLOT_OVERHEAD {
            return Ok(Placement::Short(p.remaining()));
        }
        let slot = p.insert(bytes)?;
        Ok(Placement::Stored {
            slot,
            remaining: p.remaining(),
        })
    })
}

fn resolve(data: &DataFile, pointer: Pointer) -> Result<Location> {
    let (page, slot) = pointer.decode();
    data.with_page(page, |p| match p.status() {
        PageStatus::Record => {
            let pos = p.locate(slot)?;
            if pos.kind != RecordKind::Inline {
                return Err(CorruptionReport::pointer(pointer, "node record in a record store").into());
            }
            Ok(Location::Record(pos))
        }
        PageStatus::MultiPage if OverflowChain::owns_slot(p, slot) => {
            Ok(Location::Chain(OverflowChain::new(page)))
        }
        PageStatus::MultiPage | PageStatus::FreeList => Err(StoreError::SlotNotFound { pointer }),
        PageStatus::Lob => Err(CorruptionReport::pointer(
            pointer,
            "pointer addresses an overflow continuation page",
        )
        .into()),
    })
}

fn read_value(data: &DataFile, pointer: Pointer) -> Result<Vec<u8>> {
    let (page, _) = pointer.decode();
    match resolve(data, pointer)? {
        Location::Record(pos) => data.with_page(page, |p| Ok(p.payload(&pos).to_vec())),
        Location::Chain(chain) => chain.read(data),
    }
}
