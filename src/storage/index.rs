//! Interface to the external key index that maps keys to record pointers.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::{Pointer, Result};

/// Outcome of a key lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// The key maps to this pointer.
    Found(Pointer),
    /// The key is absent.
    NotFound,
}

impl Lookup {
    /// Pointer, if the key was found.
    pub fn pointer(self) -> Option<Pointer> {
        match self {
            Lookup::Found(pointer) => Some(pointer),
            Lookup::NotFound => None,
        }
    }
}

impl From<Option<Pointer>> for Lookup {
    fn from(value: Option<Pointer>) -> Self {
        value.map_or(Lookup::NotFound, Lookup::Found)
    }
}

/// Key selection for [`ValueIndex::query`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyPredicate {
    /// Every key.
    All,
    /// Keys starting with the given bytes.
    Prefix(Vec<u8>),
    /// Keys inside the given bounds.
    Range(Bound<Vec<u8>>, Bound<Vec<u8>>),
}

impl KeyPredicate {
    /// Whether `key` is selected.
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            KeyPredicate::All => true,
            KeyPredicate::Prefix(prefix) => key.starts_with(prefix),
            KeyPredicate::Range(start, end) => {
                let above = match start {
                    Bound::Included(s) => key >= s.as_slice(),
                    Bound::Excluded(s) => key > s.as_slice(),
                    Bound::Unbounded => true,
                };
                let below = match end {
                    Bound::Included(e) => key <= e.as_slice(),
                    Bound::Excluded(e) => key < e.as_slice(),
                    Bound::Unbounded => true,
                };
                above && below
            }
        }
    }
}

/// Key to pointer mapping maintained alongside the record pages.
///
/// Implementations must accept a new pointer for an existing key whenever an
/// update or append relocates a value.
pub trait ValueIndex: Send + Sync {
    /// Looks up `key`.
    fn find_value(&self, key: &[u8]) -> Result<Lookup>;
    /// Maps `key` to `pointer`, replacing any previous mapping.
    fn add_value(&mut self, key: &[u8], pointer: Pointer) -> Result<()>;
    /// Removes `key`, returning what it mapped to.
    fn remove_value(&mut self, key: &[u8]) -> Result<Lookup>;
    /// Keys selected by `predicate` with their pointers, in key order.
    fn query(&self, predicate: &KeyPredicate) -> Result<Vec<(Vec<u8>, Pointer)>>;
}

/// In-memory ordered index.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndex {
    entries: BTreeMap<Vec<u8>, Pointer>,
}

impl MemoryIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ValueIndex for MemoryIndex {
    fn find_value(&self, key: &[u8]) -> Result<Lookup> {
        Ok(self.entries.get(key).copied().into())
    }

    fn add_value(&mut self, key: &[u8], pointer: Pointer) -> Result<()> {
        self.entries.insert(key.to_vec(), pointer);
        Ok(())
    }

    fn remove_value(&mut self, key: &[u8]) -> Result<Lookup> {
        Ok(self.entries.remove(key).into())
    }

    fn query(&self, predicate: &KeyPredicate) -> Result<Vec<(Vec<u8>, Pointer)>> {
        let selected = match predicate {
            KeyPredicate::Range(start, end) if !is_empty_range(start, end) => self
                .entries
                .range::<Vec<u8>, _>((start.as_ref(), end.as_ref()))
                .map(|(k, p)| (k.clone(), *p))
                .collect(),
            _ => self
                .entries
                .iter()
                .filter(|(k, _)| predicate.matches(k))
                .map(|(k, p)| (k.clone(), *p))
                .collect(),
        };
        Ok(selected)
    }
}

// BTreeMap::range panics on inverted bounds.
fn is_empty_range(start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s) | Bound::Excluded(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
        _ => false,
    }
}
