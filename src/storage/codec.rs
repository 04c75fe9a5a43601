//! Pluggable value codecs applied by the record store.
#![forbid(unsafe_code)]

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::types::{CorruptionReport, Result};

/// Codec selection, persisted as one byte in the file header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Values are stored as given.
    #[default]
    Plain,
    /// Values are compressed with Snappy.
    Snappy,
}

impl CodecKind {
    /// Header byte.
    pub const fn id(self) -> u8 {
        match self {
            CodecKind::Plain => 0,
            CodecKind::Snappy => 1,
        }
    }

    /// Parses a header byte.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CodecKind::Plain),
            1 => Ok(CodecKind::Snappy),
            _ => Err(CorruptionReport::file("unknown value codec").into()),
        }
    }

    /// Instantiates the codec.
    pub fn build(self) -> Box<dyn ValueCodec> {
        match self {
            CodecKind::Plain => Box::new(PlainCodec),
            CodecKind::Snappy => Box::new(SnappyCodec),
        }
    }
}

/// Transforms values on their way to and from pages.
pub trait ValueCodec: Send + Sync {
    /// Which codec this is.
    fn kind(&self) -> CodecKind;
    /// Stored form of `raw`.
    fn encode<'a>(&self, raw: &'a [u8]) -> Result<Cow<'a, [u8]>>;
    /// Logical form of `stored`.
    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>>;
    /// Whether stored bytes can be extended by appending encoded chunks.
    fn supports_append(&self) -> bool;
}

/// Identity codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainCodec;

impl ValueCodec for PlainCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Plain
    }

    fn encode<'a>(&self, raw: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(raw))
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        Ok(stored)
    }

    fn supports_append(&self) -> bool {
        true
    }
}

/// Snappy raw-format compression of whole values.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnappyCodec;

impl ValueCodec for SnappyCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Snappy
    }

    fn encode<'a>(&self, raw: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Owned(snap::raw::Encoder::new().compress_vec(raw)?))
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        Ok(snap::raw::Decoder::new().decompress_vec(&stored)?)
    }

    fn supports_append(&self) -> bool {
        false
    }
}
