//! Decode-only filter registry for compressed storage tiles.
//!
//! Each filter is identified on disk by a single byte.  Ids are permanent:
//! an id is never reused for a different algorithm.  Only the decode
//! direction exists here; this crate never writes compressed data.

use std::io::Read;
use thiserror::Error;

// ── FilterId ──────────────────────────────────────────────────────────────────

/// On-disk filter discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FilterId {
    None   = 0,
    Zstd   = 1,
    Lz4    = 2,
    Brotli = 3,
    Lzma   = 4,
}

impl FilterId {
    /// Resolve an on-disk id.  `None` if this build does not know it.
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(FilterId::None),
            1 => Some(FilterId::Zstd),
            2 => Some(FilterId::Lz4),
            3 => Some(FilterId::Brotli),
            4 => Some(FilterId::Lzma),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            FilterId::None   => "none",
            FilterId::Zstd   => "zstd",
            FilterId::Lz4    => "lz4",
            FilterId::Brotli => "brotli",
            FilterId::Lzma   => "lzma",
        }
    }
}

// ── Error type ────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("{filter} decode error: {reason}")]
    Decode { filter: &'static str, reason: String },
    #[error("Unknown filter id {0}")]
    Unknown(u8),
}

// ── Filter trait ──────────────────────────────────────────────────────────────

pub trait Filter: Send + Sync {
    fn filter_id(&self) -> FilterId;

    /// Decode `data`.  `raw_len` is the expected decoded size; filters that
    /// need an output bound use it, the caller checks it regardless.
    fn decode(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>, FilterError>;
}

fn decode_err(filter: FilterId, e: impl std::fmt::Display) -> FilterError {
    FilterError::Decode { filter: filter.name(), reason: e.to_string() }
}

// ── Built-in filters ──────────────────────────────────────────────────────────

pub struct NoneFilter;
impl Filter for NoneFilter {
    fn filter_id(&self) -> FilterId { FilterId::None }
    fn decode(&self, data: &[u8], _: usize) -> Result<Vec<u8>, FilterError> { Ok(data.to_vec()) }
}

pub struct ZstdFilter;
impl Filter for ZstdFilter {
    fn filter_id(&self) -> FilterId { FilterId::Zstd }
    fn decode(&self, data: &[u8], _: usize) -> Result<Vec<u8>, FilterError> {
        zstd::decode_all(data).map_err(|e| decode_err(FilterId::Zstd, e))
    }
}

/// Raw LZ4 block (no size prefix; the tile header carries the size).
pub struct Lz4Filter;
impl Filter for Lz4Filter {
    fn filter_id(&self) -> FilterId { FilterId::Lz4 }
    fn decode(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>, FilterError> {
        lz4_flex::decompress(data, raw_len).map_err(|e| decode_err(FilterId::Lz4, e))
    }
}

pub struct BrotliFilter;
impl Filter for BrotliFilter {
    fn filter_id(&self) -> FilterId { FilterId::Brotli }
    fn decode(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>, FilterError> {
        let mut out = Vec::with_capacity(raw_len);
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| decode_err(FilterId::Brotli, e))?;
        Ok(out)
    }
}

pub struct LzmaFilter;
impl Filter for LzmaFilter {
    fn filter_id(&self) -> FilterId { FilterId::Lzma }
    fn decode(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>, FilterError> {
        let mut out = Vec::with_capacity(raw_len);
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| decode_err(FilterId::Lzma, e))?;
        Ok(out)
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

pub fn get_filter(id: FilterId) -> Box<dyn Filter> {
    match id {
        FilterId::None   => Box::new(NoneFilter),
        FilterId::Zstd   => Box::new(ZstdFilter),
        FilterId::Lz4    => Box::new(Lz4Filter),
        FilterId::Brotli => Box::new(BrotliFilter),
        FilterId::Lzma   => Box::new(LzmaFilter),
    }
}
