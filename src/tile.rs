//! Compressed storage tiles.
//!
//! A tile holds a run of consecutive storage elements, filtered as one unit.
//! Tiles are laid end to end in storage order, each a fixed header followed
//! by its payload.  All header fields are little-endian:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0  | 4 | magic `TILE` |
//! | 4  | 8 | first storage element |
//! | 12 | 4 | element count |
//! | 16 | 1 | filter id (see [`crate::codec`]) |
//! | 17 | 3 | reserved, zero |
//! | 20 | 4 | decoded length in bytes |
//! | 24 | 4 | payload length in bytes |
//! | 28 | 4 | CRC32 of the payload |
//!
//! [`TileReader`] is a [`SegmentSource`]: it walks tiles forward, skipping
//! (without decoding) any tile that ends before the requested element.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use thiserror::Error;

use crate::codec::{get_filter, FilterError, FilterId};
use crate::layout::{LayoutError, Segment, SegmentSource};

pub const TILE_MAGIC: u32 = u32::from_le_bytes(*b"TILE");
pub const TILE_HEADER_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum TileError {
    #[error("Invalid tile magic {0:#010x}")]
    InvalidMagic(u32),
    #[error("Tile at element {first_elem}: payload checksum mismatch")]
    ChecksumMismatch { first_elem: u64 },
    #[error("Tile at element {first_elem} decoded to {actual} bytes, expected {expected}")]
    SizeMismatch { first_elem: u64, expected: u64, actual: u64 },
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileHeader {
    pub first_elem: u64,
    pub n_elems:    u32,
    pub filter:     FilterId,
    pub raw_len:    u32,
    pub comp_len:   u32,
    pub checksum:   u32,
}

impl TileHeader {
    /// Header for `payload`, with the checksum computed over it.
    pub fn for_payload(first_elem: u64, n_elems: u32, filter: FilterId, raw_len: u32, payload: &[u8]) -> Self {
        Self {
            first_elem,
            n_elems,
            filter,
            raw_len,
            comp_len: payload.len() as u32,
            checksum: tile_checksum(payload),
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(TILE_MAGIC)?;
        writer.write_u64::<LittleEndian>(self.first_elem)?;
        writer.write_u32::<LittleEndian>(self.n_elems)?;
        writer.write_u8(self.filter as u8)?;
        writer.write_all(&[0u8; 3])?;
        writer.write_u32::<LittleEndian>(self.raw_len)?;
        writer.write_u32::<LittleEndian>(self.comp_len)?;
        writer.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, TileError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != TILE_MAGIC {
            return Err(TileError::InvalidMagic(magic));
        }
        let first_elem = reader.read_u64::<LittleEndian>()?;
        let n_elems    = reader.read_u32::<LittleEndian>()?;
        let filter_id  = reader.read_u8()?;
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        let filter = FilterId::from_u8(filter_id).ok_or(FilterError::Unknown(filter_id))?;
        Ok(Self {
            first_elem,
            n_elems,
            filter,
            raw_len:  reader.read_u32::<LittleEndian>()?,
            comp_len: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn end_elem(&self) -> u64 {
        self.first_elem + self.n_elems as u64
    }
}

pub fn tile_checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Verify and decode one tile payload.
pub fn decode_tile(header: &TileHeader, payload: &[u8]) -> Result<Vec<u8>, TileError> {
    if tile_checksum(payload) != header.checksum {
        return Err(TileError::ChecksumMismatch { first_elem: header.first_elem });
    }
    let raw = get_filter(header.filter).decode(payload, header.raw_len as usize)?;
    if raw.len() != header.raw_len as usize {
        return Err(TileError::SizeMismatch {
            first_elem: header.first_elem,
            expected:   header.raw_len as u64,
            actual:     raw.len() as u64,
        });
    }
    Ok(raw)
}

// ── TileReader ────────────────────────────────────────────────────────────────

/// Forward-only tile walker over a seekable stream.
pub struct TileReader<R: Read + Seek> {
    reader:      R,
    elem_size:   usize,
    next_offset: u64,
}

impl<R: Read + Seek> TileReader<R> {
    /// Tiles start at byte `offset` of `reader`.
    pub fn new(reader: R, elem_size: usize, offset: u64) -> Self {
        Self { reader, elem_size, next_offset: offset }
    }

    pub fn into_inner(self) -> R { self.reader }

    /// Header at `next_offset`, or `None` at end of stream.
    fn peek_header(&mut self) -> Result<Option<TileHeader>, TileError> {
        self.reader.seek(SeekFrom::Start(self.next_offset))?;
        match TileHeader::read(&mut self.reader) {
            Ok(h) => Ok(Some(h)),
            Err(TileError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<R: Read + Seek> SegmentSource for TileReader<R> {
    fn segment_for(&mut self, elem: u64) -> Result<Option<Segment>, LayoutError> {
        loop {
            let header = match self.peek_header()? {
                Some(h) => h,
                None    => return Ok(None),
            };
            let tile_len = TILE_HEADER_SIZE as u64 + header.comp_len as u64;

            if header.end_elem() <= elem {
                tracing::trace!(first_elem = header.first_elem, "skipping tile");
                self.next_offset += tile_len;
                continue;
            }
            if header.first_elem > elem {
                // Gap in storage; leave this tile for a later request.
                return Ok(None);
            }

            let expected = header.n_elems as u64 * self.elem_size as u64;
            if header.raw_len as u64 != expected {
                return Err(TileError::SizeMismatch {
                    first_elem: header.first_elem,
                    expected,
                    actual: header.raw_len as u64,
                }
                .into());
            }

            let mut payload = vec![0u8; header.comp_len as usize];
            self.reader.read_exact(&mut payload).map_err(TileError::from)?;
            let raw = decode_tile(&header, &payload)?;
            self.next_offset += tile_len;

            tracing::debug!(
                first_elem = header.first_elem,
                n_elems = header.n_elems,
                filter = header.filter.name(),
                "decoded tile"
            );
            return Ok(Some(Segment::new(header.first_elem, header.n_elems as u64, raw)));
        }
    }
}
