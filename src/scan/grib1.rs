//! GRIB edition 1 framing.
//!
//! A message is `GRIB`, a 3-byte big-endian total length, the edition byte,
//! then the sections:
//!
//! | Section | Present | Length field |
//! |---------|---------|--------------|
//! | IS  (indicator)          | always                  | fixed 8 bytes |
//! | PDS (product definition) | always                  | 3 bytes BE |
//! | GDS (grid definition)    | PDS flag octet bit 0x80 | 3 bytes BE |
//! | BMS (bit map)            | PDS flag octet bit 0x40 | 3 bytes BE |
//! | BDS (binary data)        | always                  | 3 bytes BE |
//!
//! and the trailer `7777`.  The grid definition is the interned part: a file
//! of many fields on the same grid carries the same GDS bytes in every
//! message.

use std::io::{self, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::bits::{BitError, BitReader};
use crate::dedup::PartKind;
use crate::scan::format::{FrameError, FrameFormat, LengthRepair, PartSpan, Prologue, ReadSeek};

pub const GRIB_MAGIC:   &[u8; 4] = b"GRIB";
pub const GRIB_TRAILER: &[u8; 4] = b"7777";
/// Indicator section length (magic, length, edition).
pub const INDICATOR_LEN: u64 = 8;
pub const ECMWF_CENTER: u8 = 98;

pub const INDICATOR: PartKind = PartKind(0);
pub const PRODUCT:   PartKind = PartKind(1);
pub const GRID:      PartKind = PartKind(2);
pub const BITMAP:    PartKind = PartKind(3);
pub const DATA:      PartKind = PartKind(4);

const FLAG_GDS: u8 = 0x80;
const FLAG_BMS: u8 = 0x40;
/// Octet (0-based) of the section flags within the PDS.
const PDS_FLAG_OCTET: usize = 7;
const BDS_HEADER_LEN: usize = 11;

// ── Length repair ─────────────────────────────────────────────────────────────

/// Length recovery for GRIBEX "large GRIB" messages.
///
/// GRIBEX sets bit 0x800000 of the total length when a message exceeds the
/// 24-bit field and stores the length in units of 120 bytes instead.  The
/// true length is then `(len & 0x7FFFFF) * 120 - lenBDS + 4`, where lenBDS
/// (the data section's own length field) is below 120 in that encoding.
/// Only applied to messages from centre 98.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcmwfLargeGrib;

impl LengthRepair for EcmwfLargeGrib {
    fn repair(&self, stream: &mut dyn ReadSeek, prologue: &Prologue) -> io::Result<Option<u64>> {
        if prologue.length_field & 0x80_0000 == 0 {
            return Ok(None);
        }
        let pds_start = prologue.magic_pos + INDICATOR_LEN;
        stream.seek(SeekFrom::Start(pds_start))?;
        let pds_len = stream.read_u24::<BigEndian>()? as u64;
        stream.seek(SeekFrom::Current(1))?;
        if stream.read_u8()? != ECMWF_CENTER {
            return Ok(None);
        }
        stream.seek(SeekFrom::Current(2))?;
        let flags = stream.read_u8()?;

        let Some(bds_start) = skip_optional_sections(stream, pds_start, pds_len, flags)? else {
            return Ok(None);
        };
        stream.seek(SeekFrom::Start(bds_start))?;
        let bds_len = stream.read_u24::<BigEndian>()? as u64;
        if bds_len >= 120 {
            return Ok(None);
        }
        let repaired = ((prologue.length_field & 0x7F_FFFF) * 120 + 4).checked_sub(bds_len);
        tracing::debug!(
            magic_pos = prologue.magic_pos,
            declared = prologue.length_field,
            ?repaired,
            "large GRIB length"
        );
        Ok(repaired)
    }
}

/// Walk past PDS, GDS and BMS on the stream; returns the BDS offset.
fn skip_optional_sections(
    stream:    &mut dyn ReadSeek,
    pds_start: u64,
    pds_len:   u64,
    flags:     u8,
) -> io::Result<Option<u64>> {
    if pds_len < (PDS_FLAG_OCTET + 1) as u64 {
        return Ok(None);
    }
    let mut pos = pds_start + pds_len;
    for present in [flags & FLAG_GDS != 0, flags & FLAG_BMS != 0] {
        if !present {
            continue;
        }
        stream.seek(SeekFrom::Start(pos))?;
        let len = stream.read_u24::<BigEndian>()? as u64;
        if len < 3 {
            return Ok(None);
        }
        pos += len;
    }
    Ok(Some(pos))
}

// ── Format ────────────────────────────────────────────────────────────────────

pub struct Grib1Format {
    repair: Box<dyn LengthRepair>,
}

impl Default for Grib1Format {
    fn default() -> Self {
        Self { repair: Box::new(EcmwfLargeGrib) }
    }
}

impl Grib1Format {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repair(repair: impl LengthRepair + 'static) -> Self {
        Self { repair: Box::new(repair) }
    }
}

/// Length of the section at `pos`, bounded by `limit`.
fn section_len(frame: &[u8], pos: usize, limit: usize, name: &str) -> Result<usize, FrameError> {
    if pos + 3 > limit {
        return Err(FrameError::Malformed(format!("{name} section at {pos} starts past the message body")));
    }
    let len = BigEndian::read_u24(&frame[pos..pos + 3]) as usize;
    if len < 3 || pos + len > limit {
        return Err(FrameError::Malformed(format!(
            "{name} section length {len} at {pos} overruns message of {} bytes",
            frame.len()
        )));
    }
    Ok(len)
}

impl FrameFormat for Grib1Format {
    fn name(&self) -> &str { "grib1" }

    fn magic(&self) -> &[u8] { GRIB_MAGIC }

    fn trailer(&self) -> &[u8] { GRIB_TRAILER }

    fn read_prologue(&self, stream: &mut dyn ReadSeek, magic_pos: u64) -> io::Result<Option<Prologue>> {
        let length_field = stream.read_u24::<BigEndian>()? as u64;
        let edition      = stream.read_u8()?;
        if edition != 1 {
            return Ok(None);
        }
        Ok(Some(Prologue { magic_pos, length_field, declared_len: length_field }))
    }

    fn length_repair(&self) -> &dyn LengthRepair { self.repair.as_ref() }

    fn min_frame_len(&self) -> u64 {
        INDICATOR_LEN + GRIB_TRAILER.len() as u64
    }

    fn inner_end(&self, stream: &mut dyn ReadSeek, magic_pos: u64) -> io::Result<Option<u64>> {
        let pds_start = magic_pos + INDICATOR_LEN;
        stream.seek(SeekFrom::Start(pds_start))?;
        let pds_len = stream.read_u24::<BigEndian>()? as u64;
        stream.seek(SeekFrom::Start(pds_start + PDS_FLAG_OCTET as u64))?;
        let flags = stream.read_u8()?;

        let Some(bds_start) = skip_optional_sections(stream, pds_start, pds_len, flags)? else {
            return Ok(None);
        };
        stream.seek(SeekFrom::Start(bds_start))?;
        let bds_len = stream.read_u24::<BigEndian>()? as u64;
        if bds_len < 3 {
            return Ok(None);
        }
        Ok(Some(bds_start + bds_len + GRIB_TRAILER.len() as u64))
    }

    fn parse(&self, frame: &[u8]) -> Result<Vec<PartSpan>, FrameError> {
        let min = self.min_frame_len() as usize;
        if frame.len() < min {
            return Err(FrameError::Truncated { needed: min, available: frame.len() });
        }
        if !frame.starts_with(GRIB_MAGIC) {
            return Err(FrameError::Malformed("frame does not start with GRIB".into()));
        }
        // Sections must end before the trailer.
        let limit = frame.len() - GRIB_TRAILER.len();
        let mut parts = vec![(INDICATOR, 0..INDICATOR_LEN as usize)];
        let mut pos   = INDICATOR_LEN as usize;

        let pds_len = section_len(frame, pos, limit, "product definition")?;
        if pds_len <= PDS_FLAG_OCTET {
            return Err(FrameError::Malformed(format!("product definition section too short: {pds_len}")));
        }
        let flags = frame[pos + PDS_FLAG_OCTET];
        parts.push((PRODUCT, pos..pos + pds_len));
        pos += pds_len;

        if flags & FLAG_GDS != 0 {
            let len = section_len(frame, pos, limit, "grid definition")?;
            parts.push((GRID, pos..pos + len));
            pos += len;
        }
        if flags & FLAG_BMS != 0 {
            let len = section_len(frame, pos, limit, "bit map")?;
            parts.push((BITMAP, pos..pos + len));
            pos += len;
        }

        let bds_len = section_len(frame, pos, limit, "binary data")?;
        if bds_len < BDS_HEADER_LEN {
            return Err(FrameError::Malformed(format!("binary data section too short: {bds_len}")));
        }
        parts.push((DATA, pos..pos + bds_len));
        Ok(parts)
    }

    fn is_shared(&self, kind: PartKind) -> bool {
        kind == GRID
    }
}

// ── Binary data section header ────────────────────────────────────────────────

/// Fixed 11-octet header of a GRIB-1 binary data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryDataHeader {
    pub length:         u32,
    /// High nibble of octet 4: packing flags.
    pub flags:          u8,
    /// Low nibble of octet 4: unused bits at the end of the section.
    pub unused_bits:    u8,
    /// Binary scale factor E (sign-magnitude).
    pub binary_scale:   i16,
    /// IBM single-precision reference value, undecoded.
    pub reference_bits: u32,
    pub bits_per_value: u8,
}

impl BinaryDataHeader {
    pub fn parse(section: &[u8]) -> Result<Self, BitError> {
        let mut bits = BitReader::new(section);
        Ok(Self {
            length:         bits.read_uint(24)? as u32,
            flags:          bits.read_uint(4)? as u8,
            unused_bits:    bits.read_uint(4)? as u8,
            binary_scale:   bits.read_sint(16)? as i16,
            reference_bits: bits.read_uint(32)? as u32,
            bits_per_value: bits.read_uint(8)? as u8,
        })
    }

    /// Packed values in the section, when the width is known.
    pub fn value_count(&self) -> Option<u64> {
        if self.bits_per_value == 0 {
            return None;
        }
        let payload_bits = (self.length as u64).checked_sub(BDS_HEADER_LEN as u64)? * 8;
        Some(payload_bits.checked_sub(self.unused_bits as u64)? / self.bits_per_value as u64)
    }
}
