//! Frame formats: what a record looks like on the wire.
//!
//! The scanner core knows nothing about any particular binary format.  A
//! [`FrameFormat`] tells it the magic, how to read the declared length, what
//! the trailer is, and how to split a framed byte range into typed parts.
//! Length disambiguation for producers that overflow their length field is a
//! separate [`LengthRepair`] strategy owned by the format, so the quirk of one
//! producer never leaks into another format.

use std::io::{self, Read, Seek};
use std::ops::Range;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use thiserror::Error;

use crate::dedup::PartKind;

/// Magic-relative distance the scanner skips after a bad frame before
/// searching again.
pub const DEFAULT_RESYNC_SKIP: u64 = 20;

/// Object-safe `Read + Seek`, so formats can be used behind `dyn`.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// What the scanner learned from the bytes right after a magic match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    /// Stream offset of the magic.
    pub magic_pos:    u64,
    /// Raw value of the length field as stored.
    pub length_field: u64,
    /// Record length, magic through trailer, implied by the length field.
    pub declared_len: u64,
}

/// A framed byte range that does not parse into a well-formed record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed record: {0}")]
    Malformed(String),
    #[error("Record truncated: needs {needed} bytes, has {available}")]
    Truncated { needed: usize, available: usize },
}

/// A typed part of a frame, as a byte range within the frame.
pub type PartSpan = (PartKind, Range<usize>);

/// Strategy for recovering the true length of a record whose length field
/// cannot represent it.
pub trait LengthRepair {
    /// `Ok(Some(len))` replaces the declared length with `len`; `Ok(None)`
    /// keeps it.  The stream may be left anywhere.
    fn repair(&self, stream: &mut dyn ReadSeek, prologue: &Prologue) -> io::Result<Option<u64>>;
}

/// Trust the declared length.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepair;

impl LengthRepair for NoRepair {
    fn repair(&self, _: &mut dyn ReadSeek, _: &Prologue) -> io::Result<Option<u64>> {
        Ok(None)
    }
}

pub trait FrameFormat {
    fn name(&self) -> &str;

    fn magic(&self) -> &[u8];

    /// Bytes that end every well-formed record.  May be empty.
    fn trailer(&self) -> &[u8];

    /// Read the length field.  The stream is positioned right after the
    /// magic.  `Ok(None)` means this magic hit belongs to some other format
    /// (or edition) and the search should simply continue past it.
    fn read_prologue(&self, stream: &mut dyn ReadSeek, magic_pos: u64) -> io::Result<Option<Prologue>>;

    fn length_repair(&self) -> &dyn LengthRepair;

    /// Shortest possible record; shorter resolved lengths are framing faults.
    fn min_frame_len(&self) -> u64;

    /// End offset implied by the record's inner structure, when it has one.
    /// Consulted only under the lenient-length policy.
    fn inner_end(&self, _stream: &mut dyn ReadSeek, _magic_pos: u64) -> io::Result<Option<u64>> {
        Ok(None)
    }

    /// Split a framed record (magic through trailer) into parts.
    fn parse(&self, frame: &[u8]) -> Result<Vec<PartSpan>, FrameError>;

    /// Parts of this kind are interned across records.
    fn is_shared(&self, kind: PartKind) -> bool;

    /// Bytes past a bad magic at which the search resumes.  Values below 1
    /// are treated as 1.
    fn resync_skip(&self) -> u64 {
        DEFAULT_RESYNC_SKIP
    }
}

// ── TaggedFrames ──────────────────────────────────────────────────────────────

/// How a [`TaggedFrames`] payload is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyLayout {
    /// The whole payload is one [`PartKind::PAYLOAD`] part.
    #[default]
    Opaque,
    /// A sequence of `kind: u8, len: u16 BE, data[len]` parts that exactly
    /// fills the payload.
    Tagged,
}

/// `magic | length (BE, payload bytes) | payload | trailer`.
pub struct TaggedFrames {
    name:      String,
    magic:     Vec<u8>,
    trailer:   Vec<u8>,
    len_width: usize,
    body:      BodyLayout,
    shared:    Vec<PartKind>,
    repair:    Box<dyn LengthRepair>,
    skip:      u64,
}

impl TaggedFrames {
    /// `len_width` is the size of the length field in bytes, clamped to 1..=8.
    pub fn new(magic: &[u8], len_width: usize, trailer: &[u8]) -> Self {
        Self {
            name:      format!("tagged:{}", String::from_utf8_lossy(magic)),
            magic:     magic.to_vec(),
            trailer:   trailer.to_vec(),
            len_width: len_width.clamp(1, 8),
            body:      BodyLayout::Opaque,
            shared:    Vec::new(),
            repair:    Box::new(NoRepair),
            skip:      DEFAULT_RESYNC_SKIP,
        }
    }

    pub fn with_body(mut self, body: BodyLayout) -> Self {
        self.body = body;
        self
    }

    pub fn with_shared(mut self, kinds: impl IntoIterator<Item = PartKind>) -> Self {
        self.shared = kinds.into_iter().collect();
        self
    }

    pub fn with_repair(mut self, repair: impl LengthRepair + 'static) -> Self {
        self.repair = Box::new(repair);
        self
    }

    /// Bytes past a bad magic at which the search resumes.  Keep it no
    /// larger than the shortest frame, or a bad short frame hides the next.
    pub fn with_resync_skip(mut self, skip: u64) -> Self {
        self.skip = skip.max(1);
        self
    }

    fn payload_start(&self) -> usize {
        self.magic.len() + self.len_width
    }

    fn parse_tagged(payload: Range<usize>, frame: &[u8]) -> Result<Vec<PartSpan>, FrameError> {
        let mut parts = Vec::new();
        let mut pos   = payload.start;
        while pos < payload.end {
            if pos + 3 > payload.end {
                return Err(FrameError::Malformed(format!("part header at {pos} overruns payload")));
            }
            let kind = PartKind(frame[pos]);
            let len  = BigEndian::read_u16(&frame[pos + 1..pos + 3]) as usize;
            let data = pos + 3..pos + 3 + len;
            if data.end > payload.end {
                return Err(FrameError::Malformed(format!(
                    "part of kind {} with {len} bytes overruns payload",
                    kind.0
                )));
            }
            pos = data.end;
            parts.push((kind, data));
        }
        Ok(parts)
    }
}

impl FrameFormat for TaggedFrames {
    fn name(&self) -> &str { &self.name }

    fn magic(&self) -> &[u8] { &self.magic }

    fn trailer(&self) -> &[u8] { &self.trailer }

    fn read_prologue(&self, stream: &mut dyn ReadSeek, magic_pos: u64) -> io::Result<Option<Prologue>> {
        let length_field = stream.read_uint::<BigEndian>(self.len_width)?;
        Ok(Some(Prologue {
            magic_pos,
            length_field,
            declared_len: length_field.saturating_add(self.min_frame_len()),
        }))
    }

    fn length_repair(&self) -> &dyn LengthRepair { self.repair.as_ref() }

    fn min_frame_len(&self) -> u64 {
        (self.payload_start() + self.trailer.len()) as u64
    }

    fn parse(&self, frame: &[u8]) -> Result<Vec<PartSpan>, FrameError> {
        let min = self.min_frame_len() as usize;
        if frame.len() < min {
            return Err(FrameError::Truncated { needed: min, available: frame.len() });
        }
        if !frame.starts_with(&self.magic) {
            return Err(FrameError::Malformed("frame does not start with magic".into()));
        }
        let payload = self.payload_start()..frame.len() - self.trailer.len();
        match self.body {
            BodyLayout::Opaque => Ok(vec![(PartKind::PAYLOAD, payload)]),
            BodyLayout::Tagged => Self::parse_tagged(payload, frame),
        }
    }

    fn is_shared(&self, kind: PartKind) -> bool {
        self.shared.contains(&kind)
    }

    fn resync_skip(&self) -> u64 { self.skip }
}
