use std::sync::Arc;

use crate::dedup::{PartKind, Subsection};

/// A part of one record: where it sat in the stream, and its (possibly
/// shared) content.
#[derive(Debug, Clone)]
pub struct RecordPart {
    /// Absolute stream offset of the part's first byte.
    pub offset:  u64,
    pub section: Arc<Subsection>,
}

impl RecordPart {
    pub fn kind(&self) -> PartKind { self.section.kind }

    pub fn data(&self) -> &[u8] { &self.section.data }
}

/// One framed record.  Owned by whoever pulled it from the scanner.
#[derive(Debug, Clone)]
pub struct Record {
    /// Bytes between the previous scan position and this record's magic,
    /// keeping at most the last `max_header_len` of them.
    pub header:          Vec<u8>,
    /// Offset of the magic.
    pub start:           u64,
    /// One past the last byte of the trailer.
    pub end:             u64,
    pub parts:           Vec<RecordPart>,
    /// The length came from the format's repair strategy, not the field.
    pub length_repaired: bool,
}

impl Record {
    pub fn len(&self) -> u64 { self.end - self.start }

    pub fn is_empty(&self) -> bool { self.end == self.start }

    /// First part of the given kind.
    pub fn part(&self, kind: PartKind) -> Option<&RecordPart> {
        self.parts.iter().find(|p| p.kind() == kind)
    }

    pub fn parts_of(&self, kind: PartKind) -> impl Iterator<Item = &RecordPart> {
        self.parts.iter().filter(move |p| p.kind() == kind)
    }
}
