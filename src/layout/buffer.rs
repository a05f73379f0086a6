//! Buffer-backed layouts.
//!
//! When stored data must be decoded before it can be assembled (decompressed
//! tiles, filtered records), the bytes a chunk needs live in a decoded buffer
//! rather than at a file position.  A [`SegmentSource`] hands out those
//! buffers as [`Segment`]s, each covering a run of storage elements, and
//! [`BufferLayout`] re-expresses a planned [`ChunkIter`] against them.
//! Chunks that straddle a segment boundary are split, so every emitted chunk
//! reads from exactly one buffer.  The split preserves ordering: source
//! elements and `dest_elem` both stay non-decreasing.

use std::sync::Arc;

use super::{plan, Chunk, ChunkIter, ChunkSource, LayoutError, Section, Shape};

/// A decoded buffer holding storage elements `first_elem .. first_elem + n_elems`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub first_elem: u64,
    pub n_elems:    u64,
    pub data:       Arc<[u8]>,
}

impl Segment {
    pub fn new(first_elem: u64, n_elems: u64, data: impl Into<Arc<[u8]>>) -> Self {
        Self { first_elem, n_elems, data: data.into() }
    }

    /// One past the last storage element held.
    pub fn end_elem(&self) -> u64 {
        self.first_elem + self.n_elems
    }

    pub fn contains(&self, elem: u64) -> bool {
        elem >= self.first_elem && elem < self.end_elem()
    }
}

/// Supplier of decoded segments, consulted in non-decreasing element order.
pub trait SegmentSource {
    /// Return the segment holding storage element `elem`.
    ///
    /// Sources may discard anything before `elem`; they will not be asked
    /// for it again.  `Ok(None)` means nothing covers `elem`.
    fn segment_for(&mut self, elem: u64) -> Result<Option<Segment>, LayoutError>;
}

/// In-memory, storage-ordered list of segments.
#[derive(Debug, Clone, Default)]
pub struct SegmentList {
    segments: Vec<Segment>,
    next:     usize,
}

impl SegmentList {
    /// `segments` are sorted by `first_elem` before use.
    pub fn new(mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| s.first_elem);
        Self { segments, next: 0 }
    }
}

impl SegmentSource for SegmentList {
    fn segment_for(&mut self, elem: u64) -> Result<Option<Segment>, LayoutError> {
        while let Some(seg) = self.segments.get(self.next) {
            if seg.end_elem() > elem {
                break;
            }
            self.next += 1;
        }
        Ok(self.segments.get(self.next).filter(|s| s.contains(elem)).cloned())
    }
}

/// Planned chunk sequence whose sources are decoded segment buffers.
///
/// Yields `Result` because pulling a chunk may decode a new segment.  After
/// the first error the iterator is exhausted.
pub struct BufferLayout<S: SegmentSource> {
    plan:      ChunkIter,
    source:    S,
    current:   Option<Segment>,
    /// Remainder of a chunk split at a segment boundary: (elem, n, dest).
    pending:   Option<(u64, usize, u64)>,
    failed:    bool,
}

impl<S: SegmentSource> BufferLayout<S> {
    /// Plan `section` against `shape` and source it from `source`.
    pub fn new(
        shape:     &Shape,
        elem_size: usize,
        section:   &Section,
        source:    S,
    ) -> Result<Self, LayoutError> {
        // With data_start = 0 a file position divided by elem_size is the
        // storage element index.
        let plan = plan(shape, elem_size, section, 0)?;
        Ok(Self { plan, source, current: None, pending: None, failed: false })
    }

    pub fn total_elems(&self) -> u64 { self.plan.total_elems() }

    pub fn elem_size(&self) -> usize { self.plan.elem_size() }

    pub fn into_source(self) -> S { self.source }

    fn segment_covering(&mut self, elem: u64) -> Result<Segment, LayoutError> {
        if let Some(seg) = self.current.as_ref().filter(|s| s.contains(elem)) {
            return Ok(seg.clone());
        }
        let seg = match self.source.segment_for(elem)? {
            Some(seg) if seg.contains(elem) => seg,
            _ => return Err(LayoutError::MissingSegment { elem }),
        };
        let expected = seg.n_elems * self.plan.elem_size() as u64;
        if (seg.data.len() as u64) < expected {
            return Err(LayoutError::ShortSegment {
                first_elem: seg.first_elem,
                expected,
                actual: seg.data.len() as u64,
            });
        }
        self.current = Some(seg.clone());
        Ok(seg)
    }
}

impl<S: SegmentSource> Iterator for BufferLayout<S> {
    type Item = Result<Chunk, LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let elem_size = self.plan.elem_size();
        let (elem, n, dest) = match self.pending.take() {
            Some(p) => p,
            None => {
                let c = self.plan.next()?;
                let pos = c.src_pos()?;
                (pos / elem_size as u64, c.n_elems, c.dest_elem)
            }
        };

        let seg = match self.segment_covering(elem) {
            Ok(seg) => seg,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let avail = seg.end_elem() - elem;
        let take  = (n as u64).min(avail) as usize;
        if take < n {
            self.pending = Some((elem + take as u64, n - take, dest + take as u64));
        }

        Some(Ok(Chunk {
            source:    ChunkSource::Buffer { buf: seg.data, elem: (elem - seg.first_elem) as usize },
            n_elems:   take,
            dest_elem: dest,
            elem_size,
        }))
    }
}
