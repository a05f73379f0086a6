//! Subset layout planning: turn a strided sub-array request into the minimal
//! ordered sequence of contiguous transfers.
//!
//! # Model
//!
//! An array is stored row-major (last dimension varies fastest) with a
//! [`Shape`].  A caller asks for a [`Section`], one [`Range`] of
//! `(start, stride, count)` per dimension, and [`plan`] returns a lazy
//! [`ChunkIter`].  Every [`Chunk`] says: move `n_elems` elements from the
//! source position to destination element `dest_elem`, where the destination
//! is the requested section laid out row-major.
//!
//! # Fusion
//!
//! Dimensions are inspected innermost first.  The chunk length starts at 1.
//!
//! | Range on dimension | Effect |
//! |--------------------|--------|
//! | full extent, stride 1 | chunk length ×= extent, keep fusing outward |
//! | first non-full, stride 1 (or count 1) | chunk length ×= count, stop |
//! | first non-full, stride > 1 | stop; the dimension is iterated |
//! | every dimension further out | iterated |
//!
//! The number of chunks is therefore the product of the iterated dimensions'
//! counts, never the number of elements unless nothing fuses.
//!
//! # Ordering
//!
//! Chunks come out in storage order, so `src_pos` is strictly increasing, and
//! `dest_elem` advances by exactly one chunk length each step.  A driver can
//! satisfy the whole request in a single forward pass.

use std::io;
use std::sync::Arc;

use byteorder::ByteOrder;
use thiserror::Error;

pub mod buffer;
pub mod transfer;

pub use buffer::{BufferLayout, Segment, SegmentList, SegmentSource};
pub use transfer::{assemble, copy_section, read_section, write_section};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LayoutError {
    /// Malformed subset request.  Always raised before any chunk is produced.
    #[error("Invalid section: {0}")]
    InvalidSection(String),
    /// A buffer-backed layout needed an element no segment supplies.
    #[error("No segment supplies storage element {elem}")]
    MissingSegment { elem: u64 },
    /// A segment's buffer is shorter than its declared element count.
    #[error("Segment at element {first_elem} holds {actual} bytes, expected {expected}")]
    ShortSegment { first_elem: u64, expected: u64, actual: u64 },
    /// A chunk of the wrong variant was handed to a transfer driver.
    #[error("Chunk source variant does not match the transfer driver")]
    SourceMismatch,
    #[error("Tile error: {0}")]
    Tile(#[from] crate::tile::TileError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Shape ─────────────────────────────────────────────────────────────────────

/// Per-dimension extents, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(extents: impl Into<Vec<usize>>) -> Self {
        Self(extents.into())
    }

    pub fn rank(&self) -> usize { self.0.len() }

    pub fn extents(&self) -> &[usize] { &self.0 }

    /// Total element count.  A rank-0 shape holds one element.
    pub fn size(&self) -> u64 {
        self.0.iter().map(|&e| e as u64).product()
    }

    /// Row-major element strides: `strides()[d]` elements separate two
    /// neighbours along dimension `d`.
    pub fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1u64; self.0.len()];
        for d in (0..self.0.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.0[d + 1] as u64;
        }
        strides
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self { Self(v) }
}

impl From<&[usize]> for Shape {
    fn from(v: &[usize]) -> Self { Self(v.to_vec()) }
}

// ── Range ─────────────────────────────────────────────────────────────────────

/// `count` indices `start, start + stride, …` along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start:  usize,
    pub stride: usize,
    pub count:  usize,
}

impl Range {
    pub fn new(start: usize, stride: usize, count: usize) -> Self {
        Self { start, stride, count }
    }

    /// Every index of a dimension with the given extent.
    pub fn full(extent: usize) -> Self {
        Self { start: 0, stride: 1, count: extent }
    }

    /// `count` adjacent indices beginning at `start`.
    pub fn contiguous(start: usize, count: usize) -> Self {
        Self { start, stride: 1, count }
    }

    /// Last selected index, or `None` for an empty range.
    pub fn last(&self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        Some(self.start + (self.count - 1) * self.stride)
    }

    /// Selected indices are adjacent in storage.
    fn is_adjacent(&self) -> bool {
        self.stride == 1 || self.count <= 1
    }

    fn covers(&self, extent: usize) -> bool {
        self.start == 0 && self.count == extent && self.is_adjacent()
    }
}

// ── Section ───────────────────────────────────────────────────────────────────

/// A subset request: one [`Range`] per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Section(Vec<Range>);

impl Section {
    pub fn new(ranges: impl Into<Vec<Range>>) -> Self {
        Self(ranges.into())
    }

    /// The whole of `shape`.
    pub fn full(shape: &Shape) -> Self {
        Self(shape.extents().iter().map(|&e| Range::full(e)).collect())
    }

    pub fn ranges(&self) -> &[Range] { &self.0 }

    pub fn rank(&self) -> usize { self.0.len() }

    /// Number of selected elements (product of the range counts).
    pub fn size(&self) -> u64 {
        self.0.iter().map(|r| r.count as u64).product()
    }

    /// Shape of the destination array.
    pub fn result_shape(&self) -> Shape {
        Shape(self.0.iter().map(|r| r.count).collect())
    }

    /// Check arity, strides and bounds against `shape`.
    pub fn validate(&self, shape: &Shape) -> Result<(), LayoutError> {
        if self.rank() != shape.rank() {
            return Err(LayoutError::InvalidSection(format!(
                "section rank {} does not match shape rank {}",
                self.rank(),
                shape.rank(),
            )));
        }
        for (d, (r, &extent)) in self.0.iter().zip(shape.extents()).enumerate() {
            if r.stride == 0 {
                return Err(LayoutError::InvalidSection(format!(
                    "dimension {d}: stride must be at least 1"
                )));
            }
            let in_bounds = match r.last() {
                Some(last) => last < extent,
                None       => r.start <= extent,
            };
            if !in_bounds {
                return Err(LayoutError::InvalidSection(format!(
                    "dimension {d}: range start={} stride={} count={} exceeds extent {extent}",
                    r.start, r.stride, r.count,
                )));
            }
        }
        Ok(())
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// Where a chunk's source elements live.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkSource {
    /// Absolute byte position in the storage stream.
    File { pos: u64 },
    /// Element offset into a decoded buffer.
    Buffer { buf: Arc<[u8]>, elem: usize },
}

/// A run of elements contiguous in both source and destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub source:    ChunkSource,
    /// Elements (not bytes) to transfer.
    pub n_elems:   usize,
    /// First destination element, as a row-major index into the section.
    pub dest_elem: u64,
    pub elem_size: usize,
}

impl Chunk {
    /// Byte position in storage for file-backed chunks.
    pub fn src_pos(&self) -> Option<u64> {
        match self.source {
            ChunkSource::File { pos } => Some(pos),
            ChunkSource::Buffer { .. } => None,
        }
    }

    /// Element offset into the segment buffer for buffer-backed chunks.
    pub fn src_elem(&self) -> Option<usize> {
        match self.source {
            ChunkSource::File { .. } => None,
            ChunkSource::Buffer { elem, .. } => Some(elem),
        }
    }

    pub fn n_bytes(&self) -> usize {
        self.n_elems * self.elem_size
    }

    /// Byte offset of the chunk within the destination buffer.
    pub fn dest_byte(&self) -> u64 {
        self.dest_elem * self.elem_size as u64
    }

    /// Typed view of a buffer-backed chunk.  `None` for file chunks or when
    /// the buffer is too short.
    pub fn view(&self) -> Option<ChunkView<'_>> {
        match &self.source {
            ChunkSource::File { .. } => None,
            ChunkSource::Buffer { buf, elem } => {
                let start = elem * self.elem_size;
                let bytes = buf.get(start..start + self.n_bytes())?;
                Some(ChunkView { bytes, elem_size: self.elem_size })
            }
        }
    }
}

/// Element-typed window over the bytes of one buffer-backed chunk.
///
/// The `read_*_into` methods decode exactly `len()` elements and panic if
/// `dst` has a different length or the element size does not match the type.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView<'a> {
    bytes:     &'a [u8],
    elem_size: usize,
}

impl<'a> ChunkView<'a> {
    pub fn bytes(&self) -> &'a [u8] { self.bytes }

    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        if self.elem_size == 0 { 0 } else { self.bytes.len() / self.elem_size }
    }

    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    fn expect_width(&self, width: usize) {
        assert_eq!(self.elem_size, width, "chunk element size {} read as {width}-byte values", self.elem_size);
    }

    pub fn read_i16_into<B: ByteOrder>(&self, dst: &mut [i16]) {
        self.expect_width(2);
        B::read_i16_into(self.bytes, dst);
    }

    pub fn read_u16_into<B: ByteOrder>(&self, dst: &mut [u16]) {
        self.expect_width(2);
        B::read_u16_into(self.bytes, dst);
    }

    pub fn read_i32_into<B: ByteOrder>(&self, dst: &mut [i32]) {
        self.expect_width(4);
        B::read_i32_into(self.bytes, dst);
    }

    pub fn read_u32_into<B: ByteOrder>(&self, dst: &mut [u32]) {
        self.expect_width(4);
        B::read_u32_into(self.bytes, dst);
    }

    pub fn read_i64_into<B: ByteOrder>(&self, dst: &mut [i64]) {
        self.expect_width(8);
        B::read_i64_into(self.bytes, dst);
    }

    pub fn read_f32_into<B: ByteOrder>(&self, dst: &mut [f32]) {
        self.expect_width(4);
        B::read_f32_into(self.bytes, dst);
    }

    pub fn read_f64_into<B: ByteOrder>(&self, dst: &mut [f64]) {
        self.expect_width(8);
        B::read_f64_into(self.bytes, dst);
    }
}

// ── Planner ───────────────────────────────────────────────────────────────────

/// One iterated dimension.
#[derive(Debug, Clone, Copy)]
struct Axis {
    count: usize,
    /// Storage elements between successive selected indices.
    step:  u64,
}

/// Validate `section` against `shape` and plan its transfer.
///
/// `data_start` is the byte position of element 0 in the storage stream;
/// every chunk's `src_pos` is `data_start + storage_elem * elem_size`.
pub fn plan(
    shape:      &Shape,
    elem_size:  usize,
    section:    &Section,
    data_start: u64,
) -> Result<ChunkIter, LayoutError> {
    if elem_size == 0 {
        return Err(LayoutError::InvalidSection("element size must be at least 1".into()));
    }
    section.validate(shape)?;

    let extents = shape.extents();
    let ranges  = section.ranges();
    let strides = shape.strides();

    // Fuse full dimensions from the inside out.
    let mut run: u64 = 1;
    let mut d = shape.rank();
    while d > 0 && ranges[d - 1].covers(extents[d - 1]) {
        run *= extents[d - 1] as u64;
        d -= 1;
    }
    // The first partial dimension still fuses when its indices are adjacent.
    let mut iterated = d;
    if d > 0 && ranges[d - 1].is_adjacent() {
        run *= ranges[d - 1].count as u64;
        iterated = d - 1;
    }

    let axes: Vec<Axis> = (0..iterated)
        .map(|i| Axis { count: ranges[i].count, step: (ranges[i].stride as u64) * strides[i] })
        .collect();

    let base_elem: u64 = ranges.iter().zip(&strides).map(|(r, s)| r.start as u64 * s).sum();

    let total_elems = section.size();
    let n_chunks = if total_elems == 0 {
        0
    } else {
        axes.iter().map(|a| a.count as u64).product()
    };

    tracing::debug!(
        rank = shape.rank(),
        iterated,
        total_elems,
        chunk_elems = run,
        chunks = n_chunks,
        "planned section layout"
    );

    Ok(ChunkIter {
        elem_size,
        data_start,
        total_elems,
        run: run as usize,
        counter: vec![0; axes.len()],
        axes,
        base_elem,
        emitted: 0,
        n_chunks,
    })
}

// ── ChunkIter ─────────────────────────────────────────────────────────────────

/// Lazy, forward-only sequence of file-backed [`Chunk`]s.
#[derive(Debug, Clone)]
pub struct ChunkIter {
    elem_size:   usize,
    data_start:  u64,
    total_elems: u64,
    run:         usize,
    axes:        Vec<Axis>,
    counter:     Vec<usize>,
    base_elem:   u64,
    emitted:     u64,
    n_chunks:    u64,
}

impl ChunkIter {
    /// Elements in the requested section.
    pub fn total_elems(&self) -> u64 { self.total_elems }

    pub fn elem_size(&self) -> usize { self.elem_size }

    /// Elements per chunk.  Every chunk of one plan has the same length.
    pub fn chunk_elems(&self) -> usize { self.run }

    /// Chunks in the whole plan, including those already emitted.
    pub fn chunk_count(&self) -> u64 { self.n_chunks }

    pub fn has_next(&self) -> bool { self.emitted < self.n_chunks }

    fn current_elem(&self) -> u64 {
        self.base_elem
            + self.axes.iter().zip(&self.counter).map(|(a, &i)| a.step * i as u64).sum::<u64>()
    }

    /// Odometer step, innermost iterated axis first.
    fn advance(&mut self) {
        for k in (0..self.axes.len()).rev() {
            self.counter[k] += 1;
            if self.counter[k] < self.axes[k].count {
                return;
            }
            self.counter[k] = 0;
        }
    }
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if !self.has_next() {
            return None;
        }
        let elem  = self.current_elem();
        let chunk = Chunk {
            source:    ChunkSource::File { pos: self.data_start + elem * self.elem_size as u64 },
            n_elems:   self.run,
            dest_elem: self.emitted * self.run as u64,
            elem_size: self.elem_size,
        };
        tracing::trace!(src_elem = elem, dest_elem = chunk.dest_elem, n = chunk.n_elems, "chunk");
        self.emitted += 1;
        self.advance();
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.n_chunks - self.emitted) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIter {}

impl std::iter::FusedIterator for ChunkIter {}
