//! gridframe: hyperslab layout planning and resynchronizing record scanning
//! for gridded binary data files.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`layout`] | plan a rectangular sub-selection as contiguous chunks, and move the bytes |
//! | [`tile`]   | compressed, checksummed tiles as a segment source for buffer layouts |
//! | [`codec`]  | decode-only compression filters |
//! | [`scan`]   | find, validate and parse magic-framed records, recovering from corruption |
//! | [`dedup`]  | content-addressed interning of record parts shared across records |
//! | [`bits`]   | MSB-first bit-field reader |

pub mod bits;
pub mod codec;
pub mod dedup;
pub mod layout;
pub mod scan;
pub mod tile;

pub use bits::{BitError, BitReader};
pub use codec::{get_filter, FilterId};
pub use dedup::{DedupKey, PartKind, RecordDeduper, Subsection};
pub use layout::{plan, BufferLayout, Chunk, ChunkIter, LayoutError, Range, Section, Shape};
pub use scan::{
    is_valid_source, FrameFormat, Grib1Format, Record, RecordPart, RecordScanner, ScanError,
    ScanOptions, ScanStats, TaggedFrames,
};
pub use tile::{TileHeader, TileReader};
