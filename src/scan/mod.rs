//! Resynchronizing record scanner.
//!
//! # How it works
//!
//! [`RecordScanner`] pulls self-delimited records out of a seekable stream,
//! one per call, in stream order.  Each call runs a small state machine:
//!
//! | State | Action | Next |
//! |-------|--------|------|
//! | `SeekMagic` | search forward from the cursor for the format's magic | `ValidateLength` / `Eof` |
//! | `ValidateLength` | read the length field, apply the format's [`LengthRepair`] | `ValidateTrailer` / `Resync` |
//! | `ValidateTrailer` | compare the bytes ending at the computed end with the trailer | `Emit` / `Resync` |
//! | `Emit` | read and parse the frame, intern shared parts, advance past it | return record / `Resync` |
//! | `Resync` | count the fault, move the cursor to magic + fixed skip | `SeekMagic` |
//! | `Eof` | no further magic | return `None` |
//!
//! The loop is explicit: however many bad frames a stream holds, the stack
//! stays flat.  Every fault moves the cursor strictly forward, so the loop
//! ends at end of stream at the latest.
//!
//! # Faults
//!
//! A bad length, a missing trailer, a frame running past end of stream and a
//! frame that fails to parse are all recovered the same way: the record is
//! dropped, logged, and the search resumes [`FrameFormat::resync_skip`] bytes
//! after its magic (at least one byte).  The bytes skipped are never
//! revisited, nor handed out as the next record's header.  A magic whose
//! prologue belongs to another format or edition is not a fault: the search
//! resumes right after the prologue bytes the format read.  Only I/O errors
//! from the stream surface, as [`ScanError`].
//!
//! # Leniency
//!
//! [`ScanOptions::allow_inner_length`] accepts a trailer at the end implied by
//! the record's inner structure when the declared end fails, and
//! [`ScanOptions::allow_missing_trailer`] accepts a record without its
//! trailer.  A record whose length was repaired gets both automatically.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::{RecordDeduper, Subsection};

pub mod format;
pub mod grib1;
mod record;
pub mod search;

pub use format::{
    BodyLayout, FrameError, FrameFormat, LengthRepair, NoRepair, PartSpan, Prologue, ReadSeek,
    TaggedFrames, DEFAULT_RESYNC_SKIP,
};
pub use grib1::{EcmwfLargeGrib, Grib1Format};
pub use record::{Record, RecordPart};
use search::{search_forward, DEFAULT_SEARCH_BLOCK};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Only stream I/O failures leave the scanner; framing faults are recovered.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Scanner configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Bytes searched for the first magic by [`is_valid_source`].
    pub sniff_window:          u64,
    /// Cap on inter-record bytes kept as [`Record::header`].
    pub max_header_len:        usize,
    /// Read size of the magic search.
    pub search_block:          usize,
    /// Accept a trailer at the inner-structure end when the declared end fails.
    pub allow_inner_length:    bool,
    /// Accept records whose trailer is missing.
    pub allow_missing_trailer: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            sniff_window:          16_000,
            max_header_len:        100,
            search_block:          DEFAULT_SEARCH_BLOCK,
            allow_inner_length:    false,
            allow_missing_trailer: false,
        }
    }
}

impl ScanOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Stats ─────────────────────────────────────────────────────────────────────

/// Running counters for one scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// Records emitted.
    pub records:          u64,
    /// Frames dropped for a bad length or a missing trailer.
    pub framing_faults:   u64,
    /// Frames dropped because they ran past end of stream.
    pub truncated_frames: u64,
    /// Frames dropped because they did not parse.
    pub parse_faults:     u64,
    /// Lengths replaced by the repair strategy.
    pub repaired_lengths: u64,
    /// Magic matches whose prologue belonged to another format or edition.
    pub foreign_magics:   u64,
}

impl ScanStats {
    /// Frames dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.framing_faults + self.truncated_frames + self.parse_faults
    }

    pub fn summary(&self) -> String {
        format!(
            "{} record(s), {} dropped ({} framing, {} truncated, {} unparseable), {} repaired length(s)",
            self.records,
            self.dropped(),
            self.framing_faults,
            self.truncated_frames,
            self.parse_faults,
            self.repaired_lengths,
        )
    }

    fn note(&mut self, fault: FrameFault) {
        match fault {
            FrameFault::BadLength | FrameFault::MissingTrailer => self.framing_faults += 1,
            FrameFault::Truncated => self.truncated_frames += 1,
            FrameFault::Unparseable => self.parse_faults += 1,
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameFault {
    BadLength,
    Truncated,
    MissingTrailer,
    Unparseable,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    magic_pos: u64,
    end:       u64,
    repaired:  bool,
}

#[derive(Debug)]
enum ScanState {
    SeekMagic,
    ValidateLength { magic_pos: u64 },
    ValidateTrailer(Frame),
    Emit(Frame),
    Resync { magic_pos: u64, fault: FrameFault },
    Eof,
}

/// Map end-of-stream to `None`; anything else is a real I/O failure.
fn eof_as_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Do the bytes ending at `end` match `trailer`?
fn trailer_matches(stream: &mut dyn ReadSeek, end: u64, trailer: &[u8], stream_len: u64) -> io::Result<bool> {
    let len = trailer.len() as u64;
    if end < len || end > stream_len {
        return Ok(false);
    }
    if len == 0 {
        return Ok(true);
    }
    stream.seek(SeekFrom::Start(end - len))?;
    let mut found = vec![0u8; trailer.len()];
    Ok(eof_as_none(stream.read_exact(&mut found))?.is_some() && found == trailer)
}

// ── Scanner ───────────────────────────────────────────────────────────────────

pub struct RecordScanner<R: Read + Seek, F: FrameFormat> {
    stream:     R,
    format:     F,
    options:    ScanOptions,
    stream_len: u64,
    cursor:     u64,
    peeked:     Option<Record>,
    deduper:    RecordDeduper,
    stats:      ScanStats,
}

impl<F: FrameFormat> RecordScanner<BufReader<File>, F> {
    /// Scan the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, format: F, options: ScanOptions) -> Result<Self, ScanError> {
        let file = File::open(path)?;
        Self::with_options(BufReader::new(file), format, options)
    }
}

impl<R: Read + Seek, F: FrameFormat> RecordScanner<R, F> {
    pub fn new(stream: R, format: F) -> Result<Self, ScanError> {
        Self::with_options(stream, format, ScanOptions::default())
    }

    pub fn with_options(mut stream: R, format: F, options: ScanOptions) -> Result<Self, ScanError> {
        let stream_len = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;
        tracing::debug!(format = format.name(), stream_len, "record scanner ready");
        Ok(Self {
            stream,
            format,
            options,
            stream_len,
            cursor: 0,
            peeked: None,
            deduper: RecordDeduper::new(),
            stats: ScanStats::default(),
        })
    }

    /// Is there another record?  Scans ahead (and holds the record found)
    /// when needed.
    pub fn has_next(&mut self) -> Result<bool, ScanError> {
        if self.peeked.is_none() {
            self.peeked = self.scan()?;
        }
        Ok(self.peeked.is_some())
    }

    /// The next record in stream order, or `None` when no further magic
    /// frames a valid record.
    pub fn next_record(&mut self) -> Result<Option<Record>, ScanError> {
        match self.peeked.take() {
            Some(record) => Ok(Some(record)),
            None => self.scan(),
        }
    }

    /// Offset where the next search starts.
    pub fn position(&self) -> u64 { self.cursor }

    pub fn stream_len(&self) -> u64 { self.stream_len }

    pub fn stats(&self) -> &ScanStats { &self.stats }

    pub fn deduper(&self) -> &RecordDeduper { &self.deduper }

    pub fn format(&self) -> &F { &self.format }

    pub fn options(&self) -> &ScanOptions { &self.options }

    pub fn into_inner(self) -> R { self.stream }

    fn scan(&mut self) -> Result<Option<Record>, ScanError> {
        // Header bytes start here; a resync moves it past the dropped frame.
        let mut header_from = self.cursor;
        let mut state = ScanState::SeekMagic;
        loop {
            state = match state {
                ScanState::SeekMagic => {
                    let found = if self.cursor >= self.stream_len {
                        None
                    } else {
                        search_forward(
                            &mut self.stream,
                            self.cursor,
                            self.format.magic(),
                            None,
                            self.options.search_block,
                        )?
                    };
                    match found {
                        Some(magic_pos) => ScanState::ValidateLength { magic_pos },
                        None            => ScanState::Eof,
                    }
                }
                ScanState::ValidateLength { magic_pos } => self.validate_length(magic_pos)?,
                ScanState::ValidateTrailer(frame) => self.validate_trailer(frame)?,
                ScanState::Emit(frame) => match self.emit(frame, header_from)? {
                    Ok(record) => {
                        self.cursor = frame.end;
                        self.stats.records += 1;
                        return Ok(Some(record));
                    }
                    Err(e) => {
                        tracing::warn!(
                            format = self.format.name(),
                            pos = frame.magic_pos,
                            error = %e,
                            "bad record, skipping"
                        );
                        ScanState::Resync { magic_pos: frame.magic_pos, fault: FrameFault::Unparseable }
                    }
                },
                ScanState::Resync { magic_pos, fault } => {
                    self.stats.note(fault);
                    self.cursor = magic_pos + self.format.resync_skip().max(1);
                    header_from = self.cursor;
                    tracing::debug!(pos = magic_pos, ?fault, resume = self.cursor, "resync");
                    ScanState::SeekMagic
                }
                ScanState::Eof => {
                    self.cursor = self.stream_len;
                    return Ok(None);
                }
            };
        }
    }

    fn validate_length(&mut self, magic_pos: u64) -> io::Result<ScanState> {
        let magic_len = self.format.magic().len() as u64;
        let stream: &mut dyn ReadSeek = &mut self.stream;
        stream.seek(SeekFrom::Start(magic_pos + magic_len))?;

        let prologue = match eof_as_none(self.format.read_prologue(stream, magic_pos))? {
            Some(Some(p)) => p,
            Some(None) => {
                self.stats.foreign_magics += 1;
                self.cursor = stream.stream_position()?.max(magic_pos + magic_len.max(1));
                return Ok(ScanState::SeekMagic);
            }
            None => return Ok(ScanState::Resync { magic_pos, fault: FrameFault::Truncated }),
        };

        let repaired = eof_as_none(self.format.length_repair().repair(stream, &prologue))?.flatten();
        if repaired.is_some() {
            self.stats.repaired_lengths += 1;
        }
        let total = repaired.unwrap_or(prologue.declared_len);

        if total < self.format.min_frame_len() {
            return Ok(ScanState::Resync { magic_pos, fault: FrameFault::BadLength });
        }
        let end = magic_pos.saturating_add(total);
        if end > self.stream_len {
            return Ok(ScanState::Resync { magic_pos, fault: FrameFault::Truncated });
        }
        Ok(ScanState::ValidateTrailer(Frame { magic_pos, end, repaired: repaired.is_some() }))
    }

    fn validate_trailer(&mut self, frame: Frame) -> io::Result<ScanState> {
        let trailer = self.format.trailer();
        if trailer_matches(&mut self.stream, frame.end, trailer, self.stream_len)? {
            return Ok(ScanState::Emit(frame));
        }

        if self.options.allow_inner_length || frame.repaired {
            let inner = eof_as_none(self.format.inner_end(&mut self.stream, frame.magic_pos))?.flatten();
            if let Some(end) = inner {
                if end >= frame.magic_pos + self.format.min_frame_len()
                    && trailer_matches(&mut self.stream, end, trailer, self.stream_len)?
                {
                    tracing::debug!(pos = frame.magic_pos, declared_end = frame.end, end, "trailer found at inner end");
                    return Ok(ScanState::Emit(Frame { end, ..frame }));
                }
            }
        }

        if self.options.allow_missing_trailer || frame.repaired {
            return Ok(ScanState::Emit(frame));
        }
        Ok(ScanState::Resync { magic_pos: frame.magic_pos, fault: FrameFault::MissingTrailer })
    }

    /// Read, parse and intern one frame.  The outer `Result` is I/O; the
    /// inner one is the format's verdict on the bytes.
    fn emit(&mut self, frame: Frame, header_from: u64) -> io::Result<Result<Record, FrameError>> {
        let len = (frame.end - frame.magic_pos) as usize;
        self.stream.seek(SeekFrom::Start(frame.magic_pos))?;
        let mut bytes = vec![0u8; len];
        if eof_as_none(self.stream.read_exact(&mut bytes))?.is_none() {
            return Ok(Err(FrameError::Truncated { needed: len, available: 0 }));
        }

        let spans = match self.format.parse(&bytes) {
            Ok(spans) => spans,
            Err(e)    => return Ok(Err(e)),
        };
        if let Some((kind, range)) = spans.iter().find(|(_, r)| r.start > r.end || r.end > len) {
            return Ok(Err(FrameError::Malformed(format!(
                "part of kind {} spans {}..{} outside a {len}-byte frame",
                kind.0, range.start, range.end
            ))));
        }

        let mut parts = Vec::with_capacity(spans.len());
        for (kind, range) in spans {
            let offset  = frame.magic_pos + range.start as u64;
            let section = Subsection::new(kind, bytes[range].to_vec());
            let section = if self.format.is_shared(kind) {
                self.deduper.intern(section)
            } else {
                Arc::new(section)
            };
            parts.push(RecordPart { offset, section });
        }

        let header_len = (frame.magic_pos - header_from).min(self.options.max_header_len as u64);
        let mut header = vec![0u8; header_len as usize];
        self.stream.seek(SeekFrom::Start(frame.magic_pos - header_len))?;
        self.stream.read_exact(&mut header)?;

        Ok(Ok(Record {
            header,
            start: frame.magic_pos,
            end: frame.end,
            parts,
            length_repaired: frame.repaired,
        }))
    }
}

impl<R: Read + Seek, F: FrameFormat> Iterator for RecordScanner<R, F> {
    type Item = Result<Record, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                // Stop after surfacing an I/O failure.
                self.cursor = self.stream_len;
                Some(Err(e))
            }
        }
    }
}

// ── Sniffing ──────────────────────────────────────────────────────────────────

/// Cheap format check: does a valid-looking record start within the first
/// `options.sniff_window` bytes?  I/O failures count as "no".
pub fn is_valid_source<R: Read + Seek, F: FrameFormat>(
    stream:  &mut R,
    format:  &F,
    options: &ScanOptions,
) -> bool {
    match sniff(stream, format, options) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::debug!(format = format.name(), error = %e, "sniff failed");
            false
        }
    }
}

fn sniff<R: Read + Seek, F: FrameFormat>(stream: &mut R, format: &F, options: &ScanOptions) -> io::Result<bool> {
    let stream_len = stream.seek(SeekFrom::End(0))?;
    let found = search_forward(stream, 0, format.magic(), Some(options.sniff_window), options.search_block)?;
    let Some(magic_pos) = found else {
        return Ok(false);
    };

    let stream: &mut dyn ReadSeek = stream;
    stream.seek(SeekFrom::Start(magic_pos + format.magic().len() as u64))?;
    let Some(prologue) = format.read_prologue(stream, magic_pos)? else {
        return Ok(false);
    };
    let repaired = format.length_repair().repair(stream, &prologue)?;
    let total = repaired.unwrap_or(prologue.declared_len);
    let end = magic_pos.saturating_add(total);
    if total < format.min_frame_len() || end > stream_len {
        return Ok(false);
    }
    if repaired.is_some() || options.allow_inner_length || options.allow_missing_trailer {
        return Ok(true);
    }
    trailer_matches(stream, end, format.trailer(), stream_len)
}
