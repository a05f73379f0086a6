//! Reference transfer drivers.
//!
//! The planner never touches storage; these helpers are the minimal drivers
//! that pull chunks and perform the seek + contiguous transfer.  Each returns
//! (or consumes) the destination as raw bytes in section order; the caller
//! reinterprets them with its own element type and byte order.

use std::io::{Read, Seek, SeekFrom, Write};

use super::{BufferLayout, Chunk, ChunkIter, ChunkSource, LayoutError, SegmentSource};

fn dest_range(chunk: &Chunk) -> std::ops::Range<usize> {
    let start = chunk.dest_byte() as usize;
    start..start + chunk.n_bytes()
}

fn file_pos(chunk: &Chunk) -> Result<u64, LayoutError> {
    match chunk.source {
        ChunkSource::File { pos } => Ok(pos),
        ChunkSource::Buffer { .. } => Err(LayoutError::SourceMismatch),
    }
}

/// Read the planned section from a seekable stream.
pub fn read_section<R: Read + Seek>(reader: &mut R, chunks: ChunkIter) -> Result<Vec<u8>, LayoutError> {
    let mut dest = vec![0u8; chunks.total_elems() as usize * chunks.elem_size()];
    for chunk in chunks {
        reader.seek(SeekFrom::Start(file_pos(&chunk)?))?;
        reader.read_exact(&mut dest[dest_range(&chunk)])?;
    }
    Ok(dest)
}

/// Write `src` (the section, row-major) into its place in a seekable stream.
pub fn write_section<W: Write + Seek>(
    writer: &mut W,
    chunks: ChunkIter,
    src:    &[u8],
) -> Result<(), LayoutError> {
    let expected = chunks.total_elems() as usize * chunks.elem_size();
    if src.len() != expected {
        return Err(LayoutError::InvalidSection(format!(
            "source holds {} bytes, section needs {expected}",
            src.len()
        )));
    }
    for chunk in chunks {
        writer.seek(SeekFrom::Start(file_pos(&chunk)?))?;
        writer.write_all(&src[dest_range(&chunk)])?;
    }
    Ok(())
}

/// Gather the planned section out of an in-memory storage image.
/// Chunk positions are byte offsets into `storage`.
pub fn copy_section(storage: &[u8], chunks: ChunkIter) -> Result<Vec<u8>, LayoutError> {
    let mut dest = vec![0u8; chunks.total_elems() as usize * chunks.elem_size()];
    for chunk in chunks {
        let pos = file_pos(&chunk)? as usize;
        let src = storage.get(pos..pos + chunk.n_bytes()).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("chunk at byte {pos} runs past storage of {} bytes", storage.len()),
            )
        })?;
        dest[dest_range(&chunk)].copy_from_slice(src);
    }
    Ok(dest)
}

/// Drive a buffer-backed layout to completion.
pub fn assemble<S: SegmentSource>(layout: BufferLayout<S>) -> Result<Vec<u8>, LayoutError> {
    let mut dest = vec![0u8; layout.total_elems() as usize * layout.elem_size()];
    for chunk in layout {
        let chunk = chunk?;
        let view  = chunk.view().ok_or(LayoutError::SourceMismatch)?;
        dest[dest_range(&chunk)].copy_from_slice(view.bytes());
    }
    Ok(dest)
}
