use byteorder::{ByteOrder, LittleEndian};
use gridframe::codec::{get_filter, FilterError, FilterId};
use gridframe::layout::{assemble, BufferLayout, Chunk, LayoutError, Range, Section, Shape};
use gridframe::tile::{TileError, TileHeader, TileReader, TILE_HEADER_SIZE};
use std::io::{Cursor, Write};

const PREFIX: u64 = 10;

fn f32_storage(n: usize) -> Vec<u8> {
    let values: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
    let mut out = vec![0u8; n * 4];
    LittleEndian::write_f32_into(&values, &mut out);
    out
}

fn encode(filter: FilterId, raw: &[u8]) -> Vec<u8> {
    match filter {
        FilterId::None => raw.to_vec(),
        FilterId::Zstd => zstd::encode_all(raw, 3).unwrap(),
        FilterId::Lz4  => lz4_flex::compress(raw),
        FilterId::Brotli => {
            let mut out = Vec::new();
            {
                let mut w = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                w.write_all(raw).unwrap();
            }
            out
        }
        FilterId::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_compress(&mut Cursor::new(raw), &mut out).unwrap();
            out
        }
    }
}

fn push_tile(out: &mut Vec<u8>, first_elem: u64, raw: &[u8], filter: FilterId) {
    let payload = encode(filter, raw);
    let n_elems = (raw.len() / 4) as u32;
    TileHeader::for_payload(first_elem, n_elems, filter, raw.len() as u32, &payload)
        .write(&mut *out)
        .unwrap();
    out.extend_from_slice(&payload);
}

/// 40 f32 elements in three tiles: [0,16) zstd, [16,32) lz4, [32,40) raw.
fn tiled(storage: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; PREFIX as usize];
    push_tile(&mut out, 0, &storage[..64], FilterId::Zstd);
    push_tile(&mut out, 16, &storage[64..128], FilterId::Lz4);
    push_tile(&mut out, 32, &storage[128..], FilterId::None);
    out
}

#[test]
fn header_roundtrips_through_its_fixed_layout() {
    let header = TileHeader::for_payload(1234, 56, FilterId::Brotli, 224, b"payload");
    let mut buf = Vec::new();
    header.write(&mut buf).unwrap();
    assert_eq!(buf.len(), TILE_HEADER_SIZE);
    assert_eq!(&buf[..4], b"TILE");
    assert_eq!(TileHeader::read(Cursor::new(&buf)).unwrap(), header);
}

#[test]
fn full_section_assembles_across_filters() {
    let storage = f32_storage(40);
    let shape   = Shape::new(vec![5, 8]);
    let reader  = TileReader::new(Cursor::new(tiled(&storage)), 4, PREFIX);
    let layout  = BufferLayout::new(&shape, 4, &Section::full(&shape), reader).unwrap();
    assert_eq!(assemble(layout).unwrap(), storage);
}

#[test]
fn leading_tiles_are_skipped_for_late_rows() {
    let storage = f32_storage(40);
    let shape   = Shape::new(vec![5, 8]);
    let section = Section::new(vec![Range::contiguous(3, 2), Range::new(0, 2, 4)]);
    let reader  = TileReader::new(Cursor::new(tiled(&storage)), 4, PREFIX);
    let layout  = BufferLayout::new(&shape, 4, &section, reader).unwrap();

    let chunks: Vec<Chunk> = layout.map(Result::unwrap).collect();
    assert_eq!(chunks.len(), 8);
    let mut values = Vec::new();
    for c in &chunks {
        let mut v = [0f32; 1];
        c.view().unwrap().read_f32_into::<LittleEndian>(&mut v);
        values.push(v[0]);
    }
    let expected: Vec<f32> = [24, 26, 28, 30, 32, 34, 36, 38].iter().map(|&i| i as f32 * 0.5).collect();
    assert_eq!(values, expected);
}

#[test]
fn corrupt_payload_fails_its_checksum() {
    let storage = f32_storage(40);
    let mut file = tiled(&storage);
    // Last byte of the lz4 tile's payload.
    let zstd_len = encode(FilterId::Zstd, &storage[..64]).len();
    let lz4_len  = encode(FilterId::Lz4, &storage[64..128]).len();
    let at = PREFIX as usize + 2 * TILE_HEADER_SIZE + zstd_len + lz4_len - 1;
    file[at] ^= 0xFF;

    let shape  = Shape::new(vec![40]);
    let reader = TileReader::new(Cursor::new(file), 4, PREFIX);
    let err = assemble(BufferLayout::new(&shape, 4, &Section::full(&shape), reader).unwrap()).unwrap_err();
    assert!(
        matches!(err, LayoutError::Tile(TileError::ChecksumMismatch { first_elem: 16 })),
        "{err}"
    );
}

#[test]
fn gap_between_tiles_is_a_missing_segment() {
    let storage = f32_storage(40);
    let mut file = vec![0u8; PREFIX as usize];
    push_tile(&mut file, 0, &storage[..64], FilterId::Zstd);
    push_tile(&mut file, 32, &storage[128..], FilterId::None);

    let shape   = Shape::new(vec![40]);
    let section = Section::new(vec![Range::contiguous(20, 4)]);
    let reader  = TileReader::new(Cursor::new(file), 4, PREFIX);
    let err = assemble(BufferLayout::new(&shape, 4, &section, reader).unwrap()).unwrap_err();
    assert!(matches!(err, LayoutError::MissingSegment { elem: 20 }), "{err}");
}

#[test]
fn wrong_offset_reports_bad_magic() {
    let storage = f32_storage(40);
    let shape   = Shape::new(vec![40]);
    let reader  = TileReader::new(Cursor::new(tiled(&storage)), 4, 0);
    let err = assemble(BufferLayout::new(&shape, 4, &Section::full(&shape), reader).unwrap()).unwrap_err();
    assert!(matches!(err, LayoutError::Tile(TileError::InvalidMagic(0))), "{err}");
}

#[test]
fn tile_size_must_match_element_count() {
    let storage = f32_storage(16);
    let payload = encode(FilterId::None, &storage);
    let mut file = vec![0u8; PREFIX as usize];
    // Claims 20 elements but carries only 16.
    TileHeader::for_payload(0, 20, FilterId::None, 64, &payload).write(&mut file).unwrap();
    file.extend_from_slice(&payload);

    let shape  = Shape::new(vec![20]);
    let reader = TileReader::new(Cursor::new(file), 4, PREFIX);
    let err = assemble(BufferLayout::new(&shape, 4, &Section::full(&shape), reader).unwrap()).unwrap_err();
    assert!(
        matches!(err, LayoutError::Tile(TileError::SizeMismatch { first_elem: 0, expected: 80, actual: 64 })),
        "{err}"
    );
}

#[test]
fn every_filter_decodes_its_own_encoding() {
    let raw = f32_storage(256);
    for id in [FilterId::None, FilterId::Zstd, FilterId::Lz4, FilterId::Brotli, FilterId::Lzma] {
        let decoded = get_filter(id).decode(&encode(id, &raw), raw.len()).unwrap();
        assert_eq!(decoded, raw, "{}", id.name());
        assert_eq!(FilterId::from_u8(id as u8), Some(id));
    }
}

#[test]
fn unknown_filter_ids_are_rejected() {
    assert_eq!(FilterId::from_u8(200), None);

    let mut buf = Vec::new();
    TileHeader::for_payload(0, 1, FilterId::None, 4, &[0u8; 4]).write(&mut buf).unwrap();
    buf[16] = 200;
    assert!(matches!(TileHeader::read(Cursor::new(&buf)), Err(TileError::Filter(FilterError::Unknown(200)))));
    assert!(get_filter(FilterId::Zstd).decode(b"not zstd", 8).is_err());
}
