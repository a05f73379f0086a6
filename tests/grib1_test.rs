use gridframe::scan::grib1::{BinaryDataHeader, DATA, GRID, INDICATOR, PRODUCT};
use gridframe::scan::{is_valid_source, Grib1Format, NoRepair, Record, RecordScanner, ScanOptions, ScanStats};
use std::io::Cursor;
use std::sync::Arc;

fn u24(v: usize) -> [u8; 3] {
    let b = (v as u32).to_be_bytes();
    [b[1], b[2], b[3]]
}

fn section(body: &[u8]) -> Vec<u8> {
    let mut out = u24(body.len() + 3).to_vec();
    out.extend_from_slice(body);
    out
}

/// Product definition section: 28 octets, centre at octet 5, flags at 8.
fn pds(center: u8, flags: u8, param: u8) -> Vec<u8> {
    let mut body = vec![3, center, 1, 255, flags, param];
    body.resize(25, 0);
    section(&body)
}

/// Binary data section: 11-octet header followed by `packed`.
fn bds(unused_bits: u8, scale: u16, reference: u32, bits: u8, packed: &[u8]) -> Vec<u8> {
    let mut body = vec![unused_bits & 0x0F];
    body.extend_from_slice(&scale.to_be_bytes());
    body.extend_from_slice(&reference.to_be_bytes());
    body.push(bits);
    body.extend_from_slice(packed);
    section(&body)
}

struct Message {
    center: u8,
    param:  u8,
    grid:   Option<Vec<u8>>,
    data:   Vec<u8>,
}

impl Message {
    fn new(param: u8, grid: Option<&[u8]>) -> Self {
        Self {
            center: 7,
            param,
            grid: grid.map(section),
            data: bds(4, 0x8003, 0x4110_0000, 12, &[0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x40]),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let flags = if self.grid.is_some() { 0x80 } else { 0 };
        let mut body = pds(self.center, flags, self.param);
        if let Some(grid) = &self.grid {
            body.extend_from_slice(grid);
        }
        body.extend_from_slice(&self.data);
        body.extend_from_slice(b"7777");

        let mut out = b"GRIB".to_vec();
        out.extend_from_slice(&u24(body.len() + 8));
        out.push(1);
        out.extend_from_slice(&body);
        out
    }
}

fn set_length_field(message: &mut [u8], field: u32) {
    message[4..7].copy_from_slice(&u24(field as usize));
}

fn scan(bytes: Vec<u8>, format: Grib1Format, options: ScanOptions) -> (Vec<Record>, ScanStats) {
    let mut scanner = RecordScanner::with_options(Cursor::new(bytes), format, options).unwrap();
    let records: Vec<Record> = scanner.by_ref().map(Result::unwrap).collect();
    (records, scanner.stats().clone())
}

const GRID_A: &[u8] = b"regular 1.5 degree lat-lon grid.";
const GRID_B: &[u8] = b"reduced gaussian N80 grid.......";

#[test]
fn messages_split_into_sections() {
    let message = Message::new(11, Some(GRID_A)).bytes();
    let (records, stats) = scan(message.clone(), Grib1Format::new(), ScanOptions::default());
    assert_eq!(stats.records, 1);

    let r = &records[0];
    assert_eq!(r.len(), message.len() as u64);
    let kinds: Vec<_> = r.parts.iter().map(|p| p.kind()).collect();
    assert_eq!(kinds, vec![INDICATOR, PRODUCT, GRID, DATA]);
    assert_eq!(r.part(PRODUCT).unwrap().offset, 8);
    assert_eq!(r.part(GRID).unwrap().offset, 36);
    assert_eq!(&r.part(GRID).unwrap().data()[3..], GRID_A);
    assert_eq!(r.part(PRODUCT).unwrap().data()[8], 11);
}

#[test]
fn grid_definitions_are_shared_between_messages() {
    let mut bytes = Vec::new();
    for (param, grid) in [(11, GRID_A), (12, GRID_A), (13, GRID_B), (14, GRID_A)] {
        bytes.extend_from_slice(&Message::new(param, Some(grid)).bytes());
    }
    bytes.extend_from_slice(&Message::new(15, None).bytes());

    let mut scanner = RecordScanner::new(Cursor::new(bytes), Grib1Format::new()).unwrap();
    let records: Vec<Record> = scanner.by_ref().map(Result::unwrap).collect();
    assert_eq!(records.len(), 5);

    let grid = |i: usize| Arc::clone(&records[i].part(GRID).unwrap().section);
    assert!(Arc::ptr_eq(&grid(0), &grid(1)));
    assert!(Arc::ptr_eq(&grid(0), &grid(3)));
    assert!(!Arc::ptr_eq(&grid(0), &grid(2)));
    assert!(records[4].part(GRID).is_none());

    // Only grid definitions are interned.
    assert_eq!(scanner.deduper().len(), 2);
    assert!(!Arc::ptr_eq(
        &records[0].part(DATA).unwrap().section,
        &records[1].part(DATA).unwrap().section
    ));
}

#[test]
fn binary_data_header_decodes() {
    let message = Message::new(11, None).bytes();
    let (records, _) = scan(message, Grib1Format::new(), ScanOptions::default());
    let header = BinaryDataHeader::parse(records[0].part(DATA).unwrap().data()).unwrap();
    assert_eq!(header.length, 17);
    assert_eq!(header.flags, 0);
    assert_eq!(header.unused_bits, 4);
    assert_eq!(header.binary_scale, -3);
    assert_eq!(header.reference_bits, 0x4110_0000);
    assert_eq!(header.bits_per_value, 12);
    assert_eq!(header.value_count(), Some(3));
}

#[test]
fn other_editions_are_passed_over() {
    let mut edition2 = Message::new(1, None).bytes();
    edition2[7] = 2;
    let mut bytes = edition2.clone();
    bytes.extend_from_slice(&Message::new(2, None).bytes());

    let (records, stats) = scan(bytes, Grib1Format::new(), ScanOptions::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].part(PRODUCT).unwrap().data()[8], 2);
    assert_eq!(stats.foreign_magics, 1);
    assert_eq!(stats.dropped(), 0);
    // A passed-over message is not a fault, so it stays in the header.
    assert_eq!(records[0].header, edition2);
}

#[test]
fn message_right_after_a_foreign_indicator_is_found() {
    // Bare edition-2 indicator: magic, length, edition.
    let mut bytes = b"GRIB".to_vec();
    bytes.extend_from_slice(&u24(200));
    bytes.push(2);
    let message = Message::new(3, None).bytes();
    bytes.extend_from_slice(&message);

    let (records, stats) = scan(bytes, Grib1Format::new(), ScanOptions::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].start, 8);
    assert_eq!(records[0].len(), message.len() as u64);
    assert_eq!(stats.foreign_magics, 1);
}

/// GRIBEX large-message encoding: length field in 120-byte units with the
/// top bit set, BDS length field below 120.
fn large_ecmwf_message(center: u8) -> Vec<u8> {
    // 8 (IS) + 28 (PDS) + 64 (BDS) + 4 = 104 = 1 * 120 + 4 - 20
    let mut data = bds(0, 0, 0, 8, &[0x55; 53]);
    data[..3].copy_from_slice(&u24(20));
    let message = Message { center, param: 1, grid: None, data };
    let mut bytes = message.bytes();
    assert_eq!(bytes.len(), 104);
    set_length_field(&mut bytes, 0x80_0001);
    bytes
}

#[test]
fn ecmwf_large_messages_get_their_length_repaired() {
    let mut bytes = large_ecmwf_message(98);
    bytes.extend_from_slice(&Message::new(5, None).bytes());

    let (records, stats) = scan(bytes, Grib1Format::new(), ScanOptions::default());
    assert_eq!(records.len(), 2);
    assert!(records[0].length_repaired);
    assert_eq!(records[0].len(), 104);
    assert!(!records[1].length_repaired);
    assert_eq!(stats.repaired_lengths, 1);
}

#[test]
fn large_length_from_other_centres_is_not_repaired() {
    let mut bytes = large_ecmwf_message(7);
    bytes.extend_from_slice(&Message::new(5, None).bytes());

    let (records, stats) = scan(bytes, Grib1Format::new(), ScanOptions::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].part(PRODUCT).unwrap().data()[8], 5);
    assert_eq!(stats.truncated_frames, 1);
    assert_eq!(stats.repaired_lengths, 0);
}

#[test]
fn repair_can_be_switched_off() {
    let (records, stats) = scan(large_ecmwf_message(98), Grib1Format::with_repair(NoRepair), ScanOptions::default());
    assert!(records.is_empty());
    assert_eq!(stats.truncated_frames, 1);
}

#[test]
fn inner_length_rescues_a_wrong_length_field() {
    let mut bad = Message::new(1, Some(GRID_A)).bytes();
    let true_len = bad.len();
    set_length_field(&mut bad, (true_len - 9) as u32);
    let mut bytes = bad;
    bytes.extend_from_slice(&Message::new(2, Some(GRID_A)).bytes());

    let (strict, stats) = scan(bytes.clone(), Grib1Format::new(), ScanOptions::default());
    assert_eq!(strict.len(), 1);
    assert_eq!(stats.framing_faults, 1);

    let options = ScanOptions { allow_inner_length: true, ..ScanOptions::default() };
    let (lenient, stats) = scan(bytes, Grib1Format::new(), options);
    assert_eq!(lenient.len(), 2);
    assert_eq!(lenient[0].len(), true_len as u64);
    assert_eq!(stats.dropped(), 0);
}

#[test]
fn sniffing_finds_grib_behind_a_header() {
    let options = ScanOptions::default();
    let mut bytes = vec![b' '; 50];
    bytes.extend_from_slice(&Message::new(1, None).bytes());
    assert!(is_valid_source(&mut Cursor::new(bytes), &Grib1Format::new(), &options));

    let mut edition2 = Message::new(1, None).bytes();
    edition2[7] = 2;
    assert!(!is_valid_source(&mut Cursor::new(edition2), &Grib1Format::new(), &options));
}
