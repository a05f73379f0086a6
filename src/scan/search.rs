//! Forward search for a magic byte sequence in a seekable stream.

use std::io::{self, Read, Seek, SeekFrom};

/// Default read size for the search.
pub const DEFAULT_SEARCH_BLOCK: usize = 64 * 1024;

/// Find the first occurrence of `pattern` at or after `from`.
///
/// With `window = Some(w)` the whole match must lie within `from .. from + w`;
/// otherwise the search runs to end of stream.  The stream position after
/// return is unspecified.
pub fn search_forward<R: Read + Seek + ?Sized>(
    stream:  &mut R,
    from:    u64,
    pattern: &[u8],
    window:  Option<u64>,
    block:   usize,
) -> io::Result<Option<u64>> {
    if pattern.is_empty() {
        return Ok(Some(from));
    }
    stream.seek(SeekFrom::Start(from))?;

    let limit = window.map(|w| from.saturating_add(w));
    let keep  = pattern.len() - 1;
    let mut buf = vec![0u8; block.max(pattern.len()) + keep];
    // buf[..carry] holds the tail of the previous read; buf[0] is at `base`.
    let mut carry = 0usize;
    let mut base  = from;

    loop {
        let n = match stream.read(&mut buf[carry..]) {
            Ok(0)  => return Ok(None),
            Ok(n)  => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let filled = carry + n;

        if let Some(i) = buf[..filled].windows(pattern.len()).position(|w| w == pattern) {
            let pos = base + i as u64;
            return Ok(match limit {
                Some(l) if pos + pattern.len() as u64 > l => None,
                _ => Some(pos),
            });
        }
        if limit.is_some_and(|l| base + filled as u64 >= l) {
            return Ok(None);
        }

        let tail = keep.min(filled);
        buf.copy_within(filled - tail..filled, 0);
        base += (filled - tail) as u64;
        carry = tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_match_split_across_reads() {
        let mut data = vec![0u8; 33];
        data.extend_from_slice(b"GRIB");
        data.extend_from_slice(&[1u8; 10]);
        // Reads end at 11, 19, 27, 35, ...: the match at 33 straddles one.
        let mut cur = Cursor::new(data);
        assert_eq!(search_forward(&mut cur, 0, b"GRIB", None, 8).unwrap(), Some(33));
        assert_eq!(search_forward(&mut cur, 34, b"GRIB", None, 8).unwrap(), None);
    }

    #[test]
    fn window_bounds_the_match() {
        let mut data = vec![0u8; 100];
        data.extend_from_slice(b"GRIB");
        let mut cur = Cursor::new(data);
        assert_eq!(search_forward(&mut cur, 0, b"GRIB", Some(104), 16).unwrap(), Some(100));
        assert_eq!(search_forward(&mut cur, 0, b"GRIB", Some(103), 16).unwrap(), None);
        assert_eq!(search_forward(&mut cur, 0, b"GRIB", Some(50), 16).unwrap(), None);
    }
}
