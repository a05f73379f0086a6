//! MSB-first bit-field reader for packed record fields.
//!
//! Signed fields use sign-magnitude encoding (high bit is the sign, the rest
//! the magnitude), which is what the WMO binary formats store.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitError {
    #[error("Bit field of {wanted} bits requested with only {available} bits left")]
    Exhausted { wanted: u32, available: u64 },
    #[error("Bit field width {0} outside 1..=64")]
    Width(u32),
}

pub struct BitReader<'a> {
    data:    &'a [u8],
    bit_pos: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Bits consumed so far.
    pub fn position(&self) -> u64 { self.bit_pos }

    pub fn remaining(&self) -> u64 {
        self.data.len() as u64 * 8 - self.bit_pos
    }

    fn check(&self, n: u32) -> Result<(), BitError> {
        if n == 0 || n > 64 {
            return Err(BitError::Width(n));
        }
        if n as u64 > self.remaining() {
            return Err(BitError::Exhausted { wanted: n, available: self.remaining() });
        }
        Ok(())
    }

    /// Read `n` bits as an unsigned integer.
    pub fn read_uint(&mut self, n: u32) -> Result<u64, BitError> {
        self.check(n)?;
        let mut value = 0u64;
        let mut left  = n;
        while left > 0 {
            let byte   = self.data[(self.bit_pos / 8) as usize];
            let offset = (self.bit_pos % 8) as u32;
            let take   = left.min(8 - offset);
            let bits   = (byte >> (8 - offset - take)) & (0xFFu8 >> (8 - take));
            value = (value << take) | bits as u64;
            left -= take;
            self.bit_pos += take as u64;
        }
        Ok(value)
    }

    /// Read `n` bits as a sign-magnitude integer.
    pub fn read_sint(&mut self, n: u32) -> Result<i64, BitError> {
        let raw  = self.read_uint(n)?;
        let sign = 1u64 << (n - 1);
        let magnitude = (raw & (sign - 1)) as i64;
        Ok(if raw & sign != 0 { -magnitude } else { magnitude })
    }

    pub fn skip(&mut self, n: u64) -> Result<(), BitError> {
        if n > self.remaining() {
            return Err(BitError::Exhausted { wanted: n.min(u32::MAX as u64) as u32, available: self.remaining() });
        }
        self.bit_pos += n;
        Ok(())
    }

    /// Advance to the next byte boundary.
    pub fn align(&mut self) {
        self.bit_pos = self.bit_pos.div_ceil(8) * 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_fields_cross_byte_boundaries() {
        let mut bits = BitReader::new(&[0xFF, 2, 4, 8]);
        assert_eq!(bits.read_uint(7).unwrap(), 127);
        assert_eq!(bits.read_uint(1).unwrap(), 1);

        let mut bits = BitReader::new(&[199, 242, 0, 0, 6, 6]);
        assert_eq!(bits.read_uint(10).unwrap(), 799);
        assert_eq!(bits.read_uint(10).unwrap(), 800);
        assert_eq!(bits.read_uint(10).unwrap(), 0);
        assert_eq!(bits.read_uint(10).unwrap(), 6);
        assert_eq!(bits.read_uint(8).unwrap(), 6);
    }

    #[test]
    fn signed_fields_are_sign_magnitude() {
        assert_eq!(BitReader::new(&[32, 0, 0, 0]).read_sint(4).unwrap(), 2);
        assert_eq!(BitReader::new(&[160, 0, 0, 0]).read_sint(4).unwrap(), -2);

        let mut bits = BitReader::new(&[71, 200, 235, 216, 128, 0]);
        assert_eq!(bits.read_uint(11).unwrap(), 574);
        assert_eq!(bits.read_uint(11).unwrap(), 570);
        assert_eq!(bits.read_sint(11).unwrap(), -945);
    }

    #[test]
    fn running_out_is_an_error() {
        let mut bits = BitReader::new(&[0xAB]);
        bits.read_uint(6).unwrap();
        assert_eq!(bits.read_uint(3), Err(BitError::Exhausted { wanted: 3, available: 2 }));
        assert_eq!(bits.read_uint(0), Err(BitError::Width(0)));
        bits.align();
        assert_eq!(bits.remaining(), 0);
    }
}
