//! Big-endian bit cursor over a cell-style bit string.

use super::cell::Cell;
use super::{DecodeError, EncodeError};

pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    len: usize,
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            len: data.len() * 8,
            pos: 0,
        }
    }

    pub fn for_cell(cell: &'a Cell) -> Self {
        Self {
            data: cell.data(),
            len: cell.bits(),
            pos: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub fn read_bit(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_uint(1)? == 1)
    }

    /// Reads `bits` (at most 128) as an unsigned big-endian integer.
    pub fn read_uint(&mut self, bits: usize) -> Result<u128, DecodeError> {
        debug_assert!(bits <= 128);
        let remaining = self.remaining();
        if bits > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: bits,
                remaining,
            });
        }
        let mut value: u128 = 0;
        for _ in 0..bits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u128;
            self.pos += 1;
        }
        Ok(value)
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let remaining = self.remaining();
        if N * 8 > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: N * 8,
                remaining,
            });
        }
        let mut out = [0u8; N];
        for byte in out.iter_mut() {
            *byte = self.read_uint(8)? as u8;
        }
        Ok(out)
    }

    /// Only zero padding up to the next byte boundary may follow the last field.
    pub fn finish(mut self) -> Result<(), DecodeError> {
        let remaining = self.remaining();
        if remaining >= 8 || self.read_uint(remaining)? != 0 {
            return Err(DecodeError::TrailingData(remaining));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct BitWriter {
    data: Vec<u8>,
    len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bit(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            self.data[self.len / 8] |= 0x80 >> (self.len % 8);
        }
        self.len += 1;
    }

    pub fn write_uint(&mut self, value: u128, bits: usize) {
        debug_assert!(bits <= 128);
        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_uint(b as u128, 8);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn into_cell(self, refs: Vec<Cell>) -> Result<Cell, EncodeError> {
        Cell::new(self.data, self.len, refs)
    }
}
