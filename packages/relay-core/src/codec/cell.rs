//! TON cell: up to 1023 data bits and up to four references.

use super::EncodeError;

pub const MAX_CELL_BITS: usize = 1023;
pub const MAX_CELL_REFS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bits: usize,
    refs: Vec<Cell>,
}

impl Cell {
    /// Bits past `bits` in `data` are cleared.
    pub fn new(mut data: Vec<u8>, bits: usize, refs: Vec<Cell>) -> Result<Self, EncodeError> {
        if bits > MAX_CELL_BITS || refs.len() > MAX_CELL_REFS || bits > data.len() * 8 {
            return Err(EncodeError::CellOverflow {
                bits,
                refs: refs.len(),
            });
        }
        data.truncate((bits + 7) / 8);
        if bits % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last &= 0xffu8 << (8 - bits % 8);
            }
        }
        Ok(Self { data, bits, refs })
    }

    /// A reference-free view of a plain byte string. Not bounded by the
    /// cell size, so it can carry already-extracted message bodies.
    pub(crate) fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            bits: data.len() * 8,
            refs: Vec::new(),
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Data bits, zero padded to whole bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn refs(&self) -> &[Cell] {
        &self.refs
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Pre-order walk: a cell always comes before the cells it references.
    pub fn descendants(&self) -> Vec<&Cell> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(cell) = stack.pop() {
            out.push(cell);
            stack.extend(cell.refs.iter().rev());
        }
        out
    }
}
