//! Bag-of-cells reader and writer for ordinary (level 0) cells.
//!
//! The writer emits no index and no checksum, one root, and cells in
//! pre-order so every reference points forward.

use crate::codec::Cell;
use crate::{Error, Result};

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

pub fn is_boc(bytes: &[u8]) -> bool {
    bytes.starts_with(&BOC_MAGIC)
}

struct Bytes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Bytes<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::Chain("truncated bag of cells".into()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn uint(&mut self, n: usize) -> Result<usize> {
        Ok(self
            .take(n)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

struct RawCell<'a> {
    data: &'a [u8],
    bits: usize,
    refs: Vec<usize>,
}

/// Parses a bag of cells and returns its first root with every reference
/// resolved.
pub fn parse(boc: &[u8]) -> Result<Cell> {
    let mut r = Bytes { data: boc, pos: 0 };
    if r.take(4)? != BOC_MAGIC {
        return Err(Error::Chain("not a bag of cells".into()));
    }
    let flags = r.byte()?;
    let has_index = flags & 0x80 != 0;
    let ref_size = (flags & 0x07) as usize;
    let offset_size = r.byte()? as usize;
    if ref_size == 0 || ref_size > 4 || offset_size == 0 || offset_size > 8 {
        return Err(Error::Chain(format!("bad bag of cells header {:#04x}", flags)));
    }
    let cells = r.uint(ref_size)?;
    let roots = r.uint(ref_size)?;
    let _absent = r.uint(ref_size)?;
    let _total_size = r.uint(offset_size)?;
    if roots == 0 {
        return Err(Error::Chain("bag of cells has no root".into()));
    }
    let root = r.uint(ref_size)?;
    r.take((roots - 1) * ref_size)?;
    if root >= cells {
        return Err(Error::Chain(format!("root index {} out of range", root)));
    }
    if has_index {
        r.take(cells * offset_size)?;
    }

    let mut raw = Vec::with_capacity(cells.min(boc.len()));
    for index in 0..cells {
        let d1 = r.byte()?;
        let d2 = r.byte()?;
        if d1 & 0x08 != 0 {
            return Err(Error::Chain(format!("cell {} is exotic", index)));
        }
        let ref_count = (d1 & 0x07) as usize;
        if d1 & 0x10 != 0 {
            let levels = ((d1 >> 5) as u32).count_ones() as usize + 1;
            r.take(levels * (32 + 2))?;
        }
        let data = r.take((d2 as usize + 1) / 2)?;
        let bits = data_bits(data, d2 % 2 == 1)?;
        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let target = r.uint(ref_size)?;
            if target <= index || target >= cells {
                return Err(Error::Chain(format!(
                    "cell {} references cell {} out of order",
                    index, target
                )));
            }
            refs.push(target);
        }
        raw.push(RawCell { data, bits, refs });
    }

    // References point forward, so building from the back sees every child first.
    let mut built: Vec<Option<Cell>> = vec![None; cells];
    for index in (0..cells).rev() {
        let cell = &raw[index];
        let refs = cell
            .refs
            .iter()
            .map(|&i| {
                built[i]
                    .clone()
                    .ok_or_else(|| Error::Chain(format!("cell {} missing", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        let cell = Cell::new(cell.data.to_vec(), cell.bits, refs)
            .map_err(|e| Error::Chain(format!("cell {}: {}", index, e)))?;
        built[index] = Some(cell);
    }
    built[root]
        .take()
        .ok_or_else(|| Error::Chain("root cell missing".into()))
}

/// Returns the root cell's data, zero padded to whole bytes.
pub fn root_cell_data(boc: &[u8]) -> Result<Vec<u8>> {
    Ok(parse(boc)?.into_data())
}

/// A partial last byte ends in a `1` tag bit followed by zeros.
fn data_bits(data: &[u8], partial: bool) -> Result<usize> {
    if !partial {
        return Ok(data.len() * 8);
    }
    match data.last() {
        Some(&last) if last != 0 => Ok(data.len() * 8 - 1 - last.trailing_zeros() as usize),
        _ => Err(Error::Chain("partial cell without completion tag".into())),
    }
}

fn byte_width(n: usize) -> usize {
    let mut width = 1;
    while width < 8 && n >> (8 * width) != 0 {
        width += 1;
    }
    width
}

fn push_uint(out: &mut Vec<u8>, value: usize, width: usize) {
    for i in (0..width).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}

/// Serializes the tree under `root` as a single-root bag of cells.
pub fn serialize(root: &Cell) -> Vec<u8> {
    let order = root.descendants();
    let ref_size = byte_width(order.len());

    // Pre-order numbering: a cell's first reference is the next cell, each
    // later one follows the previous reference's whole subtree.
    let mut sizes = vec![0usize; order.len()];
    for (index, cell) in order.iter().enumerate().rev() {
        sizes[index] = 1;
        let mut child = index + 1;
        for _ in cell.refs() {
            sizes[index] += sizes[child];
            child += sizes[child];
        }
    }

    let mut body = Vec::new();
    for (index, cell) in order.iter().enumerate() {
        let full = cell.bits() / 8;
        let partial = cell.bits() % 8 != 0;
        body.push(cell.refs().len() as u8);
        body.push((full * 2 + partial as usize) as u8);
        let mut data = cell.data()[..full + partial as usize].to_vec();
        if partial {
            if let Some(last) = data.last_mut() {
                *last |= 0x80 >> (cell.bits() % 8);
            }
        }
        body.extend(data);
        let mut child = index + 1;
        for _ in cell.refs() {
            push_uint(&mut body, child, ref_size);
            child += sizes[child];
        }
    }

    let offset_size = byte_width(body.len());
    let mut out = BOC_MAGIC.to_vec();
    out.push(ref_size as u8);
    out.push(offset_size as u8);
    push_uint(&mut out, order.len(), ref_size);
    push_uint(&mut out, 1, ref_size);
    push_uint(&mut out, 0, ref_size);
    push_uint(&mut out, body.len(), offset_size);
    push_uint(&mut out, 0, ref_size);
    out.extend(body);
    out
}
