//! Minimal cell primitives.
//!
//! Only what the driver reads and writes: unsigned integers, `Grams`
//! (`VarUInteger 16`), `addr_none`, child references and `HashmapE 32`
//! dictionaries. Bag-of-cells serialization belongs to the chain adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::CellError;

pub const MAX_BITS: usize = 1023;
pub const MAX_REFS: usize = 4;

/// A cell: up to 1023 data bits and up to 4 child references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl Cell {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    pub fn bit(&self, index: usize) -> bool {
        (self.data[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn parser(&self) -> CellParser<'_> {
        CellParser {
            cell: self,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    /// Leading 32 bits, if the cell has that many.
    pub fn opcode(&self) -> Option<u32> {
        self.parser().load_u32().ok()
    }
}

/// Sequential reader over a cell's bits and references.
#[derive(Debug, Clone)]
pub struct CellParser<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellParser<'a> {
    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.refs.len() - self.ref_pos
    }

    fn ensure_bits(&self, needed: usize) -> Result<(), CellError> {
        if needed > self.remaining_bits() {
            return Err(CellError::BitUnderflow {
                needed,
                available: self.remaining_bits(),
            });
        }
        Ok(())
    }

    pub fn load_bit(&mut self) -> Result<bool, CellError> {
        self.ensure_bits(1)?;
        let bit = self.cell.bit(self.bit_pos);
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Reads an unsigned big-endian integer of `width` bits (at most 64).
    pub fn load_uint(&mut self, width: usize) -> Result<u64, CellError> {
        if width > 64 {
            return Err(CellError::ValueTooWide {
                bits: width as u64,
                width: 64,
            });
        }
        self.ensure_bits(width)?;
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | u64::from(self.load_bit()?);
        }
        Ok(value)
    }

    pub fn load_u32(&mut self) -> Result<u32, CellError> {
        Ok(self.load_uint(32)? as u32)
    }

    pub fn load_u64(&mut self) -> Result<u64, CellError> {
        self.load_uint(64)
    }

    /// Reads an unsigned integer of any width without losing precision.
    pub fn load_biguint(&mut self, width: usize) -> Result<BigUint, CellError> {
        self.ensure_bits(width)?;
        let mut value = BigUint::zero();
        for _ in 0..width {
            value <<= 1u8;
            if self.load_bit()? {
                value += 1u8;
            }
        }
        Ok(value)
    }

    /// `Grams`/`Coins`: a 4-bit byte length followed by that many bytes.
    pub fn load_coins(&mut self) -> Result<BigUint, CellError> {
        let len = self.load_uint(4)? as usize;
        self.load_biguint(len * 8)
    }

    pub fn load_ref(&mut self) -> Result<&'a Arc<Cell>, CellError> {
        let index = self.ref_pos;
        let cell = self
            .cell
            .refs
            .get(index)
            .ok_or(CellError::RefUnderflow { index })?;
        self.ref_pos += 1;
        Ok(cell)
    }

    /// Everything not read yet, as a new cell.
    pub fn remainder(&self) -> Cell {
        let mut builder = CellBuilder::new();
        for index in self.bit_pos..self.cell.bit_len {
            builder.push_bit(self.cell.bit(index));
        }
        builder.refs = self.cell.refs[self.ref_pos..].to_vec();
        builder.into_cell_unchecked()
    }
}

/// Builds a cell bit by bit.
#[derive(Debug, Clone, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let last = self.data.len() - 1;
            self.data[last] |= 1 << (7 - self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    pub fn store_bit(&mut self, bit: bool) -> &mut Self {
        self.push_bit(bit);
        self
    }

    pub fn store_uint(&mut self, value: u64, width: usize) -> Result<&mut Self, CellError> {
        let bits = u64::from(u64::BITS - value.leading_zeros());
        if width > 64 || bits > width as u64 {
            return Err(CellError::ValueTooWide { bits, width });
        }
        for shift in (0..width).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
        Ok(self)
    }

    pub fn store_u32(&mut self, value: u32) -> &mut Self {
        for shift in (0..32).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
        self
    }

    pub fn store_u64(&mut self, value: u64) -> &mut Self {
        for shift in (0..64).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
        self
    }

    pub fn store_biguint(&mut self, value: &BigUint, width: usize) -> Result<&mut Self, CellError> {
        let bits = value.bits();
        if bits > width as u64 {
            return Err(CellError::ValueTooWide { bits, width });
        }
        for shift in (0..width as u64).rev() {
            self.push_bit(value.bit(shift));
        }
        Ok(self)
    }

    pub fn store_coins(&mut self, value: &BigUint) -> Result<&mut Self, CellError> {
        let len = value.bits().div_ceil(8) as usize;
        if len > 15 {
            return Err(CellError::ValueTooWide {
                bits: value.bits(),
                width: 120,
            });
        }
        self.store_uint(len as u64, 4)?;
        self.store_biguint(value, len * 8)
    }

    /// `addr_none$00`.
    pub fn store_address_none(&mut self) -> &mut Self {
        self.push_bit(false);
        self.push_bit(false);
        self
    }

    pub fn store_ref(&mut self, cell: Cell) -> Result<&mut Self, CellError> {
        self.store_ref_arc(Arc::new(cell))
    }

    pub fn store_ref_arc(&mut self, cell: Arc<Cell>) -> Result<&mut Self, CellError> {
        if self.refs.len() == MAX_REFS {
            return Err(CellError::RefOverflow);
        }
        self.refs.push(cell);
        Ok(self)
    }

    /// Appends the bits and references of `cell`.
    pub fn store_cell(&mut self, cell: &Cell) -> Result<&mut Self, CellError> {
        for index in 0..cell.bit_len {
            self.push_bit(cell.bit(index));
        }
        for child in &cell.refs {
            self.store_ref_arc(Arc::clone(child))?;
        }
        Ok(self)
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn build(&self) -> Result<Cell, CellError> {
        if self.bit_len > MAX_BITS {
            return Err(CellError::BitOverflow { bits: self.bit_len });
        }
        Ok(self.clone().into_cell_unchecked())
    }

    fn into_cell_unchecked(self) -> Cell {
        Cell {
            data: self.data,
            bit_len: self.bit_len,
            refs: self.refs,
        }
    }
}

/// Number of bits needed to encode `0..=max`.
fn len_bits(max: usize) -> usize {
    (usize::BITS - max.leading_zeros()) as usize
}

/// Reads a `HashmapE 32 Any`: a presence bit followed by an optional root ref.
pub fn load_dict_u32(parser: &mut CellParser<'_>) -> Result<BTreeMap<u32, Cell>, CellError> {
    let mut entries = BTreeMap::new();
    if parser.load_bit()? {
        let root = parser.load_ref()?;
        walk_dict(root, 32, 0, &mut entries)?;
    }
    Ok(entries)
}

/// Reads a dictionary whose root cell was handed over directly (as on a
/// get-method stack).
pub fn parse_dict_u32(root: &Cell) -> Result<BTreeMap<u32, Cell>, CellError> {
    let mut entries = BTreeMap::new();
    walk_dict(root, 32, 0, &mut entries)?;
    Ok(entries)
}

fn walk_dict(
    node: &Cell,
    key_len: usize,
    prefix: u64,
    out: &mut BTreeMap<u32, Cell>,
) -> Result<(), CellError> {
    let mut parser = node.parser();
    let (label, label_len) = load_label(&mut parser, key_len)?;
    let key = (prefix << label_len) | label;
    let rest = key_len - label_len;
    if rest == 0 {
        out.insert(key as u32, parser.remainder());
        return Ok(());
    }
    let left = parser.load_ref()?;
    let right = parser.load_ref()?;
    walk_dict(left, rest - 1, key << 1, out)?;
    walk_dict(right, rest - 1, (key << 1) | 1, out)
}

fn load_label(parser: &mut CellParser<'_>, max: usize) -> Result<(u64, usize), CellError> {
    if !parser.load_bit()? {
        // hml_short$0 len:(Unary ~n) s:(n * Bit)
        let mut len = 0;
        while parser.load_bit()? {
            len += 1;
        }
        if len > max {
            return Err(CellError::InvalidLabel("short label longer than key"));
        }
        return Ok((parser.load_uint(len)?, len));
    }
    if !parser.load_bit()? {
        // hml_long$10 n:(#<= m) s:(n * Bit)
        let len = parser.load_uint(len_bits(max))? as usize;
        if len > max {
            return Err(CellError::InvalidLabel("long label longer than key"));
        }
        return Ok((parser.load_uint(len)?, len));
    }
    // hml_same$11 v:Bit n:(#<= m)
    let same = parser.load_bit()?;
    let len = parser.load_uint(len_bits(max))? as usize;
    if len > max {
        return Err(CellError::InvalidLabel("same label longer than key"));
    }
    let bits = if same && len > 0 {
        u64::MAX >> (64 - len)
    } else {
        0
    };
    Ok((bits, len))
}

/// Builds the root of a `HashmapE 32` dictionary, or `None` when empty.
pub fn build_dict_u32(entries: &BTreeMap<u32, Cell>) -> Result<Option<Cell>, CellError> {
    if entries.is_empty() {
        return Ok(None);
    }
    let items: Vec<(u64, &Cell)> = entries.iter().map(|(k, v)| (u64::from(*k), v)).collect();
    build_node(&items, 32).map(Some)
}

fn build_node(items: &[(u64, &Cell)], key_len: usize) -> Result<Cell, CellError> {
    let first = items[0].0;
    let last = items[items.len() - 1].0;
    let diff = first ^ last;
    let common = if diff == 0 {
        key_len
    } else {
        key_len - (u64::BITS - diff.leading_zeros()) as usize
    };
    let label = if common == 0 { 0 } else { first >> (key_len - common) };

    let mut builder = CellBuilder::new();
    builder.store_bit(true).store_bit(false);
    builder.store_uint(common as u64, len_bits(key_len))?;
    builder.store_uint(label, common)?;

    if common == key_len {
        builder.store_cell(items[0].1)?;
        return builder.build();
    }

    let rest = key_len - common - 1;
    let mask = if rest == 0 { 0 } else { u64::MAX >> (64 - rest) };
    let (left, right): (Vec<_>, Vec<_>) = items.iter().partition(|(key, _)| (key >> rest) & 1 == 0);
    let left: Vec<(u64, &Cell)> = left.into_iter().map(|&(k, v)| (k & mask, v)).collect();
    let right: Vec<(u64, &Cell)> = right.into_iter().map(|&(k, v)| (k & mask, v)).collect();
    builder.store_ref(build_node(&left, rest)?)?;
    builder.store_ref(build_node(&right, rest)?)?;
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coins_cell(amount: u64) -> Cell {
        let mut builder = CellBuilder::new();
        builder.store_coins(&BigUint::from(amount)).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn coins_keep_full_precision() {
        let amount: BigUint = "1329227995784915872903807060280344575".parse().unwrap();
        let mut builder = CellBuilder::new();
        builder.store_coins(&amount).unwrap();
        let cell = builder.build().unwrap();

        let mut parser = cell.parser();
        assert_eq!(parser.load_coins().unwrap(), amount);
        assert_eq!(parser.remaining_bits(), 0);
    }

    #[test]
    fn zero_coins_take_four_bits() {
        let mut builder = CellBuilder::new();
        builder.store_coins(&BigUint::zero()).unwrap();
        assert_eq!(builder.bit_len(), 4);
    }

    #[test]
    fn underflow_is_reported() {
        let mut builder = CellBuilder::new();
        builder.store_uint(5, 8).unwrap();
        let cell = builder.build().unwrap();

        let err = cell.parser().load_u32().unwrap_err();
        assert_eq!(
            err,
            CellError::BitUnderflow {
                needed: 32,
                available: 8
            }
        );
        assert_eq!(cell.opcode(), None);
    }

    #[test]
    fn store_uint_rejects_wide_values() {
        let mut builder = CellBuilder::new();
        assert!(builder.store_uint(16, 4).is_err());
    }

    #[test]
    fn dictionary_keys_survive_building() {
        let mut entries = BTreeMap::new();
        for key in [0u32, 1, 7, 1_700_000_000, u32::MAX] {
            entries.insert(key, coins_cell(u64::from(key) + 1));
        }

        let root = build_dict_u32(&entries).unwrap().unwrap();
        let parsed = parse_dict_u32(&root).unwrap();

        assert_eq!(parsed.keys().copied().collect::<Vec<_>>(), vec![0, 1, 7, 1_700_000_000, u32::MAX]);
        let mut value = parsed[&7].parser();
        assert_eq!(value.load_coins().unwrap(), BigUint::from(8u8));
    }

    #[test]
    fn single_entry_dictionary() {
        let mut entries = BTreeMap::new();
        entries.insert(42u32, Cell::empty());
        let root = build_dict_u32(&entries).unwrap().unwrap();
        assert!(root.refs().is_empty());
        assert!(parse_dict_u32(&root).unwrap().contains_key(&42));
    }

    #[test]
    fn empty_dictionary_is_absent() {
        assert!(build_dict_u32(&BTreeMap::new()).unwrap().is_none());

        let mut builder = CellBuilder::new();
        builder.store_bit(false);
        let cell = builder.build().unwrap();
        assert!(load_dict_u32(&mut cell.parser()).unwrap().is_empty());
    }

    #[test]
    fn short_and_same_labels_are_understood() {
        // Leaf for key 0xFFFF_FFFF written as hml_same$11 v=1 n=32.
        let mut builder = CellBuilder::new();
        builder.store_bit(true).store_bit(true).store_bit(true);
        builder.store_uint(32, 6).unwrap();
        let same = builder.build().unwrap();
        assert!(parse_dict_u32(&same).unwrap().contains_key(&u32::MAX));

        // Fork with an hml_short$0 empty label at the root, two same-labelled leaves.
        let leaf = |bit: bool| {
            let mut b = CellBuilder::new();
            b.store_bit(true).store_bit(true).store_bit(bit);
            b.store_uint(31, 5).unwrap();
            b.build().unwrap()
        };
        let mut root = CellBuilder::new();
        root.store_bit(false).store_bit(false);
        root.store_ref(leaf(false)).unwrap();
        root.store_ref(leaf(true)).unwrap();
        let parsed = parse_dict_u32(&root.build().unwrap()).unwrap();
        assert_eq!(parsed.keys().copied().collect::<Vec<_>>(), vec![0, u32::MAX]);
    }
}
