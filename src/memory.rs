//! Byte-addressed symbolic overlay.
//!
//! Memory is tracked in aligned blocks of [`BLOCK_SIZE`] slots. A slot holds the
//! expression whose lowest byte lives at that address; an empty slot means the
//! byte is concrete and its value must come from the running program.
use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use crate::expr::SymExpr;
use crate::value::{CType, Value};

pub const BLOCK_SIZE: usize = 32;

const OFFSET_MASK: u64 = BLOCK_SIZE as u64 - 1;
const ADDR_MASK: u64 = !OFFSET_MASK;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct MemElem {
    slots: [Option<SymExpr>; BLOCK_SIZE],
}

impl Index<usize> for MemElem {
    type Output = Option<SymExpr>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.slots[index]
    }
}

impl IndexMut<usize> for MemElem {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.slots[index]
    }
}

impl MemElem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: [Option<SymExpr>; BLOCK_SIZE]) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[Option<SymExpr>] {
        &self.slots[..]
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Presence bitmap; bit `i` is set when slot `i` holds an expression.
    pub fn bitmap(&self) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .fold(0u32, |acc, (i, _)| acc | (1 << i))
    }

    // Nearest aligned slot at or below `i` holding an expression.
    fn covering(&self, i: usize) -> Option<(usize, &SymExpr)> {
        let mut j = i;
        while j != 0 && self.slots[j].is_none() {
            j &= j - 1;
        }
        self.slots[j].as_ref().map(|e| (j, e))
    }

    fn read(&self, offset: usize, n: usize, val: Value, next: &MemElem) -> Option<SymExpr> {
        let i = offset;

        if let Some((j, e)) = self.covering(i) {
            if e.size() > n && j + e.size() > i {
                return Some(SymExpr::extract_bytes(e.clone(), i - j, n));
            }
        }

        let slot = |k: usize| -> Option<&SymExpr> {
            if k < BLOCK_SIZE {
                self.slots[k].as_ref()
            } else {
                next.slots.get(k - BLOCK_SIZE).and_then(Option::as_ref)
            }
        };

        let mut ret: Option<SymExpr> = None;
        let mut j = 0;
        while j < n {
            let piece = if let Some(e) = slot(i + j) {
                if e.size() > n - j {
                    SymExpr::extract_bytes(e.clone(), 0, n - j)
                } else {
                    e.clone()
                }
            } else {
                let start = j;
                j += 1;
                while j < n && slot(i + j).is_none() {
                    j += 1;
                }
                if ret.is_none() && j == n {
                    // whole window is concrete
                    return None;
                }
                SymExpr::extract_value_bytes(n, val, start, j - start)
            };

            ret = Some(match ret {
                None => piece,
                Some(low) => SymExpr::concatenate(piece, low),
            });
            j = ret.as_ref().map(|e| e.size()).unwrap_or(n);
        }
        ret
    }

    fn write(&mut self, offset: usize, n: usize, e: Option<SymExpr>) {
        let i = offset;

        let split = match self.covering(i) {
            Some((j, old)) if old.size() > n && j + old.size() > i => Some((j, old.clone())),
            _ => None,
        };

        if let Some((j, old)) = split {
            let mut k = 0;
            while k + n <= old.size() && j + k < BLOCK_SIZE {
                self.slots[j + k] = Some(SymExpr::extract_bytes(old.clone(), k, n));
                k += n;
            }
        }

        for slot in self.slots[i..(i + n).min(BLOCK_SIZE)].iter_mut() {
            *slot = None;
        }
        self.slots[i] = e;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolicMemory {
    mem: BTreeMap<u64, MemElem>,
}

impl SymbolicMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (u64, &MemElem)> {
        self.mem.iter().map(|(a, e)| (*a, e))
    }

    pub fn insert_block(&mut self, addr: u64, elem: MemElem) {
        self.mem.insert(addr & ADDR_MASK, elem);
    }

    /// Symbolic view of the `val.ty`-sized value at `addr`, or `None` when
    /// every byte of it is concrete.
    pub fn read(&self, addr: u64, val: Value) -> Option<SymExpr> {
        if val.ty == CType::Struct {
            return None;
        }

        let elem = self.mem.get(&(addr & ADDR_MASK))?;
        let empty = MemElem::default();
        let next = self
            .mem
            .get(&((addr + BLOCK_SIZE as u64) & ADDR_MASK))
            .unwrap_or(&empty);

        elem.read((addr & OFFSET_MASK) as usize, val.size(), val, next)
    }

    pub fn write(&mut self, addr: u64, e: SymExpr) {
        let n = e.size();
        let offset = (addr & OFFSET_MASK) as usize;

        self.mem
            .entry(addr & ADDR_MASK)
            .or_default()
            .write(offset, n, Some(e));

        // bytes spilling into the following block no longer hold their old values
        if offset + n > BLOCK_SIZE {
            let spill = offset + n - BLOCK_SIZE;
            if let Some(next) = self.mem.get_mut(&((addr + BLOCK_SIZE as u64) & ADDR_MASK)) {
                for slot in next.slots[..spill.min(BLOCK_SIZE)].iter_mut() {
                    *slot = None;
                }
            }
        }
    }

    /// Forget any symbolic information for `[addr, addr+n)`.
    pub fn concretize(&mut self, mut addr: u64, n: usize) {
        assert!(n > 0, "concretize of zero bytes");

        let mut left = n as i64;
        while left > 0 {
            let base = addr & ADDR_MASK;
            let elem = match self.mem.get_mut(&base) {
                Some(elem) => elem,
                None => {
                    left -= (BLOCK_SIZE as u64 - (addr & OFFSET_MASK)) as i64;
                    addr = base + BLOCK_SIZE as u64;
                    continue;
                }
            };

            let align = if addr == 0 {
                BLOCK_SIZE
            } else {
                1usize << addr.trailing_zeros().min(5)
            };
            let mut sz = align.min(BLOCK_SIZE);
            while sz as i64 > left {
                sz >>= 1;
            }

            elem.write((addr & OFFSET_MASK) as usize, sz, None);
            addr += sz as u64;
            left -= sz as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, Node};

    fn input(var: u32, ty: CType, v: i64) -> SymExpr {
        SymExpr::atomic(var, ty.size(), Value::integral(v, ty))
    }

    #[test]
    fn concrete_reads_are_none() {
        let mut mem = SymbolicMemory::new();
        assert!(mem.read(0x1000, Value::integral(0, CType::Int)).is_none());

        mem.write(0x1000, input(0, CType::Int, 7));
        assert!(mem.read(0x1008, Value::integral(0, CType::Int)).is_none());
        assert!(mem.read(0x1000, Value::new(4, 0.0, CType::Struct)).is_none());
    }

    #[test]
    fn read_back_whole_write() {
        let mut mem = SymbolicMemory::new();
        let x = input(0, CType::Int, 7);
        mem.write(0x1000, x.clone());
        assert_eq!(mem.read(0x1000, Value::integral(7, CType::Int)), Some(x));
    }

    #[test]
    fn read_inside_larger_write_extracts() {
        let mut mem = SymbolicMemory::new();
        let x = input(0, CType::Int, 0x0a0b0c0d);
        mem.write(0x1000, x.clone());

        let e = mem.read(0x1002, Value::integral(0x0a0b, CType::Short)).unwrap();
        assert_eq!(e.size(), 2);
        assert_eq!(e.value().integral, 0x0a0b);
        match e.node() {
            Node::Binary(BinaryOp::Extract, inner, start) => {
                assert_eq!(inner, &x);
                assert_eq!(start.value().integral, 2);
            }
            n => panic!("unexpected node {:?}", n),
        }
    }

    #[test]
    fn read_mixes_symbolic_and_concrete_bytes() {
        let mut mem = SymbolicMemory::new();
        let c = input(0, CType::UChar, 0x11);
        mem.write(0x1001, c.clone());

        // little-endian 0x44332211 with the second byte symbolic
        let e = mem.read(0x1000, Value::integral(0x44331111, CType::Int)).unwrap();
        assert_eq!(e.size(), 4);
        assert_eq!(e.value().integral, 0x44331111);
    }

    #[test]
    fn overlapping_write_splits_old_expression() {
        let mut mem = SymbolicMemory::new();
        let wide = input(0, CType::Int, 0x01020304);
        mem.write(0x1000, wide.clone());

        let b = input(1, CType::UChar, 0x7f);
        mem.write(0x1001, b.clone());

        assert_eq!(mem.read(0x1001, Value::integral(0x7f, CType::UChar)), Some(b));
        let low = mem.read(0x1000, Value::integral(0x04, CType::UChar)).unwrap();
        assert_eq!(low.value().integral, 0x04);
        let high = mem.read(0x1003, Value::integral(0x01, CType::UChar)).unwrap();
        assert_eq!(high.value().integral, 0x01);
    }

    #[test]
    fn read_across_block_boundary() {
        let mut mem = SymbolicMemory::new();
        let lo = input(0, CType::UShort, 0x2222);
        let hi = input(1, CType::UShort, 0x3333);
        mem.write(0x101e, lo);
        mem.write(0x1020, hi);

        let e = mem.read(0x101e, Value::integral(0x33332222, CType::UInt)).unwrap();
        assert_eq!(e.size(), 4);
        assert_eq!(e.value().integral, 0x33332222);
    }

    #[test]
    fn concretize_clears_range() {
        let mut mem = SymbolicMemory::new();
        mem.write(0x1000, input(0, CType::Long, 1));
        mem.write(0x1008, input(1, CType::Int, 2));
        mem.concretize(0x1000, 8);

        assert!(mem.read(0x1000, Value::integral(1, CType::Long)).is_none());
        assert!(mem.read(0x1008, Value::integral(2, CType::Int)).is_some());

        // absent blocks are skipped
        mem.concretize(0x8000, 64);
    }

    #[test]
    fn bitmap_tracks_slots() {
        let mut elem = MemElem::new();
        elem[0] = Some(input(0, CType::UChar, 1));
        elem[5] = Some(input(1, CType::UChar, 1));
        assert_eq!(elem.bitmap(), 0b100001);
    }
}
