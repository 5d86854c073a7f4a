use proptest::prelude::*;

use crown_concolic::expr::SymExpr;
use crown_concolic::memory::SymbolicMemory;
use crown_concolic::value::{self, CType, Value};

const BASE: u64 = 0x1000;

fn ty_of(size: usize) -> CType {
    match size {
        1 => CType::UChar,
        2 => CType::UShort,
        4 => CType::UInt,
        _ => CType::ULongLong,
    }
}

/// Aligned `(offset, size)` writes inside one block.
fn aligned_write() -> impl Strategy<Value = (u64, usize)> {
    prop::sample::select(vec![1usize, 2, 4, 8])
        .prop_flat_map(|size| ((0..32 / size as u64).prop_map(move |slot| slot * size as u64), Just(size)))
}

proptest! {
    #[test]
    fn unshadowed_writes_read_back(writes in prop::collection::vec(aligned_write(), 1..24)) {
        let mut mem = SymbolicMemory::new();
        let exprs = writes
            .iter()
            .enumerate()
            .map(|(var, &(offset, size))| {
                let e = SymExpr::atomic(var as u32, size, Value::integral(0, ty_of(size)));
                mem.write(BASE + offset, e.clone());
                e
            })
            .collect::<Vec<_>>();

        for (w, &(offset, size)) in writes.iter().enumerate() {
            let shadowed = writes[w + 1..]
                .iter()
                .any(|&(o, s)| o < offset + size as u64 && offset < o + s as u64);
            if !shadowed {
                let read = mem.read(BASE + offset, Value::integral(0, ty_of(size)));
                prop_assert_eq!(read, Some(exprs[w].clone()));
            }
        }
    }

    #[test]
    fn concretized_ranges_read_concrete(
        writes in prop::collection::vec(aligned_write(), 1..16),
        (offset, size) in aligned_write(),
    ) {
        let mut mem = SymbolicMemory::new();
        for (var, &(o, s)) in writes.iter().enumerate() {
            mem.write(BASE + o, SymExpr::atomic(var as u32, s, Value::integral(0, ty_of(s))));
        }

        mem.concretize(BASE, 32);
        prop_assert!(mem.read(BASE + offset, Value::integral(0, ty_of(size))).is_none());
    }

    #[test]
    fn float_bit_strings(bits in any::<u32>()) {
        let f = f32::from_bits(bits);
        prop_assume!(!f.is_nan());
        let s = value::float_to_bin_string(f);
        prop_assert_eq!(s.len(), 32);
        prop_assert_eq!(value::bin_string_to_float(&s).unwrap().to_bits(), bits);
    }

    #[test]
    fn double_bit_strings(bits in any::<u64>()) {
        let d = f64::from_bits(bits);
        prop_assume!(!d.is_nan());
        let s = value::double_to_bin_string(d);
        prop_assert_eq!(s.len(), 64);
        prop_assert_eq!(value::bin_string_to_double(&s).unwrap().to_bits(), bits);
    }
}

#[test]
fn partial_concretize_keeps_neighbours() {
    let mut mem = SymbolicMemory::new();
    let a = SymExpr::atomic(0, 4, Value::integral(1, CType::UInt));
    let b = SymExpr::atomic(1, 4, Value::integral(2, CType::UInt));
    mem.write(BASE, a);
    mem.write(BASE + 4, b.clone());

    mem.concretize(BASE, 4);
    assert!(mem.read(BASE, Value::integral(1, CType::UInt)).is_none());
    assert_eq!(mem.read(BASE + 4, Value::integral(2, CType::UInt)), Some(b));
}

#[test]
fn concretize_skips_missing_blocks() {
    let mut mem = SymbolicMemory::new();
    let e = SymExpr::atomic(0, 8, Value::integral(0, CType::ULongLong));
    mem.write(BASE + 64, e.clone());

    mem.concretize(BASE, 64);
    assert_eq!(mem.read(BASE + 64, Value::integral(0, CType::ULongLong)), Some(e));

    mem.concretize(BASE + 60, 12);
    assert!(mem.read(BASE + 64, Value::integral(0, CType::ULongLong)).is_none());
}
