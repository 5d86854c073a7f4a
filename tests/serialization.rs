use std::fs;
use std::io::Cursor;

use tempfile::TempDir;

use crown_concolic::codec::{self, Reader, Writer};
use crown_concolic::execution::SymbolicExecution;
use crown_concolic::expr::{CompareOp, PointerOp, SymExpr, UnaryOp};
use crown_concolic::input;
use crown_concolic::interpreter::{InputDecl, SymbolicInterpreter};
use crown_concolic::solver::{Solver, Z3Solver};
use crown_concolic::value::{CType, Location, Value};

fn int(v: i64) -> Value {
    Value::integral(v, CType::Int)
}

/// A trace touching every part of the format: scalar, float and bitfield
/// inputs, a symbolic pointer read and an object with two epochs.
fn recorded() -> SymbolicExecution {
    let mut si = SymbolicInterpreter::with_inputs(vec![int(2)]);
    si.alloc(0x4000, 16);

    let i = si.new_input(CType::Int, 0x1000, InputDecl::new("i_1", Location::new("s.c", 2)), None);
    let f = si.new_input(
        CType::Float,
        0x1004,
        InputDecl::new("f_1", Location::new("s.c", 3)),
        Some(Value::floating(0.5, CType::Float)),
    );
    si.new_input(
        CType::BitfieldChar,
        0x1008,
        InputDecl::new("s[0]_1", Location::new("s.c", 4)).bitfield(0xa0, 4, 0, 1),
        None,
    );

    si.push_concrete(Value::integral(0x4000, CType::Pointer));
    si.load(0x1000, i);
    si.apply_bin_ptr(PointerOp::SAddPi, 4, 0x4008);
    si.deref(0x4008, int(30));
    si.load(0x2000, int(30));
    si.apply_compare(CompareOp::Eq, int(1));
    si.branch(1, true, 5, "s.c");

    si.call();
    si.load(0x1004, f);
    si.load(0x2004, Value::floating(1.0, CType::Float));
    si.apply_compare(CompareOp::SLt, int(1));
    si.branch(3, true, 7, "s.c");
    si.ret();

    si.push_concrete(int(9));
    si.store(0x4000);
    si.exit();
    si.into_execution()
}

/// Input values as stored on disk: the integral part, or the bits of a float.
fn stored(values: &[Value]) -> Vec<(CType, u64)> {
    values
        .iter()
        .map(|v| {
            if v.ty.is_float() {
                (v.ty, v.floating.to_bits())
            } else {
                (v.ty, v.integral as u64)
            }
        })
        .collect()
}

fn assert_same(a: &SymbolicExecution, b: &SymbolicExecution) {
    assert_eq!(a.vars(), b.vars());
    assert_eq!(stored(a.inputs()), stored(b.inputs()));
    assert_eq!(a.path(), b.path());
    assert_eq!(a.tracker().snapshot_manager(), b.tracker().snapshot_manager());
}

#[test]
fn trace_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("szd_execution");
    let ex = recorded();

    codec::write_execution_file(&path, &ex).unwrap();
    let parsed = codec::read_execution_file(&path).unwrap();
    assert_same(&ex, &parsed);
    assert_eq!(parsed.path().branches().len(), 4);
    assert_eq!(parsed.tracker().snapshot_manager()[0].len(), 2);
}

#[test]
fn shared_subtrees_are_rebuilt_once() {
    let x = SymExpr::atomic(0, 4, int(1));
    let sum = SymExpr::binary(int(2), crown_concolic::expr::BinaryOp::Add, x.clone(), x.clone());

    let mut w = Writer::new(Vec::new());
    w.write_expr(&sum).unwrap();
    w.write_expr(&x).unwrap();
    let bytes = w.into_inner();

    let mut r = Reader::new(Cursor::new(bytes));
    assert_eq!(r.read_expr().unwrap(), sum);
    assert_eq!(r.read_expr().unwrap(), x);
}

#[test]
fn truncated_traces_are_rejected() {
    let mut w = Writer::new(Vec::new());
    w.write_execution(&recorded()).unwrap();
    let mut bytes = w.into_inner();
    bytes.truncate(bytes.len() / 2);

    let err = Reader::new(Cursor::new(bytes)).read_execution().unwrap_err();
    assert!(matches!(err, codec::Error::UnexpectedEof));
}

#[test]
fn parsed_trace_is_solvable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("szd_execution");
    codec::write_execution_file(&path, &recorded()).unwrap();
    let ex = codec::read_execution_file(&path).unwrap();

    // keep `f < 1.0`, flip it to `f >= 1.0`
    let c = ex.path().constraints()[1].clone();
    let flipped = SymExpr::unary(int(0), UnaryOp::LogicalNot, c);

    let mut solver = Z3Solver::new();
    let soln = solver.solve(&ex, &[flipped]).unwrap().unwrap();
    assert!(soln[&1].floating >= 1.0);
}

#[test]
fn inputs_file_keeps_bitfield_headers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("input");
    let ex = recorded();

    input::write_inputs_file(&path, ex.inputs(), ex.vars()).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "5");
    assert_eq!(lines[2], "12");
    assert_eq!(lines[4], "15 4 0 1");

    let values = input::read_inputs(&path).unwrap();
    assert_eq!(stored(&values), stored(ex.inputs()));
}
