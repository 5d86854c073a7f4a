use crown_concolic::execution::SymbolicExecution;
use crown_concolic::expr::{CompareOp, Node, PointerOp};
use crown_concolic::interpreter::{InputDecl, SymbolicInterpreter};
use crown_concolic::path::{CALL_BRANCH, RETURN_BRANCH};
use crown_concolic::value::{CType, Location, Value};

fn int(v: i64) -> Value {
    Value::integral(v, CType::Int)
}

fn decl(name: &str, line: i32) -> InputDecl {
    InputDecl::new(name, Location::new("a.c", line))
}

/// ```c
/// int a[4] = {10, 20, 30, 40};
/// int i; crown_int(&i);
/// if (a[i] == 30) { }
/// a[1] = 7;
/// ```
fn indexed_read() -> SymbolicExecution {
    let mut si = SymbolicInterpreter::new();
    si.alloc(0x4000, 16);
    let i = si.new_input(CType::Int, 0x1000, decl("i_1", 2), None);

    si.push_concrete(Value::integral(0x4000, CType::Pointer));
    si.load(0x1000, i);
    si.apply_bin_ptr(PointerOp::SAddPi, 4, 0x4000);
    si.deref(0x4000, int(10));
    si.load(0x2000, int(30));
    si.apply_compare(CompareOp::Eq, int(0));
    si.branch(6, false, 3, "a.c");

    si.push_concrete(int(7));
    si.store(0x4004);

    si.exit();
    si.into_execution()
}

#[test]
fn symbolic_index_reads_through_object() {
    let ex = indexed_read();
    let path = ex.path();
    assert_eq!(path.branches(), &[6]);
    assert_eq!(path.constraints().len(), 1);

    let read = match path.constraints()[0].node() {
        Node::Unary(_, cmp) => match cmp.node() {
            Node::Compare(CompareOp::Eq, l, _) => l.clone(),
            n => panic!("unexpected node {:?}", n),
        },
        n => panic!("unexpected node {:?}", n),
    };
    match read.node() {
        Node::Deref {
            manager, snapshot, ..
        } => {
            assert_eq!((*manager, *snapshot), (0, 0));
        }
        n => panic!("unexpected node {:?}", n),
    }
}

#[test]
fn write_after_read_starts_new_epoch() {
    let ex = indexed_read();
    let tracker = ex.tracker();
    assert_eq!(tracker.live_regions(), 0);
    assert_eq!(tracker.snapshot_manager().len(), 1);

    // the epoch the constraint reads from, then the one holding `a[1] = 7`
    let history = &tracker.snapshot_manager()[0];
    assert_eq!(history.len(), 2);
    assert!(history[0].writes().is_empty());
    assert_eq!(history[1].snapshot_idx(), 1);
    assert_eq!(history[1].writes().len(), 1);
    assert_eq!(history[1].writes()[0].1.value().integral, 7);
}

#[test]
fn free_requires_the_start_address() {
    let mut si = SymbolicInterpreter::new();
    si.alloc(0x4000, 16);
    si.free(0x4004);
    assert_eq!(si.tracker().live_regions(), 1);

    si.free(0x4000);
    assert_eq!(si.tracker().live_regions(), 0);
    assert!(si.tracker().snapshot(0, 0).is_some());
}

#[test]
fn no_allocations_after_exit() {
    let mut si = SymbolicInterpreter::new();
    si.alloc(0x4000, 8);
    si.exit();
    si.alloc(0x5000, 8);
    assert_eq!(si.tracker().live_regions(), 0);
    assert_eq!(si.tracker().snapshot_manager().len(), 1);
}

#[test]
fn symbolic_values_move_through_memory() {
    let mut si = SymbolicInterpreter::with_inputs(vec![int(3)]);
    let x = si.new_input(CType::Int, 0x1000, decl("x_1", 1), None);
    assert_eq!(x, int(3));

    // y = x; if (y < 0)
    si.load(0x1000, x);
    si.store(0x3000);
    si.load(0x3000, x);
    si.load(0x2000, int(0));
    si.apply_compare(CompareOp::SLt, int(0));
    si.branch(2, false, 4, "a.c");

    let ex = si.execution();
    assert_eq!(ex.path().constraints()[0].to_string(), "! (x0 < 0)");
    assert_eq!(ex.path().locations()[0], Location::new("a.c", 4));
}

#[test]
fn function_calls_are_bracketed() {
    let mut si = SymbolicInterpreter::new();
    let x = si.new_input(CType::Int, 0x1000, decl("x_1", 1), None);

    // r = f(x) with f instrumented and returning its argument
    si.load(0x1000, x);
    si.call();
    si.store(0x7000);
    si.load(0x7000, x);
    si.ret();
    si.handle_return(x);
    si.store(0x3000);
    si.clear_stack();

    si.load(0x3000, x);
    si.branch(1, false, 9, "a.c");

    let path = si.execution().path();
    assert_eq!(path.branches(), &[CALL_BRANCH, RETURN_BRANCH, 1]);
    assert_eq!(path.constraints_idx(), &[2]);
    assert_eq!(path.constraints()[0].to_string(), "(x0 == 0)");
}

#[test]
fn inputs_record_their_declarations() {
    let mut si = SymbolicInterpreter::new();
    si.new_input(CType::UShort, 0x1000, decl("n_1", 3), None);
    si.new_input(CType::Double, 0x1008, decl("d_1", 4), Some(Value::floating(2.5, CType::Double)));

    let ex = si.execution();
    assert_eq!(ex.var_names(), vec!["n_1", "d_1"]);
    assert_eq!(ex.vars()[1].location, Location::new("a.c", 4));
    assert_eq!(ex.inputs()[1].floating, 2.5);
    assert_eq!(ex.vars()[0].ty, CType::UShort);
}
