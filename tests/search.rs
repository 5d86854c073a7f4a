use std::fs;

use proptest::prelude::*;
use tempfile::TempDir;

use crown_concolic::codec;
use crown_concolic::config::{self, SearchConfig};
use crown_concolic::execution::SymbolicExecution;
use crown_concolic::expr::CompareOp;
use crown_concolic::interpreter::{InputDecl, SymbolicInterpreter};
use crown_concolic::path::{BranchId, SymbolicPath};
use crown_concolic::search::{
    check_prediction, BoundedDepthFirstSearch, BranchTable, Error, ProcessTarget, RandomSearch,
    Search, SearchBase, Strategy, Target,
};
use crown_concolic::solver::Z3Solver;
use crown_concolic::value::{CType, Location, Value};

/// One function with branch pairs `(1, 2)` and `(3, 4)`.
const BRANCHES: &str = "1 2\n1 2\n3 4\n";

/// ```c
/// int x; crown_int(&x);
/// if (x > 5) {            // 1 / 2
///     if (x == 42) { }    // 3 / 4
/// }
/// ```
fn nested(inputs: &[Value]) -> Result<SymbolicExecution, Error> {
    let mut si = SymbolicInterpreter::with_inputs(inputs.to_vec());
    let x = si.new_input(
        CType::Int,
        0x1000,
        InputDecl::new("x_1", Location::new("t.c", 2)),
        None,
    );

    let branch = |si: &mut SymbolicInterpreter, op, k: i64, bids: (BranchId, BranchId), taken: bool| {
        si.load(0x1000, x);
        si.load(0x2000, Value::integral(k, CType::Int));
        si.apply_compare(op, Value::integral(taken as i64, CType::Int));
        let bid = if taken { bids.0 } else { bids.1 };
        si.branch(bid, taken, 3, "t.c");
    };

    let outer = x.integral > 5;
    branch(&mut si, CompareOp::SGt, 5, (1, 2), outer);
    if outer {
        branch(&mut si, CompareOp::Eq, 42, (3, 4), x.integral == 42);
    }

    si.exit();
    Ok(si.into_execution())
}

fn base<T: Target>(dir: &TempDir, iterations: usize, target: T) -> SearchBase<T, Z3Solver> {
    let config = SearchConfig::new("unused", iterations)
        .with_work_dir(dir.path())
        .with_seed(7);
    let table = BranchTable::parse(BRANCHES).unwrap();
    SearchBase::new(config, table, target, Z3Solver::new())
}

#[test]
fn dfs_covers_nested_branches() {
    let dir = TempDir::new().unwrap();
    let mut search = BoundedDepthFirstSearch::new(base(&dir, 10, nested), 100);
    search.run().unwrap();

    let coverage = search.base().coverage();
    for bid in 1..=4 {
        assert!(coverage.is_covered(bid), "branch {} not covered", bid);
    }
    assert_eq!(coverage.total_num_covered(), 4);
    assert_eq!(coverage.reachable_functions(), 1);
    assert_eq!(coverage.reachable_branches(), 4);

    let written = fs::read_to_string(dir.path().join(config::COVERAGE_FILE)).unwrap();
    assert_eq!(written.lines().collect::<Vec<_>>(), vec!["1", "2", "3", "4"]);
}

#[test]
fn iteration_cap_ends_the_search() {
    let dir = TempDir::new().unwrap();
    let mut search = RandomSearch::new(base(&dir, 3, nested));
    assert!(matches!(search.run(), Err(Error::IterationLimit)));
}

#[test]
fn strategies_build_from_names() {
    for strategy in Strategy::ALL {
        if strategy == Strategy::Cfg {
            // needs a cfg_branches file
            continue;
        }
        let dir = TempDir::new().unwrap();
        let mut search = strategy.build(base(&dir, 4, nested)).unwrap();
        match search.run() {
            Ok(()) | Err(Error::IterationLimit) => (),
            Err(e) => panic!("{} failed: {}", strategy, e),
        }
    }
}

#[test]
fn testcases_are_saved() {
    let dir = TempDir::new().unwrap();
    let config = SearchConfig::new("unused", 10)
        .with_work_dir(dir.path())
        .with_testcase_dir(dir.path().join("tc"))
        .with_seed(1);
    let table = BranchTable::parse(BRANCHES).unwrap();
    let mut search = BoundedDepthFirstSearch::new(SearchBase::new(config, table, nested, Z3Solver::new()), 100);
    search.run().unwrap();

    let first = fs::read_to_string(dir.path().join("tc").join("input.1")).unwrap();
    assert_eq!(first.lines().next(), Some("5"));
    assert!(dir.path().join("tc").join("input.2").exists());
}

#[test]
fn process_target_round_trip() {
    let dir = TempDir::new().unwrap();
    let recorded = nested(&[Value::integral(9, CType::Int)]).unwrap();
    codec::write_execution_file(dir.path().join("trace.bin"), &recorded).unwrap();

    let command = format!("cp trace.bin {}", config::EXECUTION_FILE);
    let config = SearchConfig::new(command, 1).with_work_dir(dir.path());
    let mut target = ProcessTarget::new(&config);

    let ex = target.execute(&[Value::integral(9, CType::Int)]).unwrap();
    assert_eq!(ex.path().branches(), recorded.path().branches());
    assert_eq!(ex.inputs()[0].integral, 9);

    let input = fs::read_to_string(dir.path().join(config::INPUT_FILE)).unwrap();
    assert_eq!(input, "5\n9\n");
}

#[test]
fn missing_trace_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = SearchConfig::new("true", 1).with_work_dir(dir.path());
    let mut target = ProcessTarget::new(&config);
    assert!(matches!(target.execute(&[]), Err(Error::Parse(_))));
}

#[test]
fn branch_table_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(config::BRANCHES_FILE);
    fs::write(&path, "1 1\n5 6\n2 0\n3 1\n7 8\n").unwrap();

    let table = BranchTable::from_file(&path).unwrap();
    assert_eq!(table.num_functions(), 4);
    assert_eq!(table.branch_count(1), 2);
    assert_eq!(table.branch_count(2), 0);
    assert_eq!(table.function_of(7), 3);
    assert_eq!(table.paired(8), 7);
    assert_eq!(table.max_branch(), 9);

    assert!(matches!(
        BranchTable::from_file(dir.path().join("missing")),
        Err(Error::Io { .. })
    ));
}

fn with_branches(branches: Vec<BranchId>) -> SymbolicExecution {
    let path = SymbolicPath::from_parts(branches, Vec::new(), Vec::new(), Vec::new());
    SymbolicExecution::from_parts(Vec::new(), Vec::new(), Default::default(), path)
}

proptest! {
    #[test]
    fn prediction_holds_only_for_a_single_flip(
        prefix in prop::collection::vec(1..50i32, 0..20),
        old_tail in prop::collection::vec(1..50i32, 1..10),
        new_tail in prop::collection::vec(1..50i32, 1..10),
    ) {
        let idx = prefix.len();
        let old = with_branches(prefix.iter().chain(&old_tail).copied().collect());
        let new = with_branches(prefix.iter().chain(&new_tail).copied().collect());

        let expected = old_tail[0] != new_tail[0];
        prop_assert_eq!(check_prediction(&old, &new, idx), expected);
        // the same path never counts as a flip
        prop_assert!(!check_prediction(&old, &old, idx));
    }
}
