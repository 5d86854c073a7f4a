use std::collections::BTreeMap;

use thiserror::Error;

use crate::execution::SymbolicExecution;
use crate::expr::SymExpr;
use crate::value::Value;

mod z3;

pub use self::z3::{SolverContext, Z3Solver};

#[derive(Debug, Error)]
pub enum Error {
    #[error("mismatched operand sorts in `{0}`")]
    SortMismatch(String),
    #[error("operator `{op}` is not supported on {sort} operands")]
    UnsupportedOp { op: &'static str, sort: &'static str },
    #[error("object snapshot a!{manager}{snapshot} is not recorded")]
    MissingSnapshot { manager: usize, snapshot: usize },
    #[error("unknown input variable x{0}")]
    UnknownVariable(u32),
    #[error("model has no value for x{0}")]
    ModelEval(usize),
}

/// Input index to the value the solver picked for it.
pub type Assignment = BTreeMap<usize, Value>;

pub trait Solver {
    /// Find values for every input of `ex` under which all `constraints`
    /// hold. `Ok(None)` means unsatisfiable (or undecided).
    fn solve(
        &mut self,
        ex: &SymbolicExecution,
        constraints: &[SymExpr],
    ) -> Result<Option<Assignment>, Error>;

    fn is_sat(&mut self, ex: &SymbolicExecution, constraints: &[SymExpr]) -> Result<bool, Error> {
        self.solve(ex, constraints).map(|soln| soln.is_some())
    }
}
