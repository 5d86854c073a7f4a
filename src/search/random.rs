use rand::Rng;
use tracing::{debug, info, warn};

use crate::execution::SymbolicExecution;
use crate::solver::Solver;
use crate::value::Value;

use super::{check_prediction, take_random, Error, Search, SearchBase, Target};

const RESET_BUDGET: usize = 10_000;
const SOLVE_TRIES: usize = 1_000;

/// Fresh random inputs every run; the solver is never consulted.
pub struct RandomInputSearch<T, S> {
    base: SearchBase<T, S>,
}

impl<T: Target, S: Solver> RandomInputSearch<T, S> {
    pub fn new(base: SearchBase<T, S>) -> Self {
        Self { base }
    }
}

impl<T: Target, S: Solver> Search for RandomInputSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        let mut ex = self.base.run_program(&[])?;
        self.base.update_coverage(&ex, None)?;

        loop {
            let input = self.base.random_input(ex.vars());
            ex = self.base.run_program(&input)?;
            self.base.update_coverage(&ex, None)?;
        }
    }
}

/// Negate a randomly chosen constraint of the current execution, moving on
/// whenever the result is a faithful or coverage-increasing execution.
/// Restarts from empty inputs after a long stretch with no new coverage.
pub struct RandomSearch<T, S> {
    base: SearchBase<T, S>,
}

impl<T: Target, S: Solver> RandomSearch<T, S> {
    pub fn new(base: SearchBase<T, S>) -> Self {
        Self { base }
    }

    /// Index of the negated constraint and the inputs that negate it.
    fn solve_random_branch(&mut self, ex: &SymbolicExecution) -> Option<(usize, Vec<Value>)> {
        let mut idxs = (0..ex.path().constraints().len()).collect::<Vec<_>>();

        for _ in 0..SOLVE_TRIES {
            let i = take_random(self.base.rng(), &mut idxs)?;
            if let Some(input) = self.base.solve_at_branch(ex, i) {
                debug!(constraint = i, remaining = idxs.len(), "solved");
                return Some((i, input));
            }
        }
        None
    }
}

impl<T: Target, S: Solver> Search for RandomSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            debug!("reset");
            let mut ex = self.base.run_program(&[])?;
            self.base.update_coverage(&ex, None)?;

            let mut count = 0;
            while count < RESET_BUDGET {
                count += 1;

                let (idx, input) = match self.solve_random_branch(&ex) {
                    Some(soln) => soln,
                    None => continue,
                };

                let next = self.base.run_program(&input)?;
                let found = self.base.update_coverage(&next, None)?;
                let branch_idx = ex.path().constraints_idx()[idx];
                let prediction_failed = !check_prediction(&ex, &next, branch_idx);

                if found {
                    count = 0;
                    ex = next;
                    if prediction_failed {
                        info!(branch_idx, "prediction failed, but found new coverage");
                    }
                } else if !prediction_failed {
                    ex = next;
                } else {
                    warn!(branch_idx, "prediction failed");
                }
            }
        }
    }
}

/// Walk the path front to back, forcing each solvable constraint and
/// following the forced execution with probability one half.
pub struct UniformRandomSearch<T, S> {
    base: SearchBase<T, S>,
    max_depth: usize,
}

impl<T: Target, S: Solver> UniformRandomSearch<T, S> {
    pub fn new(base: SearchBase<T, S>, max_depth: usize) -> Self {
        Self { base, max_depth }
    }

    /// Returns the execution to continue from and whether the target ran.
    fn random_path(&mut self, mut prev: SymbolicExecution) -> Result<(SymbolicExecution, bool), Error> {
        let mut i = 0;
        let mut depth = 0;
        let mut ran = false;
        debug!(constraints = prev.path().constraints().len(), "uniform random path");

        while i < prev.path().constraints().len() && depth < self.max_depth {
            if let Some(input) = self.base.solve_at_branch(&prev, i) {
                depth += 1;

                if self.base.rng().gen_bool(0.5) {
                    ran = true;
                    let cur = self.base.run_program(&input)?;
                    self.base.update_coverage(&cur, None)?;

                    let branch_idx = prev.path().constraints_idx()[i];
                    if check_prediction(&prev, &cur, branch_idx) {
                        prev = cur;
                    } else {
                        warn!(branch_idx, "prediction failed");
                        depth -= 1;
                    }
                }
            }
            i += 1;
        }
        Ok((prev, ran))
    }
}

impl<T: Target, S: Solver> Search for UniformRandomSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        let mut ex = self.base.run_program(&[])?;
        self.base.update_coverage(&ex, None)?;

        loop {
            debug!("reset");
            let (next, ran) = self.random_path(ex)?;
            ex = next;

            // nothing was forced; restart from empty inputs
            if !ran {
                ex = self.base.run_program(&[])?;
                self.base.update_coverage(&ex, None)?;
            }
        }
    }
}
