use tracing::debug;

use crate::execution::SymbolicExecution;
use crate::solver::Solver;

use super::{check_prediction, take_random, Error, Search, SearchBase, Target};

const STEP_SIZE: usize = 100;
const LOCAL_STEPS: usize = 100;
const SOLVE_TRIES: usize = 1_000;

/// Random local search over consecutive windows of the path constraints.
pub struct HybridSearch<T, S> {
    base: SearchBase<T, S>,
    step_size: usize,
}

impl<T: Target, S: Solver> HybridSearch<T, S> {
    pub fn new(base: SearchBase<T, S>) -> Self {
        Self::with_step_size(base, STEP_SIZE)
    }

    pub fn with_step_size(base: SearchBase<T, S>, step_size: usize) -> Self {
        Self {
            base,
            step_size: step_size.max(1),
        }
    }

    fn random_local_search(
        &mut self,
        ex: &mut SymbolicExecution,
        start: usize,
        end: usize,
    ) -> Result<(), Error> {
        for _ in 0..LOCAL_STEPS {
            if !self.random_step(ex, start, end)? {
                break;
            }
        }
        Ok(())
    }

    /// Force a random constraint in `[start, end)`; on a faithful replay
    /// `ex` becomes the new execution.
    fn random_step(
        &mut self,
        ex: &mut SymbolicExecution,
        start: usize,
        end: usize,
    ) -> Result<bool, Error> {
        let end = end.min(ex.path().constraints().len());
        // a previous step may have shortened the path below this window
        if start >= end {
            return Ok(false);
        }
        debug!(start, end, "random step");

        let mut idxs = (start..end).collect::<Vec<_>>();
        for _ in 0..SOLVE_TRIES {
            let i = match take_random(self.base.rng(), &mut idxs) {
                Some(i) => i,
                None => break,
            };
            let input = match self.base.solve_at_branch(ex, i) {
                Some(input) => input,
                None => continue,
            };

            let next = self.base.run_program(&input)?;
            self.base.update_coverage(&next, None)?;
            if check_prediction(ex, &next, ex.path().constraints_idx()[i]) {
                *ex = next;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl<T: Target, S: Solver> Search for HybridSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            let mut ex = self.base.run_program(&[])?;
            self.base.update_coverage(&ex, None)?;

            let mut pos = 0;
            while pos < ex.path().constraints().len() {
                self.random_local_search(&mut ex, pos, pos + self.step_size)?;
                pos += self.step_size;
            }
        }
    }
}
