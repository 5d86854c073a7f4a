use tracing::{info, warn};

use crate::execution::SymbolicExecution;
use crate::solver::Solver;

use super::{check_prediction, Error, Search, SearchBase, Target};

/// Negate constraints from the end of the path backwards, descending into
/// every prediction-respecting execution until `max_depth` branches have
/// been forced along one path.
pub struct BoundedDepthFirstSearch<T, S> {
    base: SearchBase<T, S>,
    max_depth: usize,
}

impl<T: Target, S: Solver> BoundedDepthFirstSearch<T, S> {
    pub fn new(base: SearchBase<T, S>, max_depth: usize) -> Self {
        Self { base, max_depth }
    }

    pub fn base(&self) -> &SearchBase<T, S> {
        &self.base
    }

    fn dfs(&mut self, pos: usize, mut depth: usize, prev: &SymbolicExecution) -> Result<(), Error> {
        for i in (pos..prev.path().constraints().len()).rev() {
            if depth == 0 {
                break;
            }

            let input = match self.base.solve_at_branch(prev, i) {
                Some(input) => input,
                None => continue,
            };

            let cur = self.base.run_program(&input)?;
            self.base.update_coverage(&cur, None)?;

            let branch_idx = prev.path().constraints_idx()[i];
            if !check_prediction(prev, &cur, branch_idx) {
                warn!(branch_idx, "prediction failed");
                continue;
            }

            depth -= 1;
            self.dfs(i + 1, depth, &cur)?;
        }
        Ok(())
    }
}

impl<T: Target, S: Solver> Search for BoundedDepthFirstSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        let ex = self.base.run_program(&[])?;
        self.base.update_coverage(&ex, None)?;
        self.dfs(0, self.max_depth, &ex)?;

        info!(
            iterations = self.base.num_iters(),
            covered = self.base.coverage().total_num_covered(),
            "search finished"
        );
        Ok(())
    }
}
