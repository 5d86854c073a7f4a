//! Coverage-guided strategies that rank constraints by how close their
//! untaken side is to uncovered code.
use std::collections::{BTreeSet, VecDeque};

use fxhash::FxHashMap as HashMap;
use itertools::Itertools;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::execution::SymbolicExecution;
use crate::path::{BranchId, CALL_BRANCH, RETURN_BRANCH};
use crate::solver::Solver;

use super::branches::CfgTable;
use super::{check_prediction, Error, Search, SearchBase, Target};

/// Distance of a branch from which no uncovered branch is reachable.
pub const INFINITE_DISTANCE: usize = 10_000;

const COVERED_PENALTY: usize = 100_000_000;
const BASELINE_ITERS: usize = 250;
const HEURISTIC_DEPTH: usize = 5;
const HEURISTIC_ITERS: usize = 30;

/// Pair each constraint index with its score and stably sort by score, so
/// ties keep the order of `idxs`.
fn rank<F>(idxs: Vec<usize>, mut score: F) -> Vec<(usize, usize)>
where
    F: FnMut(usize) -> usize,
{
    idxs.into_iter()
        .map(|i| (i, score(i)))
        .sorted_by_key(|&(_, s)| s)
        .collect()
}

/// Advance `pos` past the return closing the current call, stepping over
/// nested calls.
pub fn skip_until_return(path: &[BranchId], pos: &mut usize) {
    while *pos < path.len() && path[*pos] != RETURN_BRANCH {
        if path[*pos] == CALL_BRANCH {
            *pos += 1;
            skip_until_return(path, pos);
            if *pos >= path.len() {
                return;
            }
        }
        *pos += 1;
    }
}

/// Collect the branches that can immediately follow position `*pos - 1`:
/// the first branch inside each call that comes next, and the first branch
/// after those calls.
pub fn collect_next_branches(path: &[BranchId], pos: &mut usize, idxs: &mut Vec<usize>) {
    while *pos < path.len() && path[*pos] == CALL_BRANCH {
        *pos += 1;
        collect_next_branches(path, pos, idxs);
        skip_until_return(path, pos);
        if *pos >= path.len() {
            return;
        }
        *pos += 1;
    }

    if *pos < path.len() && path[*pos] >= 0 {
        idxs.push(*pos);
        *pos += 1;
    }
}

/// Positions of the branches following position `i` in the CFG. For the
/// path `* ( ( ( 1 2 ) 4 ) ( 5 ( 6 7 ) ) 8 ) 9` those following `*` are
/// 1, 4, 5, 8 and 9.
pub fn next_branches(path: &[BranchId], i: usize) -> Vec<usize> {
    let mut pos = i + 1;
    let mut idxs = Vec::new();
    collect_next_branches(path, &mut pos, &mut idxs);
    idxs
}

/// Fewest branches (call/return balanced) between position `i` and any
/// of `targets` later on the path.
pub fn min_cfl_distance(path: &[BranchId], i: usize, targets: &BTreeSet<BranchId>) -> usize {
    if i >= path.len() {
        return usize::MAX;
    }
    if targets.contains(&path[i]) {
        return 0;
    }

    let mut stack = Vec::new();
    let mut min_dist = usize::MAX;
    let mut cur_dist = 1;

    for &bid in &path[i + 1..] {
        if targets.contains(&bid) {
            min_dist = min_dist.min(cur_dist);
        }

        if bid >= 0 {
            cur_dist += 1;
        } else if bid == CALL_BRANCH {
            stack.push(cur_dist);
        } else if bid == RETURN_BRANCH {
            match stack.pop() {
                Some(d) => cur_dist = d,
                None => break,
            }
        } else {
            warn!(bid, "bad branch id on path");
            break;
        }
    }
    min_dist
}

/// Whether one of `targets` is reachable from position `i` within `dist`
/// CFG steps along the path.
pub fn find_along_cfg(path: &[BranchId], i: usize, dist: usize, targets: &BTreeSet<BranchId>) -> bool {
    if i >= path.len() {
        return false;
    }
    if targets.contains(&path[i]) {
        return true;
    }
    if dist == 0 {
        return false;
    }
    next_branches(path, i)
        .into_iter()
        .any(|j| find_along_cfg(path, j, dist - 1, targets))
}

/// Prefer constraints whose other side is uncovered, then those forced
/// least often in this round.
pub struct CfgBaselineSearch<T, S> {
    base: SearchBase<T, S>,
}

impl<T: Target, S: Solver> CfgBaselineSearch<T, S> {
    pub fn new(base: SearchBase<T, S>) -> Self {
        Self { base }
    }

    fn do_search(
        &mut self,
        mut iters: usize,
        pos: usize,
        prev: &SymbolicExecution,
    ) -> Result<Option<SymbolicExecution>, Error> {
        let mut idxs = (pos..prev.path().constraints().len()).collect::<Vec<_>>();
        idxs.shuffle(self.base.rng());

        let base = &self.base;
        let mut seen = HashMap::<BranchId, usize>::default();
        let scored = rank(idxs, |i| {
            let bid = base.flipped_branch(prev, i);
            let seen = seen.entry(bid).or_insert(0);
            let penalty = if base.coverage().is_covered(bid) {
                COVERED_PENALTY
            } else {
                0
            };
            let score = penalty + *seen;
            *seen += 1;
            score
        });

        for (i, _) in scored {
            if iters == 0 {
                return Ok(None);
            }
            let input = match self.base.solve_at_branch(prev, i) {
                Some(input) => input,
                None => continue,
            };

            let cur = self.base.run_program(&input)?;
            iters -= 1;
            if self.base.update_coverage(&cur, None)? {
                return Ok(Some(cur));
            }
        }
        Ok(None)
    }
}

impl<T: Target, S: Solver> Search for CfgBaselineSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            debug!("reset");
            let mut ex = self.base.run_program(&[])?;
            self.base.update_coverage(&ex, None)?;

            while let Some(next) = self.do_search(BASELINE_ITERS, 0, &ex)? {
                ex = next;
            }
        }
    }
}

/// Outcome counters of [`CfgHeuristicSearch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfgStats {
    pub inner_solves: usize,
    pub inner_unsats: usize,
    pub inner_lucky_successes: usize,
    pub inner_successes_pred_fail: usize,
    pub inner_zero_successes: usize,
    pub inner_nonzero_successes: usize,
    pub inner_pred_fails: usize,
    pub top_solves: usize,
    pub top_solve_successes: usize,
    pub solves: usize,
    pub solve_successes: usize,
    pub solve_all_concrete: usize,
    pub solve_no_paths: usize,
    pub solve_unsats: usize,
    pub solve_sat_attempts: usize,
    pub solve_pred_fails: usize,
    pub solve_recurses: usize,
}

impl CfgStats {
    pub fn inner_successes(&self) -> usize {
        self.inner_lucky_successes
            + self.inner_zero_successes
            + self.inner_nonzero_successes
            + self.top_solve_successes
    }

    pub fn log(&self) {
        info!(
            successes = self.inner_successes(),
            solves = self.inner_solves,
            lucky = self.inner_lucky_successes,
            lucky_continued = self.inner_lucky_successes - self.inner_successes_pred_fail,
            on_zero = self.inner_zero_successes,
            on_others = self.inner_nonzero_successes,
            unsats = self.inner_unsats,
            prediction_failures = self.inner_pred_fails,
            "cfg solves"
        );
        info!(
            successes = self.top_solve_successes,
            solves = self.top_solves,
            "top-level solve along cfg"
        );
        info!(
            successes = self.solve_successes,
            solves = self.solves,
            all_concrete = self.solve_all_concrete,
            no_paths = self.solve_no_paths,
            unsats = self.solve_unsats,
            sat_attempts = self.solve_sat_attempts,
            prediction_failures = self.solve_pred_fails,
            recursions = self.solve_recurses,
            "all solve along cfg"
        );
    }
}

/// Force constraints in order of the CFG distance from their untaken side
/// to the nearest uncovered branch, then keep forcing along the shortest
/// CFG path towards it.
pub struct CfgHeuristicSearch<T, S> {
    base: SearchBase<T, S>,
    cfg: CfgTable,
    dist: Vec<usize>,
    stats: CfgStats,
}

impl<T: Target, S: Solver> CfgHeuristicSearch<T, S> {
    pub fn new(base: SearchBase<T, S>, cfg: CfgTable) -> Self {
        let dist = vec![0; base.table().max_branch()];
        Self {
            base,
            cfg,
            dist,
            stats: CfgStats::default(),
        }
    }

    /// Load `cfg_branches` from the directory holding the branch table.
    pub fn from_config(base: SearchBase<T, S>) -> Result<Self, Error> {
        let cfg = CfgTable::from_file(base.config().cfg_path(), base.table())?;
        Ok(Self::new(base, cfg))
    }

    pub fn stats(&self) -> &CfgStats {
        &self.stats
    }

    pub fn distance(&self, bid: BranchId) -> usize {
        if bid < 0 {
            return INFINITE_DISTANCE;
        }
        self.dist
            .get(bid as usize)
            .copied()
            .unwrap_or(INFINITE_DISTANCE)
    }

    /// Backward BFS from every branch not covered in this pass.
    pub fn update_branch_distances(&mut self) {
        let mut queue = VecDeque::new();
        for &bid in self.base.table().branches() {
            if self.base.coverage().is_covered(bid) {
                self.dist[bid as usize] = INFINITE_DISTANCE;
            } else {
                self.dist[bid as usize] = 0;
                queue.push_back(bid);
            }
        }

        while let Some(bid) = queue.pop_front() {
            let next = self.dist[bid as usize] + 1;
            for &pred in self.cfg.predecessors(bid) {
                if next < self.dist[pred as usize] {
                    self.dist[pred as usize] = next;
                    queue.push_back(pred);
                }
            }
        }
    }

    fn do_search(
        &mut self,
        depth: usize,
        mut iters: usize,
        pos: usize,
        max_dist: usize,
        prev: &SymbolicExecution,
    ) -> Result<Option<SymbolicExecution>, Error> {
        let num_constraints = prev.path().constraints().len();
        debug!(depth, pos, max_dist, branches = prev.path().branches().len(), "cfg search");

        if pos >= num_constraints || depth == 0 {
            return Ok(None);
        }

        let mut idxs = (pos..num_constraints).collect::<Vec<_>>();
        idxs.shuffle(self.base.rng());

        let mut seen = HashMap::<BranchId, usize>::default();
        let scored = {
            let this = &*self;
            rank(idxs, |i| {
                let bid = this.base.flipped_branch(prev, i);
                let seen = seen.entry(bid).or_insert(0);
                let score = this.distance(bid) + *seen;
                *seen += 1;
                score
            })
        };

        for (i, score) in scored {
            if iters == 0 || score > max_dist {
                return Ok(None);
            }

            self.stats.inner_solves += 1;
            let input = match self.base.solve_at_branch(prev, i) {
                Some(input) => input,
                None => {
                    self.stats.inner_unsats += 1;
                    continue;
                }
            };

            let cur = self.base.run_program(&input)?;
            iters -= 1;

            let b_idx = prev.path().constraints_idx()[i];
            let bid_dist = self.distance(self.base.flipped_branch(prev, i));
            let mut new_branches = BTreeSet::new();
            let found = self.base.update_coverage(&cur, Some(&mut new_branches))?;
            let prediction_failed = !check_prediction(prev, &cur, b_idx);

            if found && prediction_failed {
                warn!(branch_idx = b_idx, "prediction failed");
                info!(distance = bid_dist, score, "found new branch by forcing, but prediction failed");
                self.stats.inner_lucky_successes += 1;
                self.stats.inner_successes_pred_fail += 1;
                return Ok(Some(cur));
            }

            if found {
                info!(distance = bid_dist, score, "found new branch by forcing");
                let path = cur.path().branches();
                let min_dist = min_cfl_distance(path, b_idx, &new_branches);
                debug!(min_dist, "closest new branch");

                if find_along_cfg(path, b_idx, bid_dist, &new_branches) {
                    if bid_dist == 0 {
                        self.stats.inner_zero_successes += 1;
                    } else {
                        self.stats.inner_nonzero_successes += 1;
                    }
                    return Ok(Some(cur));
                }
                // new coverage off the expected CFG path; still try to reach
                // the target along the CFG below
                self.stats.inner_lucky_successes += 1;
            }

            if prediction_failed {
                warn!(branch_idx = b_idx, "prediction failed");
                self.stats.inner_pred_fails += 1;
                continue;
            }

            self.stats.top_solves += 1;
            if bid_dist > 0 {
                if let Some(success) = self.solve_along_cfg(b_idx, score - 1, &cur)? {
                    self.stats.top_solve_successes += 1;
                    self.stats.log();
                    return Ok(Some(success));
                }
            }

            if found {
                return Ok(Some(cur));
            }
        }

        Ok(None)
    }

    /// Whether `bid`, and its paired branch, lie within `max_dist` of
    /// uncovered code.
    fn within(&self, bid: BranchId, max_dist: usize) -> (bool, bool) {
        (
            self.distance(bid) <= max_dist,
            self.distance(self.base.paired(bid)) <= max_dist,
        )
    }

    fn solve_along_cfg(
        &mut self,
        i: usize,
        max_dist: usize,
        prev: &SymbolicExecution,
    ) -> Result<Option<SymbolicExecution>, Error> {
        self.stats.solves += 1;
        debug!(i, max_dist, "solve along cfg");

        let path = prev.path().branches();
        let mut idxs = next_branches(path, i);

        let found_path = idxs.iter().any(|&j| {
            let (taken, paired) = self.within(path[j], max_dist);
            taken || paired
        });
        if !found_path {
            self.stats.solve_no_paths += 1;
            return Ok(None);
        }

        let mut all_concrete = true;
        self.stats.solve_all_concrete += 1;

        idxs.shuffle(self.base.rng());
        for j in idxs {
            let (taken, paired) = self.within(path[j], max_dist);
            if !taken && !paired {
                continue;
            }

            // already on a shortest path; no need to force
            if taken {
                if let Some(next_dist) = max_dist.checked_sub(1) {
                    self.stats.solve_recurses += 1;
                    if let Some(success) = self.solve_along_cfg(j, next_dist, prev)? {
                        self.stats.solve_successes += 1;
                        return Ok(Some(success));
                    }
                }
            }

            let c_idx = match prev.path().constraints_idx().binary_search(&j) {
                Ok(c_idx) => c_idx,
                Err(_) => continue,
            };

            if all_concrete {
                all_concrete = false;
                self.stats.solve_all_concrete -= 1;
            }

            if paired {
                self.stats.solve_sat_attempts += 1;
                let input = match self.base.solve_at_branch(prev, c_idx) {
                    Some(input) => input,
                    None => {
                        self.stats.solve_unsats += 1;
                        continue;
                    }
                };

                let cur = self.base.run_program(&input)?;
                if self.base.update_coverage(&cur, None)? {
                    self.stats.solve_successes += 1;
                    return Ok(Some(cur));
                }
                if !check_prediction(prev, &cur, j) {
                    self.stats.solve_pred_fails += 1;
                    continue;
                }

                if let Some(next_dist) = max_dist.checked_sub(1) {
                    self.stats.solve_recurses += 1;
                    if let Some(success) = self.solve_along_cfg(j, next_dist, &cur)? {
                        self.stats.solve_successes += 1;
                        return Ok(Some(success));
                    }
                }
            }
        }

        Ok(None)
    }
}

impl<T: Target, S: Solver> Search for CfgHeuristicSearch<T, S> {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            self.base.coverage_mut().reset_pass();

            debug!("reset");
            let mut ex = self.base.run_program(&[])?;
            if self.base.update_coverage(&ex, None)? {
                self.update_branch_distances();
            }

            while let Some(next) =
                self.do_search(HEURISTIC_DEPTH, HEURISTIC_ITERS, 0, INFINITE_DISTANCE, &ex)?
            {
                self.update_branch_distances();
                ex = next;
            }
            self.stats.log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: BranchId = CALL_BRANCH;
    const R: BranchId = RETURN_BRANCH;

    #[test]
    fn next_branches_skip_nested_calls() {
        // * ( ( ( 1 2 ) 4 ) ( 5 ( 6 7 ) ) 8 ) 9
        let path = [0, C, C, C, 1, 2, R, 4, R, C, 5, C, 6, 7, R, R, 8, R, 9];
        let idxs = next_branches(&path, 0);
        let bids = idxs.iter().map(|&i| path[i]).collect::<Vec<_>>();
        assert_eq!(bids, vec![1, 4, 5, 8, 9]);
    }

    #[test]
    fn next_branch_is_immediate_without_calls() {
        let path = [3, 5, 7];
        assert_eq!(next_branches(&path, 0), vec![1]);
        assert!(next_branches(&path, 2).is_empty());
    }

    #[test]
    fn cfl_distance_balances_calls() {
        let path = [3, C, 5, 7, R, 9, 11];
        let targets = [11].into_iter().collect::<BTreeSet<_>>();
        // the call body does not add to the distance once it returns
        assert_eq!(min_cfl_distance(&path, 0, &targets), 2);
        assert_eq!(min_cfl_distance(&path, 6, &targets), 0);
        assert_eq!(min_cfl_distance(&path, 7, &targets), usize::MAX);

        assert!(find_along_cfg(&path, 0, 2, &targets));
        assert!(!find_along_cfg(&path, 0, 1, &targets));
    }

    #[test]
    fn rank_is_stable() {
        let ranked = rank(vec![4, 2, 9, 7], |i| i % 2);
        assert_eq!(ranked, vec![(4, 0), (2, 0), (9, 1), (7, 1)]);
    }
}
