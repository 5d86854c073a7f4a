use std::collections::BTreeSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::path::BranchId;

use super::branches::BranchTable;
use super::Error;

/// Branch coverage of the current pass plus coverage over the whole run.
///
/// Strategies that restart (the CFG heuristic) clear the per-pass bitset
/// with [`Coverage::reset_pass`]; the run totals and function reachability
/// survive.
#[derive(Debug, Clone)]
pub struct Coverage {
    covered: Vec<bool>,
    total_covered: Vec<bool>,
    num_covered: usize,
    total_num_covered: usize,
    reached: Vec<bool>,
    reachable_functions: usize,
    reachable_branches: usize,
}

impl Coverage {
    pub fn new(table: &BranchTable) -> Self {
        Self {
            covered: vec![false; table.max_branch()],
            total_covered: vec![false; table.max_branch()],
            num_covered: 0,
            total_num_covered: 0,
            reached: vec![false; table.num_functions()],
            reachable_functions: 0,
            reachable_branches: 0,
        }
    }

    pub fn is_covered(&self, bid: BranchId) -> bool {
        bid >= 0 && self.covered.get(bid as usize).copied().unwrap_or(false)
    }

    pub fn num_covered(&self) -> usize {
        self.num_covered
    }

    pub fn total_num_covered(&self) -> usize {
        self.total_num_covered
    }

    pub fn reachable_functions(&self) -> usize {
        self.reachable_functions
    }

    pub fn reachable_branches(&self) -> usize {
        self.reachable_branches
    }

    pub fn reset_pass(&mut self) {
        self.covered.iter_mut().for_each(|c| *c = false);
        self.num_covered = 0;
    }

    /// Mark every positive branch id of `branches`; returns whether the
    /// pass coverage grew. Newly covered ids are added to `new_branches`.
    pub fn update(
        &mut self,
        table: &BranchTable,
        branches: &[BranchId],
        mut new_branches: Option<&mut BTreeSet<BranchId>>,
    ) -> bool {
        let before = self.num_covered;

        for &bid in branches.iter().filter(|&&bid| bid > 0) {
            let idx = bid as usize;
            if idx >= self.covered.len() {
                tracing::warn!("branch {} is not in the branch table", bid);
                continue;
            }

            if !self.covered[idx] {
                self.covered[idx] = true;
                self.num_covered += 1;
                if let Some(new_branches) = new_branches.as_deref_mut() {
                    new_branches.insert(bid);
                }

                let fid = table.function_of(bid);
                if !self.reached[fid] {
                    self.reached[fid] = true;
                    self.reachable_functions += 1;
                    self.reachable_branches += table.branch_count(fid);
                }
            }

            if !self.total_covered[idx] {
                self.total_covered[idx] = true;
                self.total_num_covered += 1;
            }
        }

        self.num_covered > before
    }

    /// Write every branch covered during the run, one id per line.
    pub fn write_file<P: AsRef<Path>>(&self, path: P, table: &BranchTable) -> Result<(), Error> {
        let path = path.as_ref();
        let io_error = |source| Error::Io {
            path: path.to_owned(),
            source,
        };

        let mut ids = table
            .branches()
            .iter()
            .copied()
            .filter(|&bid| self.total_covered[bid as usize])
            .collect::<Vec<_>>();
        ids.sort_unstable();

        let mut out = BufWriter::new(fs::File::create(path).map_err(io_error)?);
        for bid in ids {
            writeln!(out, "{}", bid).map_err(io_error)?;
        }
        out.flush().map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_counts_whole_functions() {
        let table = BranchTable::parse("1 1\n3 4\n2 2\n5 6\n7 8\n").unwrap();
        let mut coverage = Coverage::new(&table);
        let mut fresh = BTreeSet::new();

        assert!(coverage.update(&table, &[-1, 3, -2, 0], Some(&mut fresh)));
        assert_eq!(fresh.into_iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(coverage.reachable_functions(), 1);
        assert_eq!(coverage.reachable_branches(), 2);

        assert!(!coverage.update(&table, &[3], None));
        assert!(coverage.update(&table, &[3, 5, 8], None));
        assert_eq!(coverage.num_covered(), 3);
        assert_eq!(coverage.reachable_functions(), 2);
        assert_eq!(coverage.reachable_branches(), 6);

        coverage.reset_pass();
        assert_eq!(coverage.num_covered(), 0);
        assert_eq!(coverage.total_num_covered(), 3);
        assert!(coverage.update(&table, &[3], None));
        assert_eq!(coverage.total_num_covered(), 3);
    }
}
