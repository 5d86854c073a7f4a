//! Concolic search: run the target, track branch coverage, and decide which
//! path constraint to negate next.
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::codec;
use crate::config::{self, SearchConfig};
use crate::execution::{InputVar, SymbolicExecution};
use crate::expr::{SymExpr, UnaryOp};
use crate::input;
use crate::path::BranchId;
use crate::solver::Solver;
use crate::stats::PathStats;
use crate::value::{CType, Value};

mod branches;
mod cfg;
mod coverage;
mod dfs;
mod hybrid;
mod random;

pub use self::branches::{BranchTable, CfgTable};
pub use self::cfg::{CfgBaselineSearch, CfgHeuristicSearch, CfgStats, INFINITE_DISTANCE};
pub use self::coverage::Coverage;
pub use self::dfs::BoundedDepthFirstSearch;
pub use self::hybrid::HybridSearch;
pub use self::random::{RandomInputSearch, RandomSearch, UniformRandomSearch};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot access `{}`: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("cannot read execution trace: {0}")]
    Parse(#[from] codec::Error),
    #[error("cannot write input file: {0}")]
    Input(#[from] input::Error),
    #[error("malformed branch table: {0}")]
    BranchTable(String),
    #[error("malformed CFG: {0}")]
    CfgTable(String),
    #[error("cannot launch `{command}`: {source}")]
    Launch { command: String, source: io::Error },
    #[error("iteration limit reached")]
    IterationLimit,
}

/// Something that runs the program under test on concrete inputs and
/// reports the symbolic execution it recorded.
pub trait Target {
    fn execute(&mut self, inputs: &[Value]) -> Result<SymbolicExecution, Error>;
}

impl<F> Target for F
where
    F: FnMut(&[Value]) -> Result<SymbolicExecution, Error>,
{
    fn execute(&mut self, inputs: &[Value]) -> Result<SymbolicExecution, Error> {
        self(inputs)
    }
}

/// An instrumented binary run through `sh -c`, talking to us through the
/// `input` and `szd_execution` files in its working directory.
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    command: String,
    work_dir: PathBuf,
    input_path: PathBuf,
    execution_path: PathBuf,
}

impl ProcessTarget {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            command: config.program.clone(),
            work_dir: config.work_dir.clone(),
            input_path: config.input_path(),
            execution_path: config.execution_path(),
        }
    }
}

impl Target for ProcessTarget {
    fn execute(&mut self, inputs: &[Value]) -> Result<SymbolicExecution, Error> {
        input::write_inputs_file(&self.input_path, inputs, &[])?;

        // a crashed run must not be mistaken for the previous one
        match fs::remove_file(&self.execution_path) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(source) => {
                return Err(Error::Io {
                    path: self.execution_path.clone(),
                    source,
                })
            }
        }

        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.work_dir)
            .status()
            .map_err(|source| Error::Launch {
                command: self.command.clone(),
                source,
            })?;

        if !status.success() {
            debug!(%status, "target exited abnormally");
        }

        Ok(codec::read_execution_file(&self.execution_path)?)
    }
}

pub trait Search {
    /// Search until the strategy gives up or the iteration budget runs out;
    /// the latter surfaces as [`Error::IterationLimit`].
    fn run(&mut self) -> Result<(), Error>;
}

/// State shared by every strategy.
pub struct SearchBase<T, S> {
    config: SearchConfig,
    table: BranchTable,
    coverage: Coverage,
    target: T,
    solver: S,
    rng: SmallRng,
    num_iters: usize,
    stats: PathStats,
    testcase_dir_ready: Option<bool>,
    start: Instant,
}

impl<T: Target, S: Solver> SearchBase<T, S> {
    pub fn new(config: SearchConfig, table: BranchTable, target: T, solver: S) -> Self {
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            coverage: Coverage::new(&table),
            config,
            table,
            target,
            solver,
            rng,
            num_iters: 0,
            stats: PathStats::default(),
            testcase_dir_ready: None,
            start: Instant::now(),
        }
    }

    /// Load the branch table named by `config`.
    pub fn from_config(config: SearchConfig, target: T, solver: S) -> Result<Self, Error> {
        let table = BranchTable::from_file(config.branches_path())?;
        Ok(Self::new(config, table, target, solver))
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn table(&self) -> &BranchTable {
        &self.table
    }

    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    pub fn coverage_mut(&mut self) -> &mut Coverage {
        &mut self.coverage
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    pub fn num_iters(&self) -> usize {
        self.num_iters
    }

    pub fn stats(&self) -> &PathStats {
        &self.stats
    }

    pub fn paired(&self, bid: BranchId) -> BranchId {
        self.table.paired(bid)
    }

    /// The branch taken by the opposite outcome of constraint `i` of `ex`.
    pub fn flipped_branch(&self, ex: &SymbolicExecution, i: usize) -> BranchId {
        let path = ex.path();
        self.paired(path.branches()[path.constraints_idx()[i]])
    }

    pub fn run_program(&mut self, inputs: &[Value]) -> Result<SymbolicExecution, Error> {
        self.num_iters += 1;
        if self.num_iters > self.config.max_iterations {
            info!(
                iterations = self.config.max_iterations,
                symbolic = %self.stats.symbolic,
                concrete = %self.stats.concrete,
                "iteration limit reached"
            );
            return Err(Error::IterationLimit);
        }

        debug!(iteration = self.num_iters, inputs = inputs.len(), "running target");
        let ex = self.target.execute(inputs)?;
        self.stats
            .record(ex.path().constraints().len(), ex.path().branches().len());
        self.save_testcase(&ex)?;

        Ok(ex)
    }

    fn save_testcase(&mut self, ex: &SymbolicExecution) -> Result<(), Error> {
        let dir = match &self.config.testcase_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };

        // an existing directory is left alone
        let ready = *self
            .testcase_dir_ready
            .get_or_insert_with(|| match fs::create_dir(dir) {
                Ok(()) => true,
                Err(e) => {
                    error!(dir = %dir.display(), "cannot create testcase directory: {}", e);
                    false
                }
            });

        if ready {
            let path = dir.join(format!("{}.{}", config::INPUT_FILE, self.num_iters));
            input::write_inputs_file(path, ex.inputs(), ex.vars())?;
        }
        Ok(())
    }

    pub fn update_coverage(
        &mut self,
        ex: &SymbolicExecution,
        new_branches: Option<&mut BTreeSet<BranchId>>,
    ) -> Result<bool, Error> {
        let found = self
            .coverage
            .update(&self.table, ex.path().branches(), new_branches);

        info!(
            iteration = self.num_iters,
            elapsed = self.start.elapsed().as_secs(),
            covered = self.coverage.num_covered(),
            total = self.coverage.total_num_covered(),
            reachable_functions = self.coverage.reachable_functions(),
            reachable_branches = self.coverage.reachable_branches(),
            "coverage"
        );

        if found {
            let path = self.config.coverage_path();
            self.coverage.write_file(&path, &self.table)?;
            info!(path = %path.display(), "wrote coverage");
        }

        Ok(found)
    }

    /// Inputs driving `ex` down the opposite side of constraint `i`, keeping
    /// constraints `0..i` as they were.
    pub fn solve_at_branch(&mut self, ex: &SymbolicExecution, i: usize) -> Option<Vec<Value>> {
        let constraints = ex.path().constraints();
        let target = constraints.get(i)?;

        let v = target.value();
        let flipped = Value::new(1i64.wrapping_sub(v.integral), 1.0 - v.floating, v.ty);
        let mut cs = constraints[..i].to_vec();
        cs.push(SymExpr::unary(flipped, UnaryOp::LogicalNot, target.clone()));

        match self.solver.solve(ex, &cs) {
            Ok(Some(soln)) => {
                let mut input = ex.inputs().to_vec();
                for (idx, value) in soln {
                    if let Some(slot) = input.get_mut(idx) {
                        *slot = value;
                    }
                }
                Some(input)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(constraint = i, "cannot solve: {}", e);
                None
            }
        }
    }

    pub fn random_input(&mut self, vars: &[InputVar]) -> Vec<Value> {
        vars.iter()
            .map(|var| random_value(&mut self.rng, var.ty))
            .collect()
    }
}

/// Eight random bytes narrowed to `ty`. Floats are random finite bit
/// patterns of their own width, matching what the solver may produce.
fn random_value<R: Rng>(rng: &mut R, ty: CType) -> Value {
    match ty {
        CType::Float => loop {
            let f = f32::from_bits(rng.gen());
            if f.is_finite() {
                break Value::floating(f as f64, ty);
            }
        },
        CType::Double | CType::LongDouble => loop {
            let d = f64::from_bits(rng.gen());
            if d.is_finite() {
                break Value::floating(d, ty);
            }
        },
        _ => random_integral(rng.gen(), ty),
    }
}

fn random_integral(bits: u64, ty: CType) -> Value {
    match ty {
        CType::Boolean => Value::integral(bits as u8 as i64, ty),
        _ if ty.is_integral() => Value::integral(ty.cast_integral(bits as i64), ty),
        _ => Value::integral(bits as u8 as i64, ty),
    }
}

/// Whether `new` retraced `old` up to `branch_idx` and then went the other way.
pub fn check_prediction(old: &SymbolicExecution, new: &SymbolicExecution, branch_idx: usize) -> bool {
    let old = old.path().branches();
    let new = new.path().branches();

    if old.len() <= branch_idx || new.len() <= branch_idx {
        return false;
    }
    old[..branch_idx] == new[..branch_idx] && old[branch_idx] != new[branch_idx]
}

/// Pick (and remove) a random element of `idxs`.
fn take_random<R: Rng>(rng: &mut R, idxs: &mut Vec<usize>) -> Option<usize> {
    if idxs.is_empty() {
        None
    } else {
        let r = rng.gen_range(0..idxs.len());
        Some(idxs.swap_remove(r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Random,
    RandomInput,
    Dfs,
    UniformRandom,
    Hybrid,
    Cfg,
    CfgBaseline,
}

impl Strategy {
    pub const ALL: [Strategy; 7] = [
        Self::Random,
        Self::RandomInput,
        Self::Dfs,
        Self::UniformRandom,
        Self::Hybrid,
        Self::Cfg,
        Self::CfgBaseline,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RandomInput => "random_input",
            Self::Dfs => "dfs",
            Self::UniformRandom => "uniform_random",
            Self::Hybrid => "hybrid",
            Self::Cfg => "cfg",
            Self::CfgBaseline => "cfg_baseline",
        }
    }

    /// Depth used when none is given; `None` for strategies without one.
    pub fn default_depth(self) -> Option<usize> {
        match self {
            Self::Dfs => Some(config::DFS_DEFAULT_DEPTH),
            Self::UniformRandom => Some(config::UNIFORM_RANDOM_DEFAULT_DEPTH),
            _ => None,
        }
    }

    pub fn takes_depth(self) -> bool {
        self.default_depth().is_some()
    }

    pub fn build<T, S>(self, base: SearchBase<T, S>) -> Result<Box<dyn Search>, Error>
    where
        T: Target + 'static,
        S: Solver + 'static,
    {
        let depth = base
            .config()
            .max_depth
            .or_else(|| self.default_depth())
            .unwrap_or(0);

        Ok(match self {
            Self::Random => Box::new(RandomSearch::new(base)),
            Self::RandomInput => Box::new(RandomInputSearch::new(base)),
            Self::Dfs => Box::new(BoundedDepthFirstSearch::new(base, depth)),
            Self::UniformRandom => Box::new(UniformRandomSearch::new(base, depth)),
            Self::Hybrid => Box::new(HybridSearch::new(base)),
            Self::Cfg => Box::new(CfgHeuristicSearch::from_config(base)?),
            Self::CfgBaseline => Box::new(CfgBaselineSearch::new(base)),
        })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix('-').unwrap_or(s);
        Self::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.name() == name)
            .ok_or_else(|| format!("unknown search strategy `{}`", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::SymbolicPath;

    fn with_branches(branches: Vec<BranchId>) -> SymbolicExecution {
        SymbolicExecution::from_parts(
            Vec::new(),
            Vec::new(),
            Default::default(),
            SymbolicPath::from_parts(branches, Vec::new(), Vec::new(), Vec::new()),
        )
    }

    #[test]
    fn prediction_requires_divergence_at_index() {
        let old = with_branches(vec![-1, 3, 5, -2]);
        assert!(check_prediction(&old, &with_branches(vec![-1, 3, 6]), 2));
        assert!(!check_prediction(&old, &with_branches(vec![-1, 3, 5, -2]), 2));
        assert!(!check_prediction(&old, &with_branches(vec![-1, 4, 6]), 2));
        assert!(!check_prediction(&old, &with_branches(vec![-1, 3]), 2));
    }

    #[test]
    fn strategy_names() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.name().parse::<Strategy>(), Ok(strategy));
            assert_eq!(format!("-{}", strategy).parse::<Strategy>(), Ok(strategy));
        }
        assert!("bfs".parse::<Strategy>().is_err());
        assert!(Strategy::Dfs.takes_depth());
        assert!(!Strategy::Cfg.takes_depth());
    }

    #[test]
    fn random_values_fit_their_type() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..64 {
            let c = random_value(&mut rng, CType::Char);
            assert!((-128..128).contains(&c.integral));
            let u = random_value(&mut rng, CType::UShort);
            assert!((0..=0xffff).contains(&u.integral));
            let p = random_value(&mut rng, CType::Pointer);
            assert!((0..256).contains(&p.integral));
        }
    }

    #[test]
    fn random_floats_are_finite_and_spread() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut normal = 0;
        for _ in 0..64 {
            let f = random_value(&mut rng, CType::Float).floating;
            assert!(f.is_finite());
            assert_eq!(f as f32 as f64, f);
            if (1e-30..1e30).contains(&f.abs()) {
                normal += 1;
            }

            let d = random_value(&mut rng, CType::Double).floating;
            assert!(d.is_finite());
        }
        assert!(normal > 0);
    }
}
