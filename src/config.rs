use std::env;
use std::path::{Path, PathBuf};

pub const INPUT_FILE: &str = "input";
pub const EXECUTION_FILE: &str = "szd_execution";
pub const COVERAGE_FILE: &str = "coverage";
pub const BRANCHES_FILE: &str = "branches";
pub const CFG_FILE: &str = "cfg_branches";

pub const DFS_DEFAULT_DEPTH: usize = 1_000_000;
pub const UNIFORM_RANDOM_DEFAULT_DEPTH: usize = 100_000_000;

/// Settings shared by every search strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    /// Shell command that runs the instrumented target.
    pub program: String,
    pub max_iterations: usize,
    pub work_dir: PathBuf,
    /// Where `branches` and `cfg_branches` live; the work directory if unset.
    pub info_dir: Option<PathBuf>,
    /// Every generated input is also saved here as `input.<n>`.
    pub testcase_dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub max_depth: Option<usize>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            max_iterations: 0,
            work_dir: PathBuf::from("."),
            info_dir: None,
            testcase_dir: None,
            seed: None,
            max_depth: None,
        }
    }
}

impl SearchConfig {
    pub fn new<S: Into<String>>(program: S, max_iterations: usize) -> Self {
        Self {
            program: program.into(),
            max_iterations,
            ..Self::default()
        }
    }

    /// Pick up `INFODIR` and `CROWN_SEED` from the environment.
    pub fn from_env<S: Into<String>>(program: S, max_iterations: usize) -> Self {
        let mut config = Self::new(program, max_iterations);
        config.info_dir = env::var_os("INFODIR").map(PathBuf::from);
        config.seed = env::var("CROWN_SEED").ok().and_then(|s| s.parse().ok());
        config
    }

    pub fn with_work_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_info_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.info_dir = Some(dir.into());
        self
    }

    pub fn with_testcase_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.testcase_dir = Some(dir.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    fn info_dir(&self) -> &Path {
        self.info_dir.as_deref().unwrap_or(&self.work_dir)
    }

    pub fn input_path(&self) -> PathBuf {
        self.work_dir.join(INPUT_FILE)
    }

    pub fn execution_path(&self) -> PathBuf {
        self.work_dir.join(EXECUTION_FILE)
    }

    pub fn coverage_path(&self) -> PathBuf {
        self.work_dir.join(COVERAGE_FILE)
    }

    pub fn branches_path(&self) -> PathBuf {
        self.info_dir().join(BRANCHES_FILE)
    }

    pub fn cfg_path(&self) -> PathBuf {
        self.info_dir().join(CFG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_directories() {
        let config = SearchConfig::new("./a.out", 10).with_work_dir("/tmp/run");
        assert_eq!(config.input_path(), PathBuf::from("/tmp/run/input"));
        assert_eq!(config.branches_path(), PathBuf::from("/tmp/run/branches"));

        let config = config.with_info_dir("/opt/info");
        assert_eq!(config.cfg_path(), PathBuf::from("/opt/info/cfg_branches"));
        assert_eq!(config.coverage_path(), PathBuf::from("/tmp/run/coverage"));
    }
}
