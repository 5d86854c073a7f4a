use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crown_concolic::config::SearchConfig;
use crown_concolic::search::{Error, ProcessTarget, SearchBase, Strategy};
use crown_concolic::solver::Z3Solver;

const USAGE: &str = "run_crown '<target args>' <num-iter> -<strategy> [<max-depth>] [-TCDIR <path>]

<strategy> is one of random, random_input, cfg, cfg_baseline, hybrid,
dfs [<max-depth>] or uniform_random [<max-depth>].";

#[derive(Parser)]
#[command(name = "run_crown", override_usage = USAGE)]
struct Args {
    /// Shell command running the instrumented target
    program: String,

    /// Number of target executions
    #[arg(value_parser = positive)]
    iterations: usize,

    /// `-<strategy> [<max-depth>] [-TCDIR <path>]`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    search: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct SearchArgs {
    strategy: Strategy,
    max_depth: Option<usize>,
    testcase_dir: Option<PathBuf>,
}

fn positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 && s.bytes().all(|b| b.is_ascii_digit()) => Ok(n),
        _ => Err(format!("`{}` should be a positive integer", s)),
    }
}

fn parse_search(args: &[String]) -> Result<SearchArgs, String> {
    let (strategy, rest) = match args.split_first() {
        Some((s, rest)) if s.starts_with('-') => (s.parse::<Strategy>()?, rest),
        Some((s, _)) => return Err(format!("invalid search strategy `{}`", s)),
        None => return Err("missing search strategy".to_owned()),
    };

    let mut rest = rest.iter().map(String::as_str).peekable();
    let mut max_depth = None;
    if strategy.takes_depth() {
        if let Some(arg) = rest.next_if(|arg| *arg != "-TCDIR") {
            max_depth = Some(positive(arg)?);
        }
    }

    let testcase_dir = match rest.next() {
        None => None,
        Some("-TCDIR") => match rest.next() {
            Some(dir) => Some(PathBuf::from(dir)),
            None => return Err("<path> is missing".to_owned()),
        },
        Some(arg) => return Err(format!("the argument `{}` is not a valid one", arg)),
    };

    if let Some(arg) = rest.next() {
        return Err(format!("the argument `{}` is not a valid one", arg));
    }

    Ok(SearchArgs {
        strategy,
        max_depth,
        testcase_dir,
    })
}

fn usage_error(msg: &str) -> ExitCode {
    eprintln!("Usage: {}\n\n{}", USAGE, msg);
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let search = match parse_search(&args.search) {
        Ok(search) => search,
        Err(msg) => return usage_error(&msg),
    };

    let mut config = SearchConfig::from_env(args.program, args.iterations);
    config.max_depth = search.max_depth;
    config.testcase_dir = search.testcase_dir;

    info!(strategy = %search.strategy, iterations = config.max_iterations, "starting search");

    let target = ProcessTarget::new(&config);
    let result = SearchBase::from_config(config, target, Z3Solver::new())
        .and_then(|base| search.strategy.build(base))
        .and_then(|mut strategy| strategy.run());

    match result {
        Ok(()) | Err(Error::IterationLimit) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_owned).collect()
    }

    #[test]
    fn depth_and_testcase_dir() {
        let parsed = parse_search(&args("-dfs 10 -TCDIR tc")).unwrap();
        assert_eq!(parsed.strategy, Strategy::Dfs);
        assert_eq!(parsed.max_depth, Some(10));
        assert_eq!(parsed.testcase_dir, Some(PathBuf::from("tc")));

        let parsed = parse_search(&args("-uniform_random -TCDIR tc")).unwrap();
        assert_eq!(parsed.max_depth, None);
        assert_eq!(parsed.testcase_dir, Some(PathBuf::from("tc")));

        let parsed = parse_search(&args("-cfg")).unwrap();
        assert_eq!(parsed.strategy, Strategy::Cfg);
        assert_eq!(parsed.testcase_dir, None);
    }

    #[test]
    fn malformed_search_arguments() {
        assert!(parse_search(&args("-cfg 10")).is_err());
        assert!(parse_search(&args("-dfs 0")).is_err());
        assert!(parse_search(&args("-dfs 3.14")).is_err());
        assert!(parse_search(&args("-dfs -TCDIR")).is_err());
        assert!(parse_search(&args("-dfs 5 -TCDIR a b")).is_err());
        assert!(parse_search(&args("-bfs")).is_err());
        assert!(parse_search(&args("dfs")).is_err());
    }

    #[test]
    fn positive_integers() {
        assert_eq!(positive("12"), Ok(12));
        assert!(positive("0").is_err());
        assert!(positive("+3").is_err());
        assert!(positive("").is_err());
    }
}
