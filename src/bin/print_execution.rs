use std::io::{self, Write};
use std::process::ExitCode;

use crown_concolic::codec;
use crown_concolic::config::EXECUTION_FILE;
use crown_concolic::execution::SymbolicExecution;
use crown_concolic::path::{CALL_BRANCH, RETURN_BRANCH};

fn print<W: Write>(out: &mut W, ex: &SymbolicExecution) -> io::Result<()> {
    writeln!(out, "\nSymbolic variables & input values")?;
    for (var, value) in ex.vars().iter().zip(ex.inputs()) {
        if var.ty.is_float() {
            writeln!(out, "({} = {}) FP\t{}", var.name, value.floating, var.location)?;
        } else {
            writeln!(out, "({} = {})\t{}", var.name, value.integral, var.location)?;
        }
    }
    writeln!(out)?;

    writeln!(out, "Symbolic path for the input")?;
    let path = ex.path();
    for (constraint, location) in path.constraints().iter().zip(path.locations()) {
        writeln!(out, "{}\t{}", constraint, location)?;
    }
    writeln!(out)?;

    writeln!(out, "Sequence of reached branch ids")?;
    for &bid in path.branches() {
        match bid {
            CALL_BRANCH => writeln!(out, "{}\t[Function enters]", bid)?,
            RETURN_BRANCH => writeln!(out, "{}\t[Function exits]", bid)?,
            _ => writeln!(out, "{}", bid)?,
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let ex = match codec::read_execution_file(EXECUTION_FILE) {
        Ok(ex) => ex,
        Err(e) => {
            eprintln!("cannot read {}: {}", EXECUTION_FILE, e);
            return ExitCode::FAILURE;
        }
    };

    let stdout = io::stdout();
    match print(&mut stdout.lock(), &ex) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
