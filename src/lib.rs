pub mod codec;
pub mod config;
pub mod execution;
pub mod expr;
pub mod input;
pub mod interpreter;
pub mod memory;
pub mod object;
pub mod path;
pub mod runtime;
pub mod search;
pub mod solver;
pub mod stats;
pub mod value;
