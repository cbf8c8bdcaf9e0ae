//! Command-line interface for abstract-pool.
//!
//! Provides the pool supervisor and worker entry points, job submission,
//! and direct access to the abstracts index.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
