//! Command-line interface for refactor-forge.
//!
//! Provides the `run` and `plan` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, PlanArgs, RunArgs};
