//! Command-line interface for mlops-forge.
//!
//! Runs the coordinator once or continuously, and exposes read-only `plan`
//! and `history` views.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, OutputArgs};
