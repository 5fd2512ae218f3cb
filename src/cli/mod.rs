//! Command-line interface for roleplay-forge.
//!
//! One subcommand per pipeline stage, plus plan scaffolding.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
