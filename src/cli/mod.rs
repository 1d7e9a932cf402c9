//! Command-line interface for itextmine.
//!
//! Provides the `run`, `split`, `reduce` and `cleanup` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
