//! Command-line interface for condforge.
//!
//! Provides commands for executing experiment batches, planning dry runs,
//! and rebuilding reports from persisted results.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
