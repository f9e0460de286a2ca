//! Command-line interface for sweepq.
//!
//! Provides commands for producing a job, running workers, sweeping stale
//! stream entries, aggregating results and inspecting channels.

mod commands;

pub use commands::{exit_code_for, parse_cli, run, run_with_cli};
