//! Command-line interface for case-orchestrator.
//!
//! Provides commands for running workers, inspecting and replaying queued
//! tasks, processing alerts and running workflows.

mod commands;

pub use commands::{load_workflow, parse_cli, run, run_with_cli, Cli, Commands};
