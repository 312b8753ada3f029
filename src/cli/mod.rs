//! Command-line interface for lora-forge.
//!
//! Provides commands for preparing datasets, generating training
//! configurations in single, batch and variation modes, planning runs,
//! launching training, and inspecting presets and jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
