//! CLI module for stackwright.
//!
//! This module provides the command-line interface for managing
//! stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, ProgramArgs, StateCommands};
pub use output::OutputFormatter;
