//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::program::kubernetes::DEFAULT_REPLICAS;

/// Stackwright - stack lifecycle manager for declared resource graphs.
#[derive(Parser, Debug)]
#[command(name = "stackwright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Project name.
    #[arg(short, long, global = true, env = "PROJECT_NAME")]
    pub project: Option<String>,

    /// Stack name.
    #[arg(short, long, global = true, env = "STACK_NAME")]
    pub stack: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Where the program to deploy comes from.
#[derive(Args, Debug, Clone)]
pub struct ProgramArgs {
    /// Program file (YAML). Defaults to the built-in nginx Deployment.
    #[arg(long)]
    pub program: Option<PathBuf>,

    /// Replica count of the built-in nginx Deployment.
    #[arg(long, default_value_t = DEFAULT_REPLICAS)]
    pub replicas: u32,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new stack and deploy the program into it.
    Create {
        /// Program selection.
        #[command(flatten)]
        program: ProgramArgs,
    },

    /// Deploy the program into an existing stack.
    Update {
        /// Program selection.
        #[command(flatten)]
        program: ProgramArgs,
    },

    /// Create the stack if needed, then deploy the program into it.
    Up {
        /// Program selection.
        #[command(flatten)]
        program: ProgramArgs,
    },

    /// Show the changes an update would make.
    Preview {
        /// Program selection.
        #[command(flatten)]
        program: ProgramArgs,

        /// Show property-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Delete every resource of the stack and remove it.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the stack outputs.
    Outputs,

    /// List the stacks of the project.
    List,

    /// Validate the configuration and program.
    Validate {
        /// Program selection.
        #[command(flatten)]
        program: ProgramArgs,

        /// Show warnings.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Manage recorded stack state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the recorded state of the stack.
    Show,

    /// Release the stack lock.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_with_replicas() {
        let cli = Cli::try_parse_from([
            "stackwright",
            "--project",
            "shop",
            "--stack",
            "dev",
            "update",
            "--replicas",
            "10",
        ])
        .unwrap();

        assert_eq!(cli.project.as_deref(), Some("shop"));
        assert_eq!(cli.stack.as_deref(), Some("dev"));
        let Commands::Update { program } = cli.command else {
            panic!("expected update");
        };
        assert_eq!(program.replicas, 10);
        assert!(program.program.is_none());
    }

    #[test]
    fn test_default_replicas() {
        let cli = Cli::try_parse_from(["stackwright", "create", "--output", "json"]);
        // --output is global and may follow the subcommand.
        let cli = cli.unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        let Commands::Create { program } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(program.replicas, DEFAULT_REPLICAS);
    }

    #[test]
    fn test_state_unlock() {
        let cli = Cli::try_parse_from(["stackwright", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true, lock_id: None }
            }
        ));
    }
}
