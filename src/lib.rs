// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![cfg_attr(not(test), deny(missing_docs))] // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! A stack lifecycle engine for declared infrastructure resource graphs.
//!
//! ## Overview
//!
//! A *program* declares named resources with typed properties and
//! dependency references. Stackwright deploys that program into a named
//! *stack* and keeps it converged:
//!
//! - Create, update and destroy stacks independently of each other
//! - Compute a plan by diffing the program against the recorded state
//! - Apply the plan in dependency order, with retries for transient failures
//! - Persist state after every applied resource, locally or in S3
//!
//! ## Architecture
//!
//! 1. **Program**: declared resources and exports, validated into a graph
//! 2. **State**: the last known result of applying a program to a stack
//! 3. **Coordinator**: locks the stack, plans, executes and persists
//!
//! ## Modules
//!
//! - [`program`]: Resource declarations, dependency graph and hashing
//! - [`state`]: State storage backends (local, S3) and stack locks
//! - [`planner`]: Diff computation, operation plans and execution
//! - [`provider`]: Provider trait, retries and the Kubernetes provider
//! - [`coordinator`]: Stack lifecycle operations
//! - [`config`]: Configuration parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stackwright::coordinator::LifecycleCoordinator;
//! use stackwright::program::kubernetes::{deployment_program, DeploymentArgs};
//! use stackwright::provider::{KubernetesProvider, KubernetesProviderConfig};
//! use stackwright::state::{LocalStateStore, StackRef};
//!
//! # async fn example() -> stackwright::Result<()> {
//! let store = Arc::new(LocalStateStore::new()?);
//! let provider = Arc::new(KubernetesProvider::new(KubernetesProviderConfig::default())?);
//! let coordinator = LifecycleCoordinator::new(store, provider);
//!
//! let stack = StackRef::new("shop", "dev");
//! let outputs = coordinator
//!     .create(&stack, &deployment_program(&DeploymentArgs::nginx(5)))
//!     .await?;
//! assert!(outputs.values.contains_key("name"));
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod planner;
pub mod program;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, StackwrightConfig};
pub use coordinator::{ExecutionOptions, LifecycleCoordinator, StackOutputs};
pub use error::{LifecycleError, Result, StackwrightError};
pub use planner::{DiffEngine, OperationPlan, PlanExecutor};
pub use program::{Program, ResourceGraph};
pub use provider::{KubernetesProvider, ResourceProvider};
pub use state::{LocalStateStore, S3StateStore, StackRef, StackState, StateStore};
