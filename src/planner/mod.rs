//! Planning module for stack operations.
//!
//! This module handles the comparison between declared and recorded states,
//! generating operation plans and applying them against a provider.

mod diff;
pub mod events;
mod executor;
mod plan;

pub use diff::{property_changes, DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use events::{EventReceiver, EventSender, ProgressEvent};
pub use executor::{ActionResult, ActionStatus, ExecutionResult, PlanExecutor};
pub use plan::{ActionType, OperationPlan, PlannedAction};
