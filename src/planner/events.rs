//! Progress events streamed while a plan is applied.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::state::StackRef;

use super::plan::ActionType;

/// Sending half of a progress event stream.
pub type EventSender = mpsc::UnboundedSender<ProgressEvent>;

/// Receiving half of a progress event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Creates a progress event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A step in the application of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Execution of a plan started.
    PlanStarted {
        /// Stack being changed.
        stack: StackRef,
        /// Number of actions in the plan.
        actions: usize,
    },
    /// An action was handed to the provider.
    ActionStarted {
        /// Action index.
        index: usize,
        /// Action type.
        action: ActionType,
        /// Resource name.
        resource: String,
    },
    /// A provider call failed transiently and will be retried.
    ActionRetrying {
        /// Action index.
        index: usize,
        /// Resource name.
        resource: String,
        /// Attempt that failed.
        attempt: u32,
        /// The failure.
        error: String,
    },
    /// An action completed.
    ActionSucceeded {
        /// Action index.
        index: usize,
        /// Action type.
        action: ActionType,
        /// Resource name.
        resource: String,
        /// Wall time in milliseconds.
        elapsed_ms: u64,
    },
    /// An action failed for good.
    ActionFailed {
        /// Action index.
        index: usize,
        /// Action type.
        action: ActionType,
        /// Resource name.
        resource: String,
        /// The failure.
        error: String,
    },
    /// An action was not attempted because the plan stopped.
    ActionSkipped {
        /// Action index.
        index: usize,
        /// Action type.
        action: ActionType,
        /// Resource name.
        resource: String,
    },
    /// Execution of a plan finished.
    PlanFinished {
        /// Stack that was changed.
        stack: StackRef,
        /// Actions applied.
        applied: usize,
        /// Actions failed.
        failed: usize,
        /// Actions skipped.
        skipped: usize,
    },
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanStarted { stack, actions } => {
                write!(f, "Applying {actions} change(s) to {stack}")
            }
            Self::ActionStarted { action, resource, .. } => {
                write!(f, "  {resource}: {action} started")
            }
            Self::ActionRetrying {
                resource,
                attempt,
                error,
                ..
            } => write!(f, "  {resource}: attempt {attempt} failed ({error}), retrying"),
            Self::ActionSucceeded {
                action,
                resource,
                elapsed_ms,
                ..
            } => write!(f, "  {resource}: {action} complete ({elapsed_ms}ms)"),
            Self::ActionFailed {
                action,
                resource,
                error,
                ..
            } => write!(f, "  {resource}: {action} failed: {error}"),
            Self::ActionSkipped { action, resource, .. } => {
                write!(f, "  {resource}: {action} skipped")
            }
            Self::PlanFinished {
                stack,
                applied,
                failed,
                skipped,
            } => write!(
                f,
                "Finished {stack}: {applied} applied, {failed} failed, {skipped} skipped"
            ),
        }
    }
}
