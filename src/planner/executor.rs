//! Plan executor for applying operation plans.
//!
//! Actions run as soon as the actions they depend on have succeeded, up to
//! `max_parallel` at a time, lowest plan index first. The first failure
//! stops scheduling: actions already running finish, the rest are skipped.
//! Every success is written to the stack state and checkpointed right away,
//! so nothing that was applied is lost if a later action fails or the
//! execution is cancelled. A replace runs as two steps with a checkpoint in
//! between, so the state never records an object that was already deleted.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ProviderError, Result, StackwrightError};
use crate::provider::{ProviderResponse, ResourceProvider, ResourceRequest, RetryPolicy};
use crate::state::{ResourceState, StackState, StateStore};

use super::events::{EventSender, ProgressEvent};
use super::plan::{ActionType, OperationPlan, PlannedAction};

/// Executor for operation plans.
#[derive(Clone)]
pub struct PlanExecutor {
    /// Resource provider.
    provider: Arc<dyn ResourceProvider>,
    /// Retry policy of provider calls.
    retry: RetryPolicy,
    /// Maximum number of concurrently running actions.
    max_parallel: usize,
    /// Progress event stream.
    events: Option<EventSender>,
}

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// The provider call succeeded and the state was updated.
    Succeeded,
    /// The provider call failed.
    Failed,
    /// The action was never attempted.
    Skipped,
}

/// Result of executing a single action.
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Action index.
    pub index: usize,
    /// Action type.
    pub action_type: ActionType,
    /// Resource name.
    pub resource_name: String,
    /// How the action ended.
    pub status: ActionStatus,
    /// Provider id after the action (if any).
    pub provider_id: Option<String>,
    /// Failure (if failed).
    pub error: Option<ProviderError>,
    /// Wall time of the action.
    pub elapsed: Duration,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Individual action results, by plan index.
    pub results: Vec<ActionResult>,
    /// Number of applied actions.
    pub applied: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions.
    pub skipped: usize,
    /// The failure that stopped the plan.
    pub failure: Option<ProviderError>,
}

/// What a provider call produced.
#[derive(Debug)]
enum Outcome {
    Applied(ProviderResponse),
    Deleted,
    /// The delete half of a replace succeeded.
    OldRemoved,
}

/// Which provider calls of an action a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    /// The create half of a replace.
    Recreate,
}

type TaskOutput = (usize, std::result::Result<Outcome, ProviderError>, Duration);

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("retry", &self.retry)
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates a new plan executor that applies one action at a time.
    #[must_use]
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            max_parallel: 1,
            events: None,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum number of concurrently running actions.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Streams progress events to the given sender.
    #[must_use]
    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        self.events = events;
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = events.send(event);
        }
    }

    /// Executes an operation plan against `state`.
    ///
    /// Provider failures do not make this return an error: they are reported
    /// in [`ExecutionResult::failure`] with `state` holding everything that
    /// was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan is malformed or a checkpoint cannot be
    /// saved.
    pub async fn execute(
        &self,
        plan: &OperationPlan,
        state: &mut StackState,
        checkpoint: Option<&dyn StateStore>,
    ) -> Result<ExecutionResult> {
        plan.validate()?;

        let total = plan.actions.len();
        info!("Executing plan for {} with {total} actions", plan.stack);
        self.emit(ProgressEvent::PlanStarted {
            stack: plan.stack.clone(),
            actions: total,
        });

        let mut pending: Vec<usize> = plan.actions.iter().map(|a| a.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
        for action in &plan.actions {
            for &dep in &action.dependencies {
                dependents[dep].push(action.index);
            }
        }

        let mut ready: BTreeSet<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();

        let mut results: Vec<Option<ActionResult>> = vec![None; total];
        let mut carried: Vec<Duration> = vec![Duration::ZERO; total];
        let mut failure: Option<ProviderError> = None;
        let mut running: JoinSet<TaskOutput> = JoinSet::new();

        loop {
            while failure.is_none() && running.len() < self.max_parallel {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                self.spawn(&mut running, &plan.actions[index], Step::Start);
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (index, outcome, elapsed) = joined.map_err(|e| {
                StackwrightError::internal(format!("Action task failed: {e}"))
            })?;
            let action = &plan.actions[index];
            let elapsed = carried[index] + elapsed;

            match outcome {
                Ok(Outcome::OldRemoved) => {
                    state.remove_resource(&action.resource_name);
                    if let Some(store) = checkpoint {
                        store.save(state).await?;
                    }
                    debug!("Action {index} removed the old {}, recreating it", action.resource_name);
                    carried[index] = elapsed;
                    self.spawn(&mut running, action, Step::Recreate);
                }
                Ok(outcome) => {
                    let provider_id = Self::apply_outcome(state, action, outcome);
                    if let Some(store) = checkpoint {
                        store.save(state).await?;
                    }

                    debug!("Action {index} ({}) succeeded", action.description());
                    self.emit(ProgressEvent::ActionSucceeded {
                        index,
                        action: action.action_type,
                        resource: action.resource_name.clone(),
                        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    });
                    results[index] = Some(ActionResult {
                        index,
                        action_type: action.action_type,
                        resource_name: action.resource_name.clone(),
                        status: ActionStatus::Succeeded,
                        provider_id,
                        error: None,
                        elapsed,
                    });

                    for &next in &dependents[index] {
                        pending[next] -= 1;
                        if pending[next] == 0 {
                            ready.insert(next);
                        }
                    }
                }
                Err(e) => {
                    error!("Action {index} ({}) failed: {e}", action.description());
                    self.emit(ProgressEvent::ActionFailed {
                        index,
                        action: action.action_type,
                        resource: action.resource_name.clone(),
                        error: e.to_string(),
                    });
                    results[index] = Some(ActionResult {
                        index,
                        action_type: action.action_type,
                        resource_name: action.resource_name.clone(),
                        status: ActionStatus::Failed,
                        provider_id: state
                            .get_resource(&action.resource_name)
                            .map(|r| r.provider_id.clone()),
                        error: Some(e.clone()),
                        elapsed,
                    });
                    failure.get_or_insert(e);
                }
            }
        }

        let results: Vec<ActionResult> = results
            .into_iter()
            .zip(&plan.actions)
            .map(|(result, action)| {
                result.unwrap_or_else(|| {
                    warn!("Skipping action {} ({})", action.index, action.description());
                    self.emit(ProgressEvent::ActionSkipped {
                        index: action.index,
                        action: action.action_type,
                        resource: action.resource_name.clone(),
                    });
                    ActionResult {
                        index: action.index,
                        action_type: action.action_type,
                        resource_name: action.resource_name.clone(),
                        status: ActionStatus::Skipped,
                        provider_id: action.provider_id.clone(),
                        error: None,
                        elapsed: Duration::ZERO,
                    }
                })
            })
            .collect();

        let count = |s: ActionStatus| results.iter().filter(|r| r.status == s).count();
        let execution = ExecutionResult {
            applied: count(ActionStatus::Succeeded),
            failed: count(ActionStatus::Failed),
            skipped: count(ActionStatus::Skipped),
            failure,
            results,
        };

        info!(
            "Plan for {} finished: {} applied, {} failed, {} skipped",
            plan.stack, execution.applied, execution.failed, execution.skipped
        );
        self.emit(ProgressEvent::PlanFinished {
            stack: plan.stack.clone(),
            applied: execution.applied,
            failed: execution.failed,
            skipped: execution.skipped,
        });

        Ok(execution)
    }

    fn spawn(&self, running: &mut JoinSet<TaskOutput>, action: &PlannedAction, step: Step) {
        if step == Step::Start {
            self.emit(ProgressEvent::ActionStarted {
                index: action.index,
                action: action.action_type,
                resource: action.resource_name.clone(),
            });
        }

        let provider = Arc::clone(&self.provider);
        let retry = self.retry;
        let events = self.events.clone();
        let action = action.clone();

        running.spawn(async move {
            let started = Instant::now();
            let outcome = run_action(provider.as_ref(), retry, &action, step, events.as_ref()).await;
            (action.index, outcome, started.elapsed())
        });
    }

    /// Writes a successful action into the state. Returns the provider id.
    fn apply_outcome(state: &mut StackState, action: &PlannedAction, outcome: Outcome) -> Option<String> {
        match outcome {
            Outcome::Deleted | Outcome::OldRemoved => {
                state.remove_resource(&action.resource_name);
                None
            }
            Outcome::Applied(response) => {
                let hash = action.property_hash.clone().unwrap_or_default();
                let mut resource = match state.get_resource(&action.resource_name) {
                    Some(existing) if action.action_type == ActionType::Update => {
                        let mut updated = existing.clone();
                        updated.properties = action.properties.clone();
                        updated.property_hash = hash;
                        updated.provider_id.clone_from(&response.id);
                        updated.updated_at = Utc::now();
                        updated
                    }
                    _ => ResourceState::new(
                        &action.resource_name,
                        &action.resource_type,
                        &response.id,
                        action.properties.clone(),
                        &hash,
                    ),
                };
                resource.depends_on.clone_from(&action.depends_on);
                resource.outputs = response.outputs;
                state.set_resource(resource);
                Some(response.id)
            }
        }
    }
}

/// Performs the provider calls of one action.
async fn run_action(
    provider: &dyn ResourceProvider,
    retry: RetryPolicy,
    action: &PlannedAction,
    step: Step,
    events: Option<&EventSender>,
) -> std::result::Result<Outcome, ProviderError> {
    let name = action.resource_name.as_str();
    let on_retry = |attempt: u32, e: &ProviderError| {
        if let Some(events) = events {
            let _ = events.send(ProgressEvent::ActionRetrying {
                index: action.index,
                resource: name.to_string(),
                attempt,
                error: e.to_string(),
            });
        }
    };

    let request = ResourceRequest::new(name, &action.resource_type, action.properties.clone());
    let request = &request;
    let recorded_id = || {
        action
            .provider_id
            .as_deref()
            .ok_or_else(|| ProviderError::fatal(name, "No provider id recorded for resource"))
    };

    match action.action_type {
        ActionType::Create => {
            let response = retry
                .run(name, move || provider.create(request), on_retry)
                .await?;
            Ok(Outcome::Applied(response))
        }
        ActionType::Update => {
            let id = recorded_id()?;
            let old = action.old_properties.as_ref().unwrap_or(&serde_json::Value::Null);
            let response = retry
                .run(name, move || provider.update(id, request, old), on_retry)
                .await?;
            Ok(Outcome::Applied(response))
        }
        ActionType::Replace if step == Step::Recreate => {
            let response = retry
                .run(name, move || provider.create(request), on_retry)
                .await?;
            Ok(Outcome::Applied(response))
        }
        ActionType::Replace => {
            let id = recorded_id()?;
            let old_type = action
                .old_resource_type
                .as_deref()
                .unwrap_or(&action.resource_type);
            retry
                .run(name, move || provider.delete(id, old_type, name), on_retry)
                .await?;
            Ok(Outcome::OldRemoved)
        }
        ActionType::Delete => {
            let id = recorded_id()?;
            let resource_type = action
                .old_resource_type
                .as_deref()
                .unwrap_or(&action.resource_type);
            retry
                .run(name, move || provider.delete(id, resource_type, name), on_retry)
                .await?;
            Ok(Outcome::Deleted)
        }
    }
}

impl ExecutionResult {
    /// Returns true if every action was applied.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failure.is_none() && self.failed == 0
    }

    /// Returns the names of resources touched by applied actions.
    #[must_use]
    pub fn applied_resources(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.status == ActionStatus::Succeeded)
            .map(|r| r.resource_name.clone())
            .collect()
    }
}
