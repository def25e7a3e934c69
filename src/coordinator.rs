//! Lifecycle coordinator for named stacks.
//!
//! The coordinator ties the pieces together: it validates a program into a
//! resource graph, diffs it against the recorded stack state, applies the
//! resulting plan through the executor and persists the outcome. Every
//! mutating operation holds the stack's exclusive lock for its whole
//! duration.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, LifecycleError, Result, StackwrightError, StateError};
use crate::planner::{DiffEngine, DiffResult, EventSender, OperationPlan, PlanExecutor};
use crate::program::{ExportValue, Program, PropertyHasher, ResourceGraph};
use crate::provider::{ResourceProvider, RetryPolicy};
use crate::state::{
    generate_holder_id, HistoryEntry, StackLockGuard, StackOperation, StackRef, StackState,
    StateStore, LOCK_REFRESH_INTERVAL,
};

/// How plans are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum number of concurrently running actions.
    pub max_parallel: usize,
    /// Retry policy of provider calls.
    pub retry: RetryPolicy,
    /// How often the stack lock is refreshed while an operation runs.
    pub lock_refresh: Duration,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            retry: RetryPolicy::default(),
            lock_refresh: LOCK_REFRESH_INTERVAL,
        }
    }
}

/// Counts of what an apply changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    /// Resources created.
    pub created: usize,
    /// Resources updated in place.
    pub updated: usize,
    /// Resources replaced.
    pub replaced: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Resources left untouched.
    pub unchanged: usize,
}

/// The resolved outputs of a stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackOutputs {
    /// The stack.
    pub stack: StackRef,
    /// Output values by name.
    pub values: BTreeMap<String, Value>,
    /// The operation that just ran, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<StackOperation>,
    /// What the operation changed, if one just ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ChangeSummary>,
}

/// Runs lifecycle operations over named stacks.
pub struct LifecycleCoordinator {
    /// State store.
    store: Arc<dyn StateStore>,
    /// Resource provider.
    provider: Arc<dyn ResourceProvider>,
    /// Execution options.
    options: ExecutionOptions,
    /// Lock holder identifier.
    holder: String,
    /// Progress event stream.
    events: Option<EventSender>,
    /// Property hasher.
    hasher: PropertyHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("backend", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl LifecycleCoordinator {
    /// Creates a new coordinator.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            store,
            provider,
            options: ExecutionOptions::default(),
            holder: generate_holder_id(),
            events: None,
            hasher: PropertyHasher::new(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Sets the execution options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Streams progress events of every apply to the given sender.
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Creates a new stack and deploys the program into it.
    ///
    /// # Errors
    ///
    /// Returns `StackAlreadyExists` if the stack has state, `ConcurrentUpdate`
    /// if its lock is held, a graph error for an invalid program, or
    /// `ApplyFailed` if a provider call fails.
    pub async fn create(&self, stack: &StackRef, program: &Program) -> Result<StackOutputs> {
        let graph = ResourceGraph::build(program)?;
        info!("Creating stack {stack}");

        let guard = self.lock(stack).await?;
        let result: Result<StackOutputs> = async {
            if self.store.exists(stack).await? {
                return Err(LifecycleError::StackAlreadyExists {
                    stack: stack.clone(),
                }
                .into());
            }

            let state = StackState::new(stack);
            self.store.save(&state).await?;
            self.apply(program, &graph, state, StackOperation::Create)
                .await
        }
        .await;
        Self::release(guard).await;

        result
    }

    /// Deploys a program into an existing stack.
    ///
    /// # Errors
    ///
    /// Returns `StackNotFound` if the stack has no state, `ConcurrentUpdate`
    /// if its lock is held, a graph error for an invalid program, or
    /// `ApplyFailed` if a provider call fails.
    pub async fn update(&self, stack: &StackRef, program: &Program) -> Result<StackOutputs> {
        let graph = ResourceGraph::build(program)?;
        info!("Updating stack {stack}");

        let guard = self.lock(stack).await?;
        let result: Result<StackOutputs> = async {
            let state = self.load_existing(stack).await?;
            self.apply(program, &graph, state, StackOperation::Update)
                .await
        }
        .await;
        Self::release(guard).await;

        result
    }

    /// Creates the stack if it has no state, updates it otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update`], minus `StackNotFound`.
    pub async fn up(&self, stack: &StackRef, program: &Program) -> Result<StackOutputs> {
        let graph = ResourceGraph::build(program)?;

        let guard = self.lock(stack).await?;
        let result: Result<StackOutputs> = async {
            let (state, operation) = match self.store.load(stack).await? {
                Some(state) => (state, StackOperation::Update),
                None => {
                    info!("Stack {stack} does not exist yet, creating it");
                    let state = StackState::new(stack);
                    self.store.save(&state).await?;
                    (state, StackOperation::Create)
                }
            };
            self.apply(program, &graph, state, operation).await
        }
        .await;
        Self::release(guard).await;

        result
    }

    /// Computes the plan an update would apply, without taking the lock or
    /// calling the provider.
    ///
    /// # Errors
    ///
    /// Returns a graph error for an invalid program or a state error.
    pub async fn preview(&self, stack: &StackRef, program: &Program) -> Result<OperationPlan> {
        stack.validate()?;
        let graph = ResourceGraph::build(program)?;
        let state = self.store.load(stack).await?;
        let (plan, _) = self.plan(stack, program, &graph, state.as_ref());
        Ok(plan)
    }

    /// Deletes every resource of a stack, dependents first, and removes its
    /// state.
    ///
    /// # Errors
    ///
    /// Returns `StackNotFound` if the stack has no state, `ConcurrentUpdate`
    /// if its lock is held, or `ApplyFailed` if a provider call fails.
    pub async fn destroy(&self, stack: &StackRef) -> Result<()> {
        info!("Destroying stack {stack}");

        let guard = self.lock(stack).await?;
        let result: Result<()> = async {
            let mut state = self.load_existing(stack).await?;
            let plan = OperationPlan::destroy(&state);
            let execution = self
                .executor()
                .execute(&plan, &mut state, Some(self.store.as_ref()))
                .await?;

            let deleted = execution.applied_resources();
            if let Some(failure) = execution.failure {
                state.add_history(HistoryEntry::failed(
                    StackOperation::Destroy,
                    deleted,
                    &failure.to_string(),
                ));
                self.store.save(&state).await?;
                return Err(LifecycleError::ApplyFailed {
                    stack: stack.clone(),
                    resource: failure.resource().to_string(),
                    source: failure,
                    applied: execution.applied,
                    partial: Box::new(state),
                }
                .into());
            }

            self.store.delete(stack).await?;
            info!("Stack {stack} destroyed ({} resources deleted)", execution.applied);
            Ok(())
        }
        .await;
        Self::release(guard).await;

        result
    }

    /// Returns the recorded outputs of a stack.
    ///
    /// # Errors
    ///
    /// Returns `StackNotFound` if the stack has no state.
    pub async fn outputs(&self, stack: &StackRef) -> Result<StackOutputs> {
        let state = self.load_existing(stack).await?;
        Ok(StackOutputs {
            stack: stack.clone(),
            values: state.outputs,
            operation: None,
            summary: None,
        })
    }

    /// Lists the stacks of a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub async fn list(&self, project: &str) -> Result<Vec<StackRef>> {
        if !StackRef::is_valid_name(project) {
            return Err(
                ConfigError::validation(format!("Invalid project name '{project}'"), "project")
                    .into(),
            );
        }
        self.store.list_stacks(project).await
    }

    /// Returns the recorded state of a stack.
    ///
    /// # Errors
    ///
    /// Returns `StackNotFound` if the stack has no state.
    pub async fn state(&self, stack: &StackRef) -> Result<StackState> {
        self.load_existing(stack).await
    }

    async fn lock(&self, stack: &StackRef) -> Result<StackLockGuard> {
        stack.validate()?;
        StackLockGuard::acquire(Arc::clone(&self.store), stack, &self.holder, self.options.lock_refresh)
            .await
            .map_err(|e| match e {
                StackwrightError::State(StateError::LockedByOther { holder, since, .. }) => {
                    warn!("Stack {stack} is locked by {holder}");
                    LifecycleError::ConcurrentUpdate {
                        stack: stack.clone(),
                        holder,
                        since,
                    }
                    .into()
                }
                other => other,
            })
    }

    async fn release(guard: StackLockGuard) {
        let lock_id = guard.info().lock_id.clone();
        if let Err(e) = guard.release().await {
            warn!("Failed to release lock {lock_id}: {e}");
        }
    }

    async fn load_existing(&self, stack: &StackRef) -> Result<StackState> {
        stack.validate()?;
        self.store.load(stack).await?.ok_or_else(|| {
            LifecycleError::StackNotFound {
                stack: stack.clone(),
            }
            .into()
        })
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(Arc::clone(&self.provider))
            .with_retry(self.options.retry)
            .with_max_parallel(self.options.max_parallel)
            .with_events(self.events.clone())
    }

    fn plan(
        &self,
        stack: &StackRef,
        program: &Program,
        graph: &ResourceGraph,
        state: Option<&StackState>,
    ) -> (OperationPlan, DiffResult) {
        let program_hash = self.hasher.hash_program(program);
        let diff = self.diff_engine.compute_diff(program, graph, state);
        let plan = OperationPlan::from_diff(stack, &diff, program, graph, state, &program_hash);
        (plan, diff)
    }

    /// Applies a program to a loaded stack state and persists the result.
    async fn apply(
        &self,
        program: &Program,
        graph: &ResourceGraph,
        mut state: StackState,
        operation: StackOperation,
    ) -> Result<StackOutputs> {
        let stack = state.stack_ref();
        let (plan, diff) = self.plan(&stack, program, graph, Some(&state));
        info!("Plan for {stack}: {}", plan.summary());

        let execution = self
            .executor()
            .execute(&plan, &mut state, Some(self.store.as_ref()))
            .await?;

        let applied = execution.applied_resources();
        if let Some(failure) = execution.failure {
            state.add_history(HistoryEntry::failed(
                operation,
                applied,
                &failure.to_string(),
            ));
            self.store.save(&state).await?;
            return Err(LifecycleError::ApplyFailed {
                stack,
                resource: failure.resource().to_string(),
                source: failure,
                applied: execution.applied,
                partial: Box::new(state),
            }
            .into());
        }

        for resource in program.resources() {
            if let Some(recorded) = state.resources.get_mut(&resource.name) {
                recorded.depends_on.clone_from(&resource.depends_on);
            }
        }
        state.outputs = resolve_outputs(program, &state);
        state.program_hash = plan.program_hash.clone();
        state.add_history(HistoryEntry::new(operation, applied));
        self.store.save(&state).await?;

        info!("Stack {stack} is up to date ({})", plan.summary());
        Ok(StackOutputs {
            stack,
            values: state.outputs,
            operation: Some(operation),
            summary: Some(ChangeSummary {
                created: diff.creates,
                updated: diff.updates,
                replaced: diff.replaces,
                deleted: diff.deletes,
                unchanged: diff.unchanged,
            }),
        })
    }
}

/// Resolves a program's exports against the applied state.
fn resolve_outputs(program: &Program, state: &StackState) -> BTreeMap<String, Value> {
    program
        .exports()
        .iter()
        .map(|(name, export)| {
            let value = match export {
                ExportValue::Literal { value } => value.clone(),
                ExportValue::Output { resource, path } => state
                    .get_resource(resource)
                    .and_then(|r| r.output(path))
                    .cloned()
                    .unwrap_or_else(|| {
                        debug!("Output '{name}' ({resource}{path}) is not available");
                        Value::Null
                    }),
            };
            (name.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::program::kubernetes::{deployment_program, DeploymentArgs};
    use crate::program::ResourceDefinition;
    use crate::provider::testing::{ProviderCall, RecordingProvider};
    use crate::provider::MockResourceProvider;
    use crate::state::LocalStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn fast_options() -> ExecutionOptions {
        ExecutionOptions {
            max_parallel: 1,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                timeout: Duration::from_secs(5),
            },
            lock_refresh: Duration::from_millis(20),
        }
    }

    fn setup(provider: Arc<dyn ResourceProvider>) -> (TempDir, Arc<LocalStateStore>, LifecycleCoordinator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let coordinator = LifecycleCoordinator::new(store.clone(), provider)
            .with_options(fast_options());
        (dir, store, coordinator)
    }

    fn chain(names: &[&str]) -> Program {
        let mut program = Program::new();
        let mut previous = None;
        for name in names {
            let mut def = ResourceDefinition::new(*name, "test:Thing");
            if let Some(prev) = &previous {
                def = def.depends_on(prev);
            }
            previous = Some(program.resource(def));
        }
        program
    }

    fn independent(names: &[&str]) -> Program {
        let mut program = Program::new();
        for name in names {
            program.resource(ResourceDefinition::new(*name, "test:Thing"));
        }
        program
    }

    #[tokio::test]
    async fn test_create_resolves_outputs() {
        let provider = Arc::new(RecordingProvider::new());
        let (_dir, store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");

        let outputs = coordinator
            .create(&stack, &deployment_program(&DeploymentArgs::nginx(5)))
            .await
            .unwrap();

        assert_eq!(outputs.values["name"], json!("nginx-00000000"));
        assert_eq!(outputs.summary.unwrap().created, 1);
        assert_eq!(coordinator.list("shop").await.unwrap(), vec![stack.clone()]);

        let state = store.load(&stack).await.unwrap().unwrap();
        assert_eq!(state.resource_names(), vec!["nginx"]);
        assert!(!state.program_hash.is_empty());
        assert!(state.history.last().unwrap().success);
        assert!(!store.is_locked(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_on_existing_stack_makes_no_provider_calls() {
        // A mock without expectations panics on any call.
        let (_dir, store, coordinator) = setup(Arc::new(MockResourceProvider::new()));
        let stack = StackRef::new("shop", "dev");
        store.save(&StackState::new(&stack)).await.unwrap();

        let err = coordinator
            .create(&stack, &deployment_program(&DeploymentArgs::nginx(5)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StackwrightError::Lifecycle(LifecycleError::StackAlreadyExists { .. })
        ));
        assert!(err.to_string().contains("shop/dev"));
        assert!(!store.is_locked(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_updates_on_one_stack() {
        let provider = Arc::new(RecordingProvider::new().with_delay(Duration::from_millis(100)));
        let (_dir, _store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");
        coordinator
            .create(&stack, &deployment_program(&DeploymentArgs::nginx(5)))
            .await
            .unwrap();

        let six = deployment_program(&DeploymentArgs::nginx(6));
        let seven = deployment_program(&DeploymentArgs::nginx(7));
        let (first, second) = tokio::join!(
            coordinator.update(&stack, &six),
            coordinator.update(&stack, &seven)
        );

        let results = [first, second];
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let contended = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(StackwrightError::Lifecycle(LifecycleError::ConcurrentUpdate { .. }))
                )
            })
            .count();
        assert_eq!((succeeded, contended), (1, 1));
    }

    #[tokio::test]
    async fn test_unchanged_program_yields_empty_plan() {
        let provider = Arc::new(RecordingProvider::new());
        let (_dir, _store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");
        let program = deployment_program(&DeploymentArgs::nginx(5));

        coordinator.create(&stack, &program).await.unwrap();
        assert!(coordinator.preview(&stack, &program).await.unwrap().is_empty());

        let outputs = coordinator.update(&stack, &program).await.unwrap();
        assert_eq!(outputs.summary.unwrap().unchanged, 1);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_replica_change_is_a_single_update() {
        let provider = Arc::new(RecordingProvider::new());
        let (_dir, store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");

        coordinator
            .create(&stack, &deployment_program(&DeploymentArgs::nginx(5)))
            .await
            .unwrap();

        let ten = deployment_program(&DeploymentArgs::nginx(10));
        let plan = coordinator.preview(&stack, &ten).await.unwrap();
        assert_eq!(plan.action_count(), 1);
        assert_eq!(plan.actions[0].action_type, crate::planner::ActionType::Update);

        let outputs = coordinator.update(&stack, &ten).await.unwrap();
        assert_eq!(outputs.values["name"], json!("nginx-00000000"));
        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::Create(String::from("nginx")),
                ProviderCall::Update(String::from("nginx")),
            ]
        );

        let state = store.load(&stack).await.unwrap().unwrap();
        let nginx = state.get_resource("nginx").unwrap();
        assert_eq!(nginx.properties.pointer("/spec/replicas"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_applied_resources() {
        let provider = Arc::new(RecordingProvider::new().failing("b"));
        let (_dir, store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");

        let err = coordinator
            .create(&stack, &independent(&["a", "b", "c"]))
            .await
            .unwrap_err();

        let StackwrightError::Lifecycle(LifecycleError::ApplyFailed {
            resource,
            source,
            applied,
            partial,
            ..
        }) = err
        else {
            panic!("expected ApplyFailed");
        };
        assert_eq!(resource, "b");
        assert!(matches!(source, ProviderError::Fatal { .. }));
        assert_eq!(applied, 1);
        assert_eq!(partial.resource_names(), vec!["a"]);
        assert_eq!(provider.created(), vec!["a", "b"]);

        let state = store.load(&stack).await.unwrap().unwrap();
        assert_eq!(state.resource_names(), vec!["a"]);
        assert!(!state.history.last().unwrap().success);
        assert!(!store.is_locked(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(RecordingProvider::new().flaky("a", 2));
        let (_dir, _store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");

        coordinator.create(&stack, &independent(&["a"])).await.unwrap();
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_deletes_in_reverse_order() {
        let provider = Arc::new(RecordingProvider::new());
        let (_dir, store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");

        coordinator.create(&stack, &chain(&["a", "b", "c"])).await.unwrap();
        assert_eq!(provider.created(), vec!["a", "b", "c"]);

        coordinator.destroy(&stack).await.unwrap();
        assert_eq!(provider.deleted(), vec!["c", "b", "a"]);
        assert!(!store.exists(&stack).await.unwrap());
        assert!(matches!(
            coordinator.outputs(&stack).await,
            Err(StackwrightError::Lifecycle(LifecycleError::StackNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_releases_lock_and_keeps_checkpoints() {
        let provider = Arc::new(RecordingProvider::new().hanging_on("b"));
        let (_dir, store, coordinator) = setup(provider.clone());
        let coordinator = Arc::new(coordinator);
        let stack = StackRef::new("shop", "dev");

        let task = {
            let coordinator = Arc::clone(&coordinator);
            let stack = stack.clone();
            tokio::spawn(async move { coordinator.create(&stack, &chain(&["a", "b"])).await })
        };

        for _ in 0..200 {
            if provider.created().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider.created(), vec!["a", "b"]);
        assert!(store.is_locked(&stack).await.unwrap());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for _ in 0..100 {
            if !store.is_locked(&stack).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.is_locked(&stack).await.unwrap());

        let state = store.load(&stack).await.unwrap().unwrap();
        assert_eq!(state.resource_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_lock_is_refreshed_during_a_long_apply() {
        let provider = Arc::new(RecordingProvider::new().with_delay(Duration::from_millis(150)));
        let (dir, store, coordinator) = setup(provider.clone());
        let coordinator = Arc::new(coordinator);
        let stack = StackRef::new("shop", "dev");

        let task = {
            let coordinator = Arc::clone(&coordinator);
            let stack = stack.clone();
            tokio::spawn(async move { coordinator.create(&stack, &independent(&["x", "y"])).await })
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        let first = store.get_lock_info(&stack).await.unwrap().unwrap();

        // Age the lock as if its expiry window had run out.
        let mut aged = first.clone();
        aged.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let lock_path = dir.path().join("shop").join("dev").join("state.lock");
        let aged_path = lock_path.with_extension("aged");
        std::fs::write(&aged_path, serde_json::to_string(&aged).unwrap()).unwrap();
        std::fs::rename(&aged_path, &lock_path).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let current = store.get_lock_info(&stack).await.unwrap().unwrap();
        assert_eq!(current.lock_id, first.lock_id);
        assert!(current.expires_at > first.expires_at);

        let other = LifecycleCoordinator::new(store.clone(), provider.clone())
            .with_options(fast_options())
            .with_holder("other");
        let err = other.update(&stack, &independent(&["x", "y"])).await.unwrap_err();
        assert!(matches!(
            err,
            StackwrightError::Lifecycle(LifecycleError::ConcurrentUpdate { .. })
        ));

        task.await.unwrap().unwrap();
        assert_eq!(provider.created(), vec!["x", "y"]);
        assert!(!store.is_locked(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn test_path_like_stack_names_are_rejected() {
        let (_dir, _store, coordinator) = setup(Arc::new(MockResourceProvider::new()));
        let err = coordinator
            .create(&StackRef::new("shop", ".."), &independent(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StackwrightError::Config(_)));
        assert!(coordinator.list("../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_update_of_missing_stack() {
        let (_dir, _store, coordinator) = setup(Arc::new(RecordingProvider::new()));
        let err = coordinator
            .update(&StackRef::new("shop", "ghost"), &independent(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StackwrightError::Lifecycle(LifecycleError::StackNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_up_creates_then_updates() {
        let provider = Arc::new(RecordingProvider::new());
        let (_dir, store, coordinator) = setup(provider.clone());
        let stack = StackRef::new("shop", "dev");

        let created = coordinator.up(&stack, &independent(&["a"])).await.unwrap();
        assert_eq!(created.operation, Some(StackOperation::Create));
        let updated = coordinator.up(&stack, &independent(&["a", "b"])).await.unwrap();
        assert_eq!(updated.operation, Some(StackOperation::Update));

        let state = store.load(&stack).await.unwrap().unwrap();
        assert_eq!(state.resource_names(), vec!["a", "b"]);
        let operations: Vec<_> = state.history.iter().map(|h| h.operation).collect();
        assert_eq!(operations, vec![StackOperation::Create, StackOperation::Update]);
    }

    #[tokio::test]
    async fn test_invalid_program_is_rejected_before_locking() {
        let (_dir, store, coordinator) = setup(Arc::new(MockResourceProvider::new()));
        let stack = StackRef::new("shop", "dev");
        let mut program = Program::new();
        let ghost = crate::program::ResourceRef::new(String::from("ghost"));
        program.resource(ResourceDefinition::new("a", "t").depends_on(&ghost));

        let err = coordinator.create(&stack, &program).await.unwrap_err();
        assert!(matches!(err, StackwrightError::Graph(_)));
        assert!(!store.exists(&stack).await.unwrap());
    }
}
