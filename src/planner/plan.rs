//! Operation plan types and construction.
//!
//! This module defines the structure of operation plans and provides
//! functionality for converting diffs into executable plans.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::PlanError;
use crate::program::{Program, ResourceGraph};
use crate::state::{StackRef, StackState};

use super::diff::{DiffResult, DiffType};

/// An ordered, immutable set of operations against one stack.
#[derive(Debug, Clone, Serialize)]
pub struct OperationPlan {
    /// Stack the plan applies to.
    pub stack: StackRef,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the program this plan is based on.
    pub program_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Position in the plan.
    pub index: usize,
    /// Action type.
    pub action_type: ActionType,
    /// Resource name.
    pub resource_name: String,
    /// Resource type (the new one for replaces).
    pub resource_type: String,
    /// Desired properties (null for deletes).
    pub properties: Value,
    /// Recorded properties (if the resource exists).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_properties: Option<Value>,
    /// Recorded resource type (if the resource exists).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_resource_type: Option<String>,
    /// Provider id (if the resource exists).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// New property hash (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_hash: Option<String>,
    /// Names of resources this one depends on in the program.
    pub depends_on: Vec<String>,
    /// Changed fields (JSON pointers).
    pub changes: Vec<String>,
    /// Dependencies (action indices that must complete first).
    pub dependencies: Vec<usize>,
    /// Reason for this action.
    pub reason: String,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete the recorded resource, then create the declared one.
    Replace,
    /// Delete a resource.
    Delete,
}

impl OperationPlan {
    /// Creates a plan from a diff result.
    ///
    /// Creates, updates and replaces follow the diff's topological order and
    /// depend on the actions of their dependencies. Deletes come last, in
    /// reverse dependency order of the recorded graph, and wait for every
    /// recorded dependent to be deleted or rewritten first.
    #[must_use]
    pub fn from_diff(
        stack: &StackRef,
        diff: &DiffResult,
        program: &Program,
        graph: &ResourceGraph,
        state: Option<&StackState>,
        program_hash: &str,
    ) -> Self {
        let mut actions: Vec<PlannedAction> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for resource_diff in &diff.diffs {
            let action_type = match resource_diff.diff_type {
                DiffType::Create => ActionType::Create,
                DiffType::Update => ActionType::Update,
                DiffType::Replace => ActionType::Replace,
                DiffType::Delete | DiffType::NoChange => continue,
            };
            let Some(resource) = program.get(&resource_diff.name) else {
                continue;
            };
            let recorded = state.and_then(|s| s.get_resource(&resource.name));

            let dependencies = graph
                .dependencies(&resource.name)
                .iter()
                .filter_map(|dep| by_name.get(dep).copied())
                .collect();

            let reason = match action_type {
                ActionType::Create => String::from("Declared in program"),
                ActionType::Update => String::from("Properties changed"),
                ActionType::Replace => String::from("Resource type changed"),
                ActionType::Delete => String::new(),
            };

            let index = actions.len();
            by_name.insert(resource.name.clone(), index);
            actions.push(PlannedAction {
                index,
                action_type,
                resource_name: resource.name.clone(),
                resource_type: resource.resource_type.clone(),
                properties: resource.properties.clone(),
                old_properties: recorded.map(|r| r.properties.clone()),
                old_resource_type: recorded.map(|r| r.resource_type.clone()),
                provider_id: recorded.map(|r| r.provider_id.clone()),
                property_hash: resource_diff.new_hash.clone(),
                depends_on: resource.depends_on.clone(),
                changes: resource_diff.details.iter().map(|d| d.field.clone()).collect(),
                dependencies,
                reason,
            });
        }

        if let Some(state) = state {
            let old_graph = ResourceGraph::from_state(state);
            let mut deletes: HashMap<String, usize> = HashMap::new();

            for resource_diff in diff.diffs.iter().filter(|d| d.diff_type == DiffType::Delete) {
                let Some(recorded) = state.get_resource(&resource_diff.name) else {
                    continue;
                };

                let mut dependencies: Vec<usize> = old_graph
                    .dependents(&recorded.name)
                    .iter()
                    .filter_map(|d| deletes.get(d).or_else(|| by_name.get(d)).copied())
                    .collect();
                dependencies.sort_unstable();
                dependencies.dedup();

                let index = actions.len();
                deletes.insert(recorded.name.clone(), index);
                actions.push(PlannedAction::delete(
                    index,
                    recorded,
                    dependencies,
                    "Removed from program",
                ));
            }
        }

        Self {
            stack: stack.clone(),
            created_at: Utc::now(),
            program_hash: program_hash.to_string(),
            actions,
        }
    }

    /// Creates a plan deleting every recorded resource, dependents first.
    #[must_use]
    pub fn destroy(state: &StackState) -> Self {
        let graph = ResourceGraph::from_state(state);
        let mut actions: Vec<PlannedAction> = Vec::new();
        let mut deletes: HashMap<String, usize> = HashMap::new();

        for name in graph.reverse_topological_order() {
            let Some(recorded) = state.get_resource(&name) else {
                continue;
            };
            let dependencies = graph
                .dependents(&name)
                .iter()
                .filter_map(|d| deletes.get(d).copied())
                .collect();

            let index = actions.len();
            deletes.insert(name.clone(), index);
            actions.push(PlannedAction::delete(index, recorded, dependencies, "Stack destroyed"));
        }

        Self {
            stack: state.stack_ref(),
            created_at: Utc::now(),
            program_hash: String::new(),
            actions,
        }
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(stack: &StackRef, program_hash: &str) -> Self {
        Self {
            stack: stack.clone(),
            created_at: Utc::now(),
            program_hash: program_hash.to_string(),
            actions: vec![],
        }
    }

    /// Checks that every dependency points to an earlier action.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first dangling dependency.
    pub fn validate(&self) -> Result<(), PlanError> {
        for action in &self.actions {
            if let Some(&dependency) = action.dependencies.iter().find(|&&d| d >= action.index) {
                return Err(PlanError::UnknownDependency {
                    action: action.index,
                    dependency,
                });
            }
        }
        Ok(())
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of the given type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns a one-line summary such as `2 to create, 1 to update`.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return String::from("no changes");
        }

        [
            (ActionType::Create, "create"),
            (ActionType::Update, "update"),
            (ActionType::Replace, "replace"),
            (ActionType::Delete, "delete"),
        ]
        .iter()
        .filter_map(|(t, label)| {
            let n = self.count(*t);
            (n > 0).then(|| format!("{n} to {label}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
    }
}

impl PlannedAction {
    fn delete(
        index: usize,
        recorded: &crate::state::ResourceState,
        dependencies: Vec<usize>,
        reason: &str,
    ) -> Self {
        Self {
            index,
            action_type: ActionType::Delete,
            resource_name: recorded.name.clone(),
            resource_type: recorded.resource_type.clone(),
            properties: Value::Null,
            old_properties: Some(recorded.properties.clone()),
            old_resource_type: Some(recorded.resource_type.clone()),
            provider_id: Some(recorded.provider_id.clone()),
            property_hash: None,
            depends_on: Vec::new(),
            changes: Vec::new(),
            dependencies,
            reason: reason.to_string(),
        }
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {} '{}'", self.resource_type, self.resource_name),
            ActionType::Update => format!("Update {} '{}'", self.resource_type, self.resource_name),
            ActionType::Replace => format!("Replace {} '{}'", self.resource_type, self.resource_name),
            ActionType::Delete => format!("Delete {} '{}'", self.resource_type, self.resource_name),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.resource_name)?;
        if !self.changes.is_empty() {
            write!(f, " [{}]", self.changes.join(", "))?;
        }
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for OperationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes required for {}", self.stack);
        }

        writeln!(f, "Plan for {} ({}):", self.stack, self.summary())?;
        for action in &self.actions {
            writeln!(f, "  {}. {action}", action.index)?;
        }

        Ok(())
    }
}
