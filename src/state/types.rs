//! State types for tracking stack state.
//!
//! These types represent the last successfully applied resource graph of a
//! stack, including provider-assigned identifiers, used for diffing and
//! idempotent operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept per stack.
const MAX_HISTORY: usize = 100;

/// Maximum length of a project or stack name.
pub const MAX_NAME_LEN: usize = 100;

/// Identifies a stack: a `(project, stack)` name pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackRef {
    /// Project name.
    pub project: String,
    /// Stack name, unique within the project.
    pub stack: String,
}

/// The persisted state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Hash of the last fully applied program.
    #[serde(default)]
    pub program_hash: String,
    /// Applied resources by name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Resolved stack outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// When the stack was created.
    pub created_at: DateTime<Utc>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Operation history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// State of a single applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Logical resource name (from the program).
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Properties as last applied.
    pub properties: Value,
    /// Hash of type and properties when applied.
    pub property_hash: String,
    /// Names of resources this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Value,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the stack history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: StackOperation,
    /// Resources touched by the operation.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of stack operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// First deployment of a new stack.
    Create,
    /// Update of an existing stack.
    Update,
    /// Teardown of a stack.
    Destroy,
}

impl StackRef {
    /// Creates a new stack reference.
    #[must_use]
    pub fn new(project: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stack: stack.into(),
        }
    }

    /// Returns true if `name` is 1 to 100 characters of `[A-Za-z0-9_.-]`.
    ///
    /// `.` and `..` are rejected since names become storage path segments.
    #[must_use]
    pub fn is_valid_name(name: &str) -> bool {
        (1..=MAX_NAME_LEN).contains(&name.len())
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    }

    /// Checks both names.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (field, name) in [("project", &self.project), ("stack", &self.stack)] {
            if !Self::is_valid_name(name) {
                return Err(ConfigError::validation(
                    format!(
                        "Invalid {field} name '{name}': expected 1 to {MAX_NAME_LEN} characters of [A-Za-z0-9_.-]"
                    ),
                    field,
                ));
            }
        }
        Ok(())
    }
}

impl StackState {
    /// Creates a new empty stack state.
    #[must_use]
    pub fn new(stack: &StackRef) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            project: stack.project.clone(),
            stack: stack.stack.clone(),
            program_hash: String::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            created_at: now,
            last_updated: now,
            history: Vec::new(),
        }
    }

    /// Returns the reference of the stack this state belongs to.
    #[must_use]
    pub fn stack_ref(&self) -> StackRef {
        StackRef::new(&self.project, &self.stack)
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource names in name order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl ResourceState {
    /// Creates a resource state for a freshly created resource.
    #[must_use]
    pub fn new(
        name: &str,
        resource_type: &str,
        provider_id: &str,
        properties: Value,
        property_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            provider_id: provider_id.to_string(),
            properties,
            property_hash: property_hash.to_string(),
            depends_on: Vec::new(),
            outputs: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Looks up a provider output by JSON pointer.
    #[must_use]
    pub fn output(&self, pointer: &str) -> Option<&Value> {
        self.outputs.pointer(pointer)
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: StackOperation, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: StackOperation, resources: Vec<String>, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for StackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.stack)
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
