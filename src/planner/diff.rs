//! Diff engine for comparing a declared program with stack state.
//!
//! Resources are matched by name. A resource absent from state is created, a
//! resource whose type changed is replaced, a resource whose property hash
//! changed is updated, and a resource only present in state is deleted.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::program::{Program, PropertyHasher, ResourceGraph};
use crate::state::{ResourceState, StackState};

/// Engine for computing diffs between declared and recorded states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Property hasher.
    hasher: PropertyHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed fields, as JSON pointers into the properties.
    pub details: Vec<DiffDetail>,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated in place.
    Update,
    /// Resource type changed; the old one is deleted and a new one created.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Field that differs (JSON pointer, `type` for the type tag).
    pub field: String,
    /// Old value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// All resource diffs: declared resources in topological order, then
    /// deletions in reverse topological order of the recorded graph.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: PropertyHasher::new(),
        }
    }

    /// Computes the diff between a program and the recorded stack state.
    #[must_use]
    pub fn compute_diff(
        &self,
        program: &Program,
        graph: &ResourceGraph,
        state: Option<&StackState>,
    ) -> DiffResult {
        let mut diffs = Vec::new();

        for name in graph.topological_order() {
            let Some(resource) = program.get(&name) else {
                continue;
            };
            let new_hash = self
                .hasher
                .hash_resource(&resource.resource_type, &resource.properties);
            let recorded = state.and_then(|s| s.get_resource(&name));

            diffs.push(Self::compute_resource_diff(
                &name,
                &resource.resource_type,
                &resource.properties,
                recorded,
                &new_hash,
            ));
        }

        if let Some(state) = state {
            let old_graph = ResourceGraph::from_state(state);
            for name in old_graph.reverse_topological_order() {
                if graph.contains(&name) {
                    continue;
                }
                let Some(recorded) = state.get_resource(&name) else {
                    continue;
                };

                debug!("Resource {name} is no longer declared");
                diffs.push(ResourceDiff {
                    name: name.clone(),
                    diff_type: DiffType::Delete,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: Some(recorded.provider_id.clone()),
                        new_value: None,
                    }],
                    old_hash: Some(recorded.property_hash.clone()),
                    new_hash: None,
                });
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Computes the diff for a single declared resource.
    fn compute_resource_diff(
        name: &str,
        resource_type: &str,
        properties: &Value,
        recorded: Option<&ResourceState>,
        new_hash: &str,
    ) -> ResourceDiff {
        let Some(recorded) = recorded else {
            debug!("Resource {name} needs to be created");
            return ResourceDiff {
                name: name.to_string(),
                diff_type: DiffType::Create,
                details: Vec::new(),
                old_hash: None,
                new_hash: Some(new_hash.to_string()),
            };
        };

        let old_hash = Some(recorded.property_hash.clone());

        if recorded.resource_type != resource_type {
            debug!(
                "Resource {name} changed type ({} -> {resource_type}), replacing",
                recorded.resource_type
            );
            let mut details = vec![DiffDetail {
                field: String::from("type"),
                old_value: Some(recorded.resource_type.clone()),
                new_value: Some(resource_type.to_string()),
            }];
            details.extend(property_changes(&recorded.properties, properties));
            return ResourceDiff {
                name: name.to_string(),
                diff_type: DiffType::Replace,
                details,
                old_hash,
                new_hash: Some(new_hash.to_string()),
            };
        }

        if recorded.property_hash == new_hash {
            debug!("Resource {name} is up to date");
            return ResourceDiff {
                name: name.to_string(),
                diff_type: DiffType::NoChange,
                details: Vec::new(),
                old_hash,
                new_hash: Some(new_hash.to_string()),
            };
        }

        let details = property_changes(&recorded.properties, properties);
        debug!("Resource {name} needs update ({} fields)", details.len());
        ResourceDiff {
            name: name.to_string(),
            diff_type: DiffType::Update,
            details,
            old_hash,
            new_hash: Some(new_hash.to_string()),
        }
    }
}

/// Lists the JSON pointers at which two property bags differ. Objects are
/// compared key by key; any other value is compared whole.
#[must_use]
pub fn property_changes(old: &Value, new: &Value) -> Vec<DiffDetail> {
    let mut details = Vec::new();
    collect_changes("", old, new, &mut details);
    details
}

fn collect_changes(pointer: &str, old: &Value, new: &Value, out: &mut Vec<DiffDetail>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
            for key in keys {
                let path = format!("{pointer}/{}", escape_pointer(key));
                match (old_map.get(key), new_map.get(key)) {
                    (Some(o), Some(n)) => collect_changes(&path, o, n, out),
                    (o, n) => out.push(DiffDetail {
                        field: path,
                        old_value: o.map(Value::to_string),
                        new_value: n.map(Value::to_string),
                    }),
                }
            }
        }
        _ if old != new => out.push(DiffDetail {
            field: if pointer.is_empty() {
                String::from("/")
            } else {
                pointer.to_string()
            },
            old_value: Some(old.to_string()),
            new_value: Some(new.to_string()),
        }),
        _ => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
