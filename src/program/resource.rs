//! Resource definitions and program exports.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDefinition {
    /// Logical name, unique within a program.
    pub name: String,
    /// Type tag, e.g. `kubernetes:apps/v1:Deployment`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Property bag handed to the provider.
    #[serde(default = "empty_properties")]
    pub properties: Value,
    /// Names of resources that must exist before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Handle to a resource declared in a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    name: String,
}

/// Value of a stack output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExportValue {
    /// A provider output of a resource, addressed by JSON pointer.
    Output {
        /// Resource name.
        resource: String,
        /// JSON pointer into the resource's outputs, e.g. `/metadata/name`.
        path: String,
    },
    /// A literal value.
    Literal {
        /// The value.
        value: Value,
    },
}

fn empty_properties() -> Value {
    Value::Object(Map::new())
}

impl ResourceDefinition {
    /// Creates a definition with no properties and no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            properties: empty_properties(),
            depends_on: Vec::new(),
        }
    }

    /// Sets the property bag.
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// Adds a dependency on another declared resource.
    #[must_use]
    pub fn depends_on(mut self, resource: &ResourceRef) -> Self {
        self.depends_on.push(resource.name.clone());
        self
    }
}

impl ResourceRef {
    pub(crate) const fn new(name: String) -> Self {
        Self { name }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refers to one of the resource's provider outputs.
    #[must_use]
    pub fn output(&self, path: &str) -> ExportValue {
        ExportValue::Output {
            resource: self.name.clone(),
            path: path.to_string(),
        }
    }
}

impl ExportValue {
    /// Creates a literal export.
    #[must_use]
    pub const fn literal(value: Value) -> Self {
        Self::Literal { value }
    }

    /// Returns the resource this export reads from, if any.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Output { resource, .. } => Some(resource),
            Self::Literal { .. } => None,
        }
    }
}
