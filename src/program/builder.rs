//! Programs: the declarative description of a stack.
//!
//! A [`Program`] is an explicit accumulator of resource definitions and
//! exports. It is filled either by a builder function or from a YAML file:
//!
//! ```yaml
//! resources:
//!   - name: nginx
//!     type: kubernetes:apps/v1:Deployment
//!     properties:
//!       spec:
//!         replicas: 5
//! outputs:
//!   name:
//!     resource: nginx
//!     path: /metadata/name
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ConfigError, Result, StackwrightError};

use super::resource::{ExportValue, ResourceDefinition, ResourceRef};

/// A declared set of resources plus named exports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Program {
    /// Resources in declaration order.
    #[serde(default)]
    resources: Vec<ResourceDefinition>,
    /// Named stack outputs.
    #[serde(default, rename = "outputs")]
    exports: BTreeMap<String, ExportValue>,
}

impl Program {
    /// Creates an empty program.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Runs a builder function over a fresh accumulator.
    ///
    /// # Errors
    ///
    /// Returns whatever error the builder function returns.
    pub fn build<F>(builder: F) -> Result<Self>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let mut program = Self::new();
        builder(&mut program)?;
        Ok(program)
    }

    /// Declares a resource and returns a handle for references.
    pub fn resource(&mut self, definition: ResourceDefinition) -> ResourceRef {
        let handle = ResourceRef::new(definition.name.clone());
        self.resources.push(definition);
        handle
    }

    /// Declares a stack output.
    pub fn export(&mut self, name: impl Into<String>, value: ExportValue) {
        self.exports.insert(name.into(), value);
    }

    /// Returns the declared resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[ResourceDefinition] {
        &self.resources
    }

    /// Returns the declared exports.
    #[must_use]
    pub const fn exports(&self) -> &BTreeMap<String, ExportValue> {
        &self.exports
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns true if the program declares nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.exports.is_empty()
    }

    /// Parses a program from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let program: Self = serde_yaml::from_str(content).map_err(|e| {
            StackwrightError::Config(ConfigError::parse(format!("Program parse error: {e}")))
        })?;

        debug!("Parsed program with {} resources", program.resources.len());
        Ok(program)
    }

    /// Loads a program from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading program from: {}", path.display());

        if !path.exists() {
            return Err(StackwrightError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackwrightError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        Self::from_yaml(&content).map_err(|e| match e {
            StackwrightError::Config(ConfigError::ParseError { message, .. }) => {
                StackwrightError::Config(ConfigError::ParseError {
                    message,
                    location: Some(path.display().to_string()),
                })
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_accumulates_in_order() {
        let program = Program::build(|p| {
            let ns = p.resource(ResourceDefinition::new("ns", "kubernetes:core/v1:Namespace"));
            let app = p.resource(
                ResourceDefinition::new("app", "kubernetes:apps/v1:Deployment")
                    .with_properties(json!({ "spec": { "replicas": 2 } }))
                    .depends_on(&ns),
            );
            p.export("name", app.output("/metadata/name"));
            Ok(())
        })
        .unwrap();

        let names: Vec<_> = program.resources().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ns", "app"]);
        assert_eq!(program.get("app").unwrap().depends_on, vec!["ns"]);
        assert_eq!(program.exports()["name"].resource(), Some("app"));
    }

    #[test]
    fn test_parse_yaml_program() {
        let yaml = r"
resources:
  - name: config
    type: kubernetes:core/v1:ConfigMap
    properties:
      data:
        mode: prod
  - name: web
    type: kubernetes:apps/v1:Deployment
    depends_on: [config]
outputs:
  name:
    resource: web
    path: /metadata/name
  tier:
    value: frontend
";
        let program = Program::from_yaml(yaml).unwrap();

        assert_eq!(program.resources().len(), 2);
        assert_eq!(program.get("web").unwrap().properties, json!({}));
        assert_eq!(
            program.exports()["name"],
            ExportValue::Output {
                resource: String::from("web"),
                path: String::from("/metadata/name"),
            }
        );
        assert_eq!(program.exports()["tier"], ExportValue::literal(json!("frontend")));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = Program::from_yaml("resources: [ { name: 1 ");
        assert!(matches!(
            result,
            Err(StackwrightError::Config(ConfigError::ParseError { .. }))
        ));
    }
}
