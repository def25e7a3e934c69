//! Built-in Kubernetes programs and type tags.

use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::builder::Program;
use super::resource::ResourceDefinition;

/// Type tag of an `apps/v1` Deployment.
pub const DEPLOYMENT_TYPE: &str = "kubernetes:apps/v1:Deployment";

/// Type tag of a core `v1` Service.
pub const SERVICE_TYPE: &str = "kubernetes:core/v1:Service";

/// Type tag of a core `v1` ConfigMap.
pub const CONFIG_MAP_TYPE: &str = "kubernetes:core/v1:ConfigMap";

/// Type tag of a core `v1` Namespace.
pub const NAMESPACE_TYPE: &str = "kubernetes:core/v1:Namespace";

/// Default replica count of the built-in Deployment.
pub const DEFAULT_REPLICAS: u32 = 5;

/// Arguments of a single-container Deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentArgs {
    /// Logical resource name.
    pub name: String,
    /// Container name.
    pub container: String,
    /// Container image.
    pub image: String,
    /// Number of replicas.
    pub replicas: u32,
    /// Pod labels, also used as the selector.
    pub labels: BTreeMap<String, String>,
}

impl DeploymentArgs {
    /// The nginx Deployment with the given replica count.
    #[must_use]
    pub fn nginx(replicas: u32) -> Self {
        Self {
            name: String::from("nginx"),
            container: String::from("nginx"),
            image: String::from("nginx"),
            replicas,
            labels: BTreeMap::from([(String::from("app"), String::from("nginx"))]),
        }
    }

    /// Renders the Deployment's property bag.
    #[must_use]
    pub fn properties(&self) -> Value {
        json!({
            "spec": {
                "selector": { "matchLabels": self.labels },
                "replicas": self.replicas,
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": {
                        "containers": [
                            { "name": self.container, "image": self.image }
                        ]
                    }
                }
            }
        })
    }
}

impl Default for DeploymentArgs {
    fn default() -> Self {
        Self::nginx(DEFAULT_REPLICAS)
    }
}

/// Builds a program declaring one Deployment and exporting its generated
/// name as `name`.
#[must_use]
pub fn deployment_program(args: &DeploymentArgs) -> Program {
    let mut program = Program::new();
    let deployment = program.resource(
        ResourceDefinition::new(&args.name, DEPLOYMENT_TYPE).with_properties(args.properties()),
    );
    program.export("name", deployment.output("/metadata/name"));
    program
}
