//! Validation of configurations and programs.
//!
//! This module checks configuration values and declared programs before any
//! state is touched, collecting every error and warning in one pass.

use crate::error::{ConfigError, Result, StackwrightError};
use crate::program::{Program, ResourceGraph};
use crate::provider::KubernetesProvider;
use crate::state::StackRef;
use tracing::debug;

use super::spec::{ExecutionConfig, KubernetesConfig, StackwrightConfig, StateBackend, StateConfig};

/// Validator for configurations and programs.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &StackwrightConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        for (field, name) in [("project", &config.project), ("stack", &config.stack)] {
            if let Some(name) = name {
                if !StackRef::is_valid_name(name) {
                    result.error(
                        field,
                        format!("Name '{name}' is invalid. Must be 1 to 100 characters of [A-Za-z0-9_.-]."),
                    );
                }
            }
        }
        Self::validate_state(&config.state, &mut result);
        Self::validate_kubernetes(&config.provider.kubernetes, &mut result);
        Self::validate_execution(&config.execution, &mut result);

        result.into_result()
    }

    /// Validates a stack identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the project or stack name is invalid.
    pub fn validate_stack(&self, stack: &StackRef) -> Result<()> {
        stack.validate().map_err(StackwrightError::Config)
    }

    /// Validates a program.
    ///
    /// Graph errors (duplicates, undeclared references, cycles) are
    /// returned as they are; the remaining checks are collected.
    ///
    /// # Errors
    ///
    /// Returns the graph error or the first validation error.
    pub fn validate_program(&self, program: &Program) -> Result<ValidationResult> {
        ResourceGraph::build(program)?;

        let mut result = ValidationResult::default();
        if program.is_empty() {
            result.warnings.push(String::from("Program declares no resources"));
        }

        for (i, resource) in program.resources().iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if resource.name.is_empty() {
                result.error(format!("{prefix}.name"), "Resource name cannot be empty");
            }
            if resource.resource_type.is_empty() {
                result.error(format!("{prefix}.type"), "Resource type cannot be empty");
            } else if !KubernetesProvider::supports(&resource.resource_type) {
                result.warnings.push(format!(
                    "{prefix}.type: '{}' is not supported by the kubernetes provider",
                    resource.resource_type
                ));
            }
            if !resource.properties.is_object() {
                result.error(
                    format!("{prefix}.properties"),
                    format!("Properties of '{}' must be a mapping", resource.name),
                );
            }

            let containers = resource
                .properties
                .pointer("/spec/template/spec/containers")
                .and_then(serde_json::Value::as_array);
            for (c, container) in containers.into_iter().flatten().enumerate() {
                let image = container
                    .get("image")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                if image.is_empty() {
                    result.error(
                        format!("{prefix}.properties.spec.template.spec.containers[{c}].image"),
                        "Container image cannot be empty",
                    );
                } else if image.ends_with(":latest") {
                    result.warnings.push(format!(
                        "{prefix}: Using ':latest' tag is not recommended for production"
                    ));
                }
            }
        }

        result.into_result()
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the S3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates the Kubernetes connection.
    fn validate_kubernetes(kube: &KubernetesConfig, result: &mut ValidationResult) {
        if !kube.api_server.starts_with("https://") && !kube.api_server.starts_with("http://") {
            result.error(
                "provider.kubernetes.api_server",
                format!("API server '{}' must be an http(s) URL", kube.api_server),
            );
        }
        validate_dns_label("provider.kubernetes.namespace", &kube.namespace, result);
        if kube.timeout_secs == 0 {
            result.error(
                "provider.kubernetes.timeout_secs",
                "Request timeout must be at least 1 second",
            );
        }
        if kube.insecure_skip_tls_verify {
            result.warnings.push(String::from(
                "provider.kubernetes: TLS certificate verification is disabled",
            ));
        }
    }

    /// Validates execution settings.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.max_parallel == 0 {
            result.error("execution.max_parallel", "max_parallel must be at least 1");
        }
        if execution.max_attempts == 0 {
            result.error("execution.max_attempts", "max_attempts must be at least 1");
        }
        if execution.base_delay_ms > execution.max_delay_ms {
            result.error(
                "execution.base_delay_ms",
                format!(
                    "base_delay_ms ({}) exceeds max_delay_ms ({})",
                    execution.base_delay_ms, execution.max_delay_ms
                ),
            );
        }
        if execution.timeout_secs == 0 {
            result.error("execution.timeout_secs", "Operation timeout must be at least 1 second");
        }
        if execution.max_parallel > 1 {
            result.warnings.push(format!(
                "execution.max_parallel: {} independent resources may be applied at once, \
                 a failure leaves the others in flight to finish",
                execution.max_parallel
            ));
        }
    }
}

/// Validates that a namespace is a DNS label.
fn validate_dns_label(field: &str, name: &str, result: &mut ValidationResult) {
    if name.is_empty() {
        result.error(field, format!("{field} name cannot be empty"));
    } else if !is_valid_name(name) {
        result.error(
            field,
            format!("Name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
        );
    }
}

/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn into_result(self) -> Result<Self> {
        if self.errors.is_empty() {
            debug!("Validation passed with {} warning(s)", self.warnings.len());
            return Ok(self);
        }

        debug!("Validation failed with {} error(s)", self.errors.len());
        let first = &self.errors[0];
        Err(StackwrightError::Config(ConfigError::validation(
            first.message.clone(),
            first.field.clone(),
        )))
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
