//! Configuration specification types.
//!
//! This module defines the structs that map to the `stackwright.yaml` file.
//! Every section is optional; an absent file behaves like an empty one.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::ExecutionOptions;
use crate::error::{ConfigError, Result};
use crate::provider::{KubernetesProviderConfig, RetryPolicy};
use crate::state::LOCK_REFRESH_INTERVAL;

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackwrightConfig {
    /// Project name, overridden by `--project` / `PROJECT_NAME`.
    #[serde(default)]
    pub project: Option<String>,
    /// Stack name, overridden by `--stack` / `STACK_NAME`.
    #[serde(default)]
    pub stack: Option<String>,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Plan execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Kubernetes cluster connection.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

/// Kubernetes cluster connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KubernetesConfig {
    /// API server URL.
    #[serde(default = "default_api_server")]
    pub api_server: String,
    /// Namespace for namespaced objects.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// File holding the bearer token, e.g. a service account token.
    #[serde(default)]
    pub token_file: Option<String>,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Plan execution configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of concurrently applied resources.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Attempts per provider call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound of the retry delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Timeout of a single provider call in seconds.
    #[serde(default = "default_operation_timeout")]
    pub timeout_secs: u64,
}

// Default value functions

fn default_api_server() -> String {
    String::from("https://127.0.0.1:6443")
}

fn default_namespace() -> String {
    String::from("default")
}

fn default_token_env() -> String {
    String::from("KUBE_TOKEN")
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_max_parallel() -> usize {
    1
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> u64 {
    1000
}

const fn default_max_delay() -> u64 {
    30_000
}

const fn default_operation_timeout() -> u64 {
    60
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            namespace: default_namespace(),
            token_env: default_token_env(),
            token_file: None,
            insecure_skip_tls_verify: false,
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            timeout_secs: default_operation_timeout(),
        }
    }
}

impl KubernetesConfig {
    /// Resolves the provider connection settings.
    ///
    /// The token is read from `token_env` through `lookup` first, then from
    /// `token_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token file cannot be read.
    pub fn provider_config<F>(&self, lookup: F) -> Result<KubernetesProviderConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = match lookup(&self.token_env) {
            Some(token) => Some(token),
            None => match &self.token_file {
                Some(path) => {
                    let path = PathBuf::from(path);
                    let token = std::fs::read_to_string(&path).map_err(|e| {
                        ConfigError::ParseError {
                            message: format!("Failed to read token file: {e}"),
                            location: Some(path.display().to_string()),
                        }
                    })?;
                    Some(token.trim().to_string())
                }
                None => None,
            },
        };

        Ok(KubernetesProviderConfig {
            api_server: self.api_server.clone(),
            namespace: self.namespace.clone(),
            token: token.filter(|t| !t.is_empty()),
            insecure: self.insecure_skip_tls_verify,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

impl ExecutionConfig {
    /// Returns the coordinator execution options.
    #[must_use]
    pub const fn options(&self) -> ExecutionOptions {
        ExecutionOptions {
            max_parallel: self.max_parallel,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                timeout: Duration::from_secs(self.timeout_secs),
            },
            lock_refresh: LOCK_REFRESH_INTERVAL,
        }
    }
}
