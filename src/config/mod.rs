//! Configuration module for stackwright.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackwright.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of configuration values and programs

mod parser;
mod spec;
mod validator;

pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    ExecutionConfig, KubernetesConfig, ProviderConfig, StackwrightConfig, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
