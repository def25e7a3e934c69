//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackwrightError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackwrightConfig;

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackwright.yaml", "stackwright.yml"];

/// Configuration parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackwrightConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

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

        let mut config = self.parse_yaml(&content, Some(path))?;
        self.resolve_paths(&mut config);
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackwrightConfig> {
        debug!("Parsing YAML configuration");

        // An empty document is a valid, all-default configuration.
        if content.trim().is_empty() {
            return Ok(StackwrightConfig::default());
        }

        let config: StackwrightConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackwrightError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackwrightConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    ///
    /// Recognized variables: `STACKWRIGHT_STATE_BUCKET`,
    /// `STACKWRIGHT_STATE_PREFIX`, `STACKWRIGHT_STATE_PATH`,
    /// `KUBE_API_SERVER` and `KUBE_NAMESPACE`.
    pub fn apply_env_overrides<F>(config: &mut StackwrightConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // State overrides
        if let Some(bucket) = lookup("STACKWRIGHT_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("STACKWRIGHT_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(path) = lookup("STACKWRIGHT_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        // Provider overrides
        if let Some(server) = lookup("KUBE_API_SERVER") {
            debug!("Overriding provider.kubernetes.api_server from environment");
            config.provider.kubernetes.api_server = server;
        }

        if let Some(namespace) = lookup("KUBE_NAMESPACE") {
            debug!("Overriding provider.kubernetes.namespace from environment");
            config.provider.kubernetes.namespace = namespace;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackwrightError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Expands `~/` in local state and token paths and makes relative ones
    /// relative to the base path.
    fn resolve_paths(&self, config: &mut StackwrightConfig) {
        let resolve = |path: &mut String| {
            if let Some(rest) = path.strip_prefix("~/") {
                if let Some(home) = dirs::home_dir() {
                    let expanded = home.join(rest).display().to_string();
                    *path = expanded;
                }
            }
            if let Some(base) = &self.base_path {
                if Path::new(path.as_str()).is_relative() {
                    *path = base.join(path.as_str()).display().to_string();
                }
            }
        };

        if let Some(path) = config.state.path.as_mut() {
            resolve(path);
        }
        if let Some(path) = config.provider.kubernetes.token_file.as_mut() {
            resolve(path);
        }
    }
}

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackwrightError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
