//! Error types for the stackwright engine.
//!
//! This module provides the error hierarchy for every stage of a stack
//! operation: configuration, state management, graph building, provider
//! calls, planning and the stack lifecycle itself.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::{StackRef, StackState};

/// The main error type for the stackwright engine.
#[derive(Debug, Error)]
pub enum StackwrightError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Resource graph errors.
    #[error("Program error: {0}")]
    Graph(#[from] GraphError),

    /// Provider errors raised outside of a plan execution.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Stack lifecycle errors.
    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// A configuration or program file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another operation.
    #[error("State of {stack} is locked (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Stack whose lock is held.
        stack: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A held lock expired or was taken over.
    #[error("Lock {lock_id} on {stack} is no longer held")]
    LockLost {
        /// Stack whose lock was lost.
        stack: String,
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors raised while turning a program into a resource graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The program's references contain a cycle.
    #[error("Cyclic reference between resources: {cycle}")]
    CyclicReference {
        /// The resources forming the cycle, e.g. `a -> b -> a`.
        cycle: String,
    },

    /// A reference points to a resource the program does not declare.
    #[error("Resource '{resource}' references undeclared resource '{reference}'")]
    UndeclaredReference {
        /// The referencing resource (or export).
        resource: String,
        /// The missing reference.
        reference: String,
    },

    /// Two resources share the same name.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },
}

/// Whether a provider failure may succeed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Retrying may succeed.
    Transient,
    /// Retrying will not help.
    Fatal,
}

/// Errors returned by a resource provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A failure that may succeed on retry (rate limits, 5xx, network).
    #[error("Transient failure for '{resource}': {message}")]
    Transient {
        /// Resource the call was made for.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// A failure that will not succeed on retry.
    #[error("Fatal failure for '{resource}': {message}")]
    Fatal {
        /// Resource the call was made for.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// The provider call did not complete in time.
    #[error("Provider call for '{resource}' timed out after {timeout_secs}s")]
    Timeout {
        /// Resource the call was made for.
        resource: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Giving up on '{resource}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Resource the call was made for.
        resource: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last transient failure.
        last_error: String,
    },

    /// The provider does not manage this resource type.
    #[error("Resource '{resource}' has unsupported type '{resource_type}'")]
    UnsupportedType {
        /// Resource the call was made for.
        resource: String,
        /// The unsupported type tag.
        resource_type: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// An action references a dependency that is not part of the plan.
    #[error("Action {action} depends on unknown action {dependency}")]
    UnknownDependency {
        /// Index of the action.
        action: usize,
        /// Index of the missing dependency.
        dependency: usize,
    },
}

/// Stack lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `create` was called for a stack that already has state.
    #[error("Stack '{stack}' already exists, pick a unique name")]
    StackAlreadyExists {
        /// The stack.
        stack: StackRef,
    },

    /// Another operation holds the stack's lock.
    #[error("Stack '{stack}' already has an update in progress (held by {holder} since {since})")]
    ConcurrentUpdate {
        /// The stack.
        stack: StackRef,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The stack has no persisted state.
    #[error("Stack '{stack}' does not exist")]
    StackNotFound {
        /// The stack.
        stack: StackRef,
    },

    /// The plan stopped at a provider failure; applied actions were kept.
    #[error("Applying stack '{stack}' failed at resource '{resource}' ({applied} operations applied): {source}")]
    ApplyFailed {
        /// The stack.
        stack: StackRef,
        /// Resource whose operation failed.
        resource: String,
        /// The provider failure.
        #[source]
        source: ProviderError,
        /// Number of operations applied before the failure.
        applied: usize,
        /// State as persisted after the partial apply.
        partial: Box<StackState>,
    },
}

/// Result type alias for stackwright operations.
pub type Result<T> = std::result::Result<T, StackwrightError>;

impl StackwrightError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. } | ProviderError::Timeout { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a parse error without a source location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Returns whether retrying may help.
    #[must_use]
    pub const fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => ProviderErrorKind::Transient,
            Self::Fatal { .. } | Self::RetriesExhausted { .. } | Self::UnsupportedType { .. } => {
                ProviderErrorKind::Fatal
            }
        }
    }

    /// Returns true if retrying may help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ProviderErrorKind::Transient)
    }

    /// Returns the resource the failing call was made for.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Transient { resource, .. }
            | Self::Fatal { resource, .. }
            | Self::Timeout { resource, .. }
            | Self::RetriesExhausted { resource, .. }
            | Self::UnsupportedType { resource, .. } => resource,
        }
    }
}

impl LifecycleError {
    /// Returns the stack the error refers to.
    #[must_use]
    pub const fn stack(&self) -> &StackRef {
        match self {
            Self::StackAlreadyExists { stack }
            | Self::ConcurrentUpdate { stack, .. }
            | Self::StackNotFound { stack }
            | Self::ApplyFailed { stack, .. } => stack,
        }
    }
}
