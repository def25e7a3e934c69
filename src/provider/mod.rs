//! Resource providers.
//!
//! A provider is the external system that creates, updates and deletes
//! resources. The executor only talks to the [`ResourceProvider`] trait;
//! [`KubernetesProvider`] implements it against a cluster's REST API.

mod kubernetes;
mod retry;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

pub use kubernetes::{KubernetesProvider, KubernetesProviderConfig};
pub use retry::RetryPolicy;

/// A request to create or update one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Logical resource name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Desired properties.
    pub properties: Value,
    /// Identifies this request across retries of the same call.
    pub request_id: String,
}

/// What a provider reports after a successful create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider-assigned identifier.
    pub id: String,
    /// Provider outputs, addressed by export JSON pointers.
    pub outputs: Value,
}

impl ResourceRequest {
    /// Creates a new request.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            properties,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// The boundary between the engine and the system that owns resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns a transient or fatal provider error.
    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResponse, ProviderError>;

    /// Updates a resource in place.
    ///
    /// # Errors
    ///
    /// Returns a transient or fatal provider error.
    async fn update(
        &self,
        provider_id: &str,
        request: &ResourceRequest,
        old_properties: &Value,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Deletes a resource. Deleting a resource that is already gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns a transient or fatal provider error.
    async fn delete(
        &self,
        provider_id: &str,
        resource_type: &str,
        name: &str,
    ) -> Result<(), ProviderError>;

    /// Returns a short provider name for logs.
    fn name(&self) -> &'static str;
}
