//! Kubernetes REST provider.
//!
//! Manages a small set of object kinds through the API server's REST
//! interface: create is a POST to the collection, update a JSON merge patch
//! of the object, delete a DELETE of the object.
//!
//! Generated object names derive from the request id and created objects
//! carry it as an annotation, so a create retried after the server already
//! accepted it adopts the object instead of leaving it behind.

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::{ProviderError, Result, StackwrightError};
use crate::program::kubernetes::{
    CONFIG_MAP_TYPE, DEPLOYMENT_TYPE, NAMESPACE_TYPE, SERVICE_TYPE,
};

use super::{ProviderResponse, ResourceProvider, ResourceRequest};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Content type of a JSON merge patch.
const MERGE_PATCH: &str = "application/merge-patch+json";

/// Length of the suffix of generated object names.
const NAME_SUFFIX_LEN: usize = 8;

/// Annotation recording the request that created an object.
const REQUEST_ANNOTATION: &str = "stackwright.io/request-id";

/// Connection settings of the Kubernetes provider.
#[derive(Debug, Clone)]
pub struct KubernetesProviderConfig {
    /// API server URL, e.g. `https://127.0.0.1:6443`.
    pub api_server: String,
    /// Namespace used for objects that do not set one.
    pub namespace: String,
    /// Bearer token, if the cluster needs one.
    pub token: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// HTTP request timeout.
    pub timeout: Duration,
}

impl Default for KubernetesProviderConfig {
    fn default() -> Self {
        Self {
            api_server: String::from("https://127.0.0.1:6443"),
            namespace: String::from("default"),
            token: None,
            insecure: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// REST location of a supported object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KindInfo {
    api_version: &'static str,
    kind: &'static str,
    base_path: &'static str,
    plural: &'static str,
    namespaced: bool,
}

impl KindInfo {
    fn for_type(resource_type: &str) -> Option<Self> {
        let info = match resource_type {
            DEPLOYMENT_TYPE => Self {
                api_version: "apps/v1",
                kind: "Deployment",
                base_path: "/apis/apps/v1",
                plural: "deployments",
                namespaced: true,
            },
            SERVICE_TYPE => Self {
                api_version: "v1",
                kind: "Service",
                base_path: "/api/v1",
                plural: "services",
                namespaced: true,
            },
            CONFIG_MAP_TYPE => Self {
                api_version: "v1",
                kind: "ConfigMap",
                base_path: "/api/v1",
                plural: "configmaps",
                namespaced: true,
            },
            NAMESPACE_TYPE => Self {
                api_version: "v1",
                kind: "Namespace",
                base_path: "/api/v1",
                plural: "namespaces",
                namespaced: false,
            },
            _ => return None,
        };
        Some(info)
    }

    fn collection_path(&self, namespace: &str) -> String {
        if self.namespaced {
            format!("{}/namespaces/{namespace}/{}", self.base_path, self.plural)
        } else {
            format!("{}/{}", self.base_path, self.plural)
        }
    }
}

/// Kubernetes REST provider.
#[derive(Debug, Clone)]
pub struct KubernetesProvider {
    /// HTTP client.
    client: Client,
    /// API server URL without a trailing slash.
    api_server: String,
    /// Default namespace.
    namespace: String,
    /// Bearer token.
    token: Option<String>,
}

impl KubernetesProvider {
    /// Creates a new provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: KubernetesProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| StackwrightError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token: config.token,
        })
    }

    /// Returns true if the provider can manage resources of the given type.
    #[must_use]
    pub fn supports(resource_type: &str) -> bool {
        KindInfo::for_type(resource_type).is_some()
    }

    fn kind(resource: &str, resource_type: &str) -> std::result::Result<KindInfo, ProviderError> {
        KindInfo::for_type(resource_type).ok_or_else(|| ProviderError::UnsupportedType {
            resource: resource.to_string(),
            resource_type: resource_type.to_string(),
        })
    }

    /// Builds the object body sent to the API server.
    fn manifest(&self, kind: &KindInfo, request: &ResourceRequest, name: &str) -> (Value, String) {
        let mut body = match &request.properties {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        body.insert(String::from("apiVersion"), Value::from(kind.api_version));
        body.insert(String::from("kind"), Value::from(kind.kind));

        let metadata = body
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }

        let mut namespace = self.namespace.clone();
        if let Value::Object(meta) = metadata {
            meta.insert(String::from("name"), Value::from(name));
            if kind.namespaced {
                match meta.get("namespace").and_then(Value::as_str) {
                    Some(ns) => namespace = ns.to_string(),
                    None => {
                        meta.insert(String::from("namespace"), Value::from(namespace.as_str()));
                    }
                }
            } else {
                meta.remove("namespace");
            }
        }

        (Value::Object(body), namespace)
    }

    /// Returns the declared object name, or derives `<logical>-<hex>` from
    /// the request id.
    fn object_name(request: &ResourceRequest) -> String {
        request
            .properties
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map_or_else(
                || {
                    let digest = hex::encode(Sha256::digest(request.request_id.as_bytes()));
                    format!("{}-{}", request.name, &digest[..NAME_SUFFIX_LEN])
                },
                str::to_string,
            )
    }

    /// Marks an object body with the id of the request creating it.
    fn annotate(body: &mut Value, request_id: &str) {
        let Some(meta) = body.get_mut("metadata").and_then(Value::as_object_mut) else {
            return;
        };
        let annotations = meta
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(annotations) = annotations {
            annotations.insert(String::from(REQUEST_ANNOTATION), Value::from(request_id));
        }
    }

    /// Fetches an object that already exists under the name a create used,
    /// and returns it if an earlier attempt of the same request created it.
    async fn adopt(
        &self,
        kind: &KindInfo,
        request: &ResourceRequest,
        namespace: &str,
        name: &str,
        conflict: &str,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let path = format!("{}/{name}", kind.collection_path(namespace));
        let (status, text) = self.send(&request.name, Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(classify(&request.name, status, &text));
        }

        let outputs = Self::outputs(&request.name, &text)?;
        let created_by = outputs
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(REQUEST_ANNOTATION))
            .and_then(Value::as_str);

        if created_by == Some(request.request_id.as_str()) {
            info!("Adopting {} '{name}' created by an earlier attempt", kind.kind);
            Ok(ProviderResponse {
                id: Self::provider_id(kind, namespace, name),
                outputs,
            })
        } else {
            warn!("{} '{name}' already exists and was not created by this request", kind.kind);
            Err(classify(&request.name, StatusCode::CONFLICT, conflict))
        }
    }

    fn provider_id(kind: &KindInfo, namespace: &str, name: &str) -> String {
        if kind.namespaced {
            format!("{namespace}/{name}")
        } else {
            name.to_string()
        }
    }

    /// Splits a provider id into namespace and object name.
    fn split_id<'a>(&'a self, kind: &KindInfo, provider_id: &'a str) -> (&'a str, &'a str) {
        if kind.namespaced {
            provider_id
                .split_once('/')
                .unwrap_or((self.namespace.as_str(), provider_id))
        } else {
            ("", provider_id)
        }
    }

    async fn send(
        &self,
        resource: &str,
        method: Method,
        path: &str,
        body: Option<(&Value, &str)>,
    ) -> std::result::Result<(StatusCode, String), ProviderError> {
        let url = format!("{}{path}", self.api_server);
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");

        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        if let Some((body, content_type)) = body {
            request = request
                .header(header::CONTENT_TYPE, content_type)
                .body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::transient(resource, format!("Request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(resource, format!("Failed to read response: {e}")))?;

        Ok((status, text))
    }

    /// Parses a success body into provider outputs.
    fn outputs(resource: &str, body: &str) -> std::result::Result<Value, ProviderError> {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(body)
            .map_err(|e| ProviderError::fatal(resource, format!("Invalid response body: {e}")))
    }
}

/// Builds the JSON merge patch (RFC 7386) that turns `old` into `new`.
///
/// Keys dropped from `new` are sent as `null` so the server removes them.
fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        patch.insert(key.clone(), merge_patch(previous, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Maps an unsuccessful status to a provider error.
fn classify(resource: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    let message = format!("API server returned {status}: {message}");

    match status.as_u16() {
        408 | 429 | 500..=599 => ProviderError::transient(resource, message),
        _ => ProviderError::fatal(resource, message),
    }
}

#[async_trait]
impl ResourceProvider for KubernetesProvider {
    async fn create(
        &self,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let kind = Self::kind(&request.name, &request.resource_type)?;
        let name = Self::object_name(request);
        let (mut body, namespace) = self.manifest(&kind, request, &name);
        Self::annotate(&mut body, &request.request_id);

        info!("Creating {} '{name}' for '{}'", kind.kind, request.name);
        let path = kind.collection_path(&namespace);
        let (status, text) = self
            .send(&request.name, Method::POST, &path, Some((&body, "application/json")))
            .await?;

        if status == StatusCode::CONFLICT {
            return self.adopt(&kind, request, &namespace, &name, &text).await;
        }
        if !status.is_success() {
            return Err(classify(&request.name, status, &text));
        }

        let outputs = Self::outputs(&request.name, &text)?;
        let created_name = outputs
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or(name.as_str());

        Ok(ProviderResponse {
            id: Self::provider_id(&kind, &namespace, created_name),
            outputs,
        })
    }

    async fn update(
        &self,
        provider_id: &str,
        request: &ResourceRequest,
        old_properties: &Value,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let kind = Self::kind(&request.name, &request.resource_type)?;
        let (namespace, name) = self.split_id(&kind, provider_id);
        let body = merge_patch(old_properties, &request.properties);

        info!("Patching {} '{name}' for '{}'", kind.kind, request.name);
        let path = format!("{}/{name}", kind.collection_path(namespace));
        let (status, text) = self
            .send(&request.name, Method::PATCH, &path, Some((&body, MERGE_PATCH)))
            .await?;

        if !status.is_success() {
            return Err(classify(&request.name, status, &text));
        }

        Ok(ProviderResponse {
            id: provider_id.to_string(),
            outputs: Self::outputs(&request.name, &text)?,
        })
    }

    async fn delete(
        &self,
        provider_id: &str,
        resource_type: &str,
        name: &str,
    ) -> std::result::Result<(), ProviderError> {
        let kind = Self::kind(name, resource_type)?;
        let (namespace, object) = self.split_id(&kind, provider_id);

        info!("Deleting {} '{object}' for '{name}'", kind.kind);
        let path = format!("{}/{object}", kind.collection_path(namespace));
        let (status, text) = self.send(name, Method::DELETE, &path, None).await?;

        if status == StatusCode::NOT_FOUND {
            debug!("{} '{object}' is already gone", kind.kind);
            return Ok(());
        }
        if !status.is_success() {
            return Err(classify(name, status, &text));
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::kubernetes::DeploymentArgs;
    use crate::provider::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> KubernetesProvider {
        KubernetesProvider::new(KubernetesProviderConfig {
            api_server: server.uri(),
            token: Some(String::from("secret")),
            ..KubernetesProviderConfig::default()
        })
        .unwrap()
    }

    fn nginx_request() -> ResourceRequest {
        ResourceRequest::new("nginx", DEPLOYMENT_TYPE, DeploymentArgs::nginx(5).properties())
    }

    #[tokio::test]
    async fn test_create_deployment_generates_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apis/apps/v1/namespaces/default/deployments"))
            .and(header_is("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "metadata": { "name": "nginx-0badc0de", "namespace": "default" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server).create(&nginx_request()).await.unwrap();
        assert_eq!(response.id, "default/nginx-0badc0de");
        assert_eq!(response.outputs.pointer("/metadata/name"), Some(&json!("nginx-0badc0de")));

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let sent_name = sent.pointer("/metadata/name").and_then(Value::as_str).unwrap();
        assert!(sent_name.starts_with("nginx-"));
        assert_eq!(sent_name.len(), "nginx-".len() + NAME_SUFFIX_LEN);
        assert_eq!(sent["kind"], json!("Deployment"));
        assert_eq!(sent.pointer("/spec/replicas"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_update_sends_merge_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/web/deployments/nginx-1"))
            .and(header_is("content-type", MERGE_PATCH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": { "name": "nginx-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = ResourceRequest::new("nginx", DEPLOYMENT_TYPE, DeploymentArgs::nginx(10).properties());
        let response = provider(&server)
            .update("web/nginx-1", &request, &json!({}))
            .await
            .unwrap();
        assert_eq!(response.id, "web/nginx-1");
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = provider(&server).delete("gone", NAMESPACE_TYPE, "ns").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/configmaps"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/services"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "message": "spec.ports: Required value"
            })))
            .mount(&server)
            .await;

        let p = provider(&server);
        let err = p
            .create(&ResourceRequest::new("cfg", CONFIG_MAP_TYPE, json!({})))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = p
            .create(&ResourceRequest::new("svc", SERVICE_TYPE, json!({})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("spec.ports"));
        assert_eq!(err.resource(), "svc");
    }

    #[tokio::test]
    async fn test_unsupported_type() {
        let server = MockServer::start().await;
        let err = provider(&server)
            .create(&ResourceRequest::new("x", "aws:s3:Bucket", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedType { .. }));
    }

    fn sent_name(request: &wiremock::Request) -> String {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        body.pointer("/metadata/name").and_then(Value::as_str).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_retried_create_keeps_the_generated_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apis/apps/v1/namespaces/default/deployments"))
            .respond_with(ResponseTemplate::new(503).set_body_string("etcd leader changed"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis/apps/v1/namespaces/default/deployments"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "metadata": {} })))
            .mount(&server)
            .await;

        let p = provider(&server);
        let request = nginx_request();
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        };
        let response = retry.run("nginx", || p.create(&request), |_, _| {}).await.unwrap();

        let names: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(sent_name)
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], names[1]);
        assert_eq!(response.id, format!("default/{}", names[0]));
    }

    #[tokio::test]
    async fn test_conflict_adopts_object_from_earlier_attempt() {
        let server = MockServer::start().await;
        let request = nginx_request();
        let name = KubernetesProvider::object_name(&request);
        Mock::given(method("POST"))
            .and(path("/apis/apps/v1/namespaces/default/deployments"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "message": format!("deployments.apps \"{name}\" already exists")
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/apis/apps/v1/namespaces/default/deployments/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {
                    "name": name,
                    "annotations": { REQUEST_ANNOTATION: request.request_id }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server).create(&request).await.unwrap();
        assert_eq!(response.id, format!("default/{name}"));
    }

    #[tokio::test]
    async fn test_conflict_with_foreign_object_is_fatal() {
        let server = MockServer::start().await;
        let request = ResourceRequest::new(
            "web",
            DEPLOYMENT_TYPE,
            json!({ "metadata": { "name": "web" } }),
        );
        Mock::given(method("POST"))
            .and(path("/apis/apps/v1/namespaces/default/deployments"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "message": "deployments.apps \"web\" already exists"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/default/deployments/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": { "name": "web", "annotations": { REQUEST_ANNOTATION: "someone-else" } }
            })))
            .mount(&server)
            .await;

        let err = provider(&server).create(&request).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_update_removes_dropped_keys() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/default/deployments/nginx-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": { "name": "nginx-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let old = json!({
            "metadata": { "labels": { "app": "nginx", "tier": "web" } },
            "spec": { "replicas": 5 }
        });
        let request = ResourceRequest::new(
            "nginx",
            DEPLOYMENT_TYPE,
            json!({
                "metadata": { "labels": { "app": "nginx" } },
                "spec": { "replicas": 10 }
            }),
        );
        provider(&server).update("default/nginx-1", &request, &old).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            sent,
            json!({
                "metadata": { "labels": { "tier": null } },
                "spec": { "replicas": 10 }
            })
        );
    }

    #[test]
    fn test_merge_patch() {
        assert_eq!(merge_patch(&json!({ "a": 1 }), &json!({ "a": 1 })), json!({}));
        assert_eq!(merge_patch(&json!({ "a": 1, "b": 2 }), &json!({ "a": 3 })), json!({ "a": 3, "b": null }));
        assert_eq!(merge_patch(&json!({ "a": [1] }), &json!({ "a": [2] })), json!({ "a": [2] }));
        assert_eq!(merge_patch(&Value::Null, &json!({ "a": 1 })), json!({ "a": 1 }));
    }

    #[test]
    fn test_generated_name_is_stable_per_request() {
        let request = nginx_request();
        assert_eq!(KubernetesProvider::object_name(&request), KubernetesProvider::object_name(&request));
        assert_ne!(
            KubernetesProvider::object_name(&request),
            KubernetesProvider::object_name(&nginx_request())
        );
    }

    #[test]
    fn test_cluster_scoped_ids() {
        let kind = KindInfo::for_type(NAMESPACE_TYPE).unwrap();
        assert_eq!(KubernetesProvider::provider_id(&kind, "default", "team-a"), "team-a");
        assert_eq!(kind.collection_path("ignored"), "/api/v1/namespaces");
    }
}
