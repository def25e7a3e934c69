//! An in-memory provider that records calls, for executor and lifecycle tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ProviderError;

use super::{ProviderResponse, ResourceProvider, ResourceRequest};

/// A provider call as seen by [`RecordingProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProviderCall {
    Create(String),
    Update(String),
    Delete(String),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingProvider {
    calls: Mutex<Vec<ProviderCall>>,
    fatal: HashSet<String>,
    transient: Mutex<HashMap<String, u32>>,
    delay: Duration,
    hang_on: Option<String>,
    next_id: AtomicU64,
}

impl RecordingProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call for `name` fails fatally.
    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.fatal.insert(name.to_string());
        self
    }

    /// The first `times` calls for `name` fail transiently.
    pub(crate) fn flaky(self, name: &str, times: u32) -> Self {
        self.transient.lock().unwrap().insert(name.to_string(), times);
        self
    }

    /// Every call sleeps before answering.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls for `name` never complete.
    pub(crate) fn hanging_on(mut self, name: &str) -> Self {
        self.hang_on = Some(name.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of resources in the order their first create was attempted.
    pub(crate) fn created(&self) -> Vec<String> {
        self.names(|c| match c {
            ProviderCall::Create(n) => Some(n),
            _ => None,
        })
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.names(|c| match c {
            ProviderCall::Delete(n) => Some(n),
            _ => None,
        })
    }

    fn names(&self, pick: impl Fn(&ProviderCall) -> Option<&String>) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for call in self.calls.lock().unwrap().iter() {
            if let Some(name) = pick(call) {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    async fn answer(&self, call: ProviderCall, name: &str) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(call);

        if self.hang_on.as_deref() == Some(name) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fatal.contains(name) {
            return Err(ProviderError::fatal(name, "rejected by test provider"));
        }

        let mut transient = self.transient.lock().unwrap();
        if let Some(remaining) = transient.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::transient(name, "test provider is busy"));
            }
        }

        Ok(())
    }

    fn outputs(&self, name: &str, properties: &Value) -> (String, Value) {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let object = format!("{name}-{n:08x}");
        let outputs = json!({
            "metadata": { "name": object },
            "spec": properties.get("spec").cloned().unwrap_or(Value::Null),
        });
        (format!("test/{object}"), outputs)
    }
}

#[async_trait]
impl ResourceProvider for RecordingProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer(ProviderCall::Create(request.name.clone()), &request.name)
            .await?;
        let (id, outputs) = self.outputs(&request.name, &request.properties);
        Ok(ProviderResponse { id, outputs })
    }

    async fn update(
        &self,
        provider_id: &str,
        request: &ResourceRequest,
        _old_properties: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        self.answer(ProviderCall::Update(request.name.clone()), &request.name)
            .await?;
        let object = provider_id.rsplit('/').next().unwrap_or(provider_id);
        Ok(ProviderResponse {
            id: provider_id.to_string(),
            outputs: json!({
                "metadata": { "name": object },
                "spec": request.properties.get("spec").cloned().unwrap_or(Value::Null),
            }),
        })
    }

    async fn delete(
        &self,
        _provider_id: &str,
        _resource_type: &str,
        name: &str,
    ) -> Result<(), ProviderError> {
        self.answer(ProviderCall::Delete(name.to_string()), name).await
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
