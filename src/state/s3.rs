//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) so several operators can share stacks. Locks are created with a
//! conditional `If-None-Match: *` put, which fails if a lock object exists.
//! Expired locks are taken over and held locks refreshed with an `If-Match`
//! put on the ETag that was read, so only one writer wins.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StackwrightError, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{StackRef, StackState, STATE_VERSION};

/// State object name.
const STATE_KEY: &str = "state.json";

/// Lock object name.
const LOCK_KEY: &str = "state.lock";

/// Attempts made when an expired lock has to be taken over.
const LOCK_ATTEMPTS: usize = 3;

/// HTTP status S3 answers a failed conditional write with.
const PRECONDITION_FAILED: u16 = 412;

/// Condition a lock write is made under.
#[derive(Debug, Clone, Copy)]
enum Precondition<'a> {
    /// No object exists under the key.
    Absent,
    /// The object still has this ETag.
    Matches(&'a str),
}

/// S3-based state store.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

/// Normalizes a key prefix to either empty or `something/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for one of a stack's objects.
    fn key(&self, stack: &StackRef, file: &str) -> String {
        format!("{}{}/{}/{file}", self.prefix, stack.project, stack.stack)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_object_with_etag(key).await?.map(|(content, _)| content))
    }

    /// Gets an object and its ETag from S3.
    async fn get_object_with_etag(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StackwrightError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackwrightError::State(StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackwrightError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackwrightError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Puts a lock object under a write precondition.
    ///
    /// Returns `false` if S3 rejected the precondition.
    async fn put_lock_object(&self, key: &str, content: &str, precondition: Precondition<'_>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        let request = match precondition {
            Precondition::Absent => request.if_none_match("*"),
            Precondition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                if status == Some(PRECONDITION_FAILED) {
                    Ok(false)
                } else {
                    Err(StackwrightError::State(StateError::LockFailed {
                        message: format!("S3 conditional put error: {sdk_err}"),
                    }))
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackwrightError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StackwrightError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Parses a lock object.
    fn parse_lock(content: &str) -> Result<LockInfo> {
        serde_json::from_str(content).map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, stack: &StackRef) -> Result<Option<StackState>> {
        let key = self.key(stack, STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3 for {stack}");
            return Ok(None);
        };

        let state: StackState = serde_json::from_str(&json).map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!("Failed to parse state: {e}")))
        })?;

        if state.version != STATE_VERSION {
            return Err(StackwrightError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let key = self.key(&state.stack_ref(), STATE_KEY);
        debug!("Saving state to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;

        self.put_object(&key, &content).await
    }

    async fn delete(&self, stack: &StackRef) -> Result<()> {
        let key = self.key(stack, STATE_KEY);
        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn exists(&self, stack: &StackRef) -> Result<bool> {
        self.object_exists(&self.key(stack, STATE_KEY)).await
    }

    async fn list_stacks(&self, project: &str) -> Result<Vec<StackRef>> {
        let project_prefix = format!("{}{project}/", self.prefix);
        let suffix = format!("/{STATE_KEY}");
        let mut stacks = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&project_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StackwrightError::State(StateError::s3(format!("S3 list error: {e}"))))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let Some(rest) = key.strip_prefix(&project_prefix) else { continue };
                if let Some(stack) = rest.strip_suffix(&suffix)
                    .filter(|s| !s.is_empty() && !s.contains('/'))
                {
                    stacks.push(StackRef::new(project, stack));
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        stacks.sort();
        Ok(stacks)
    }

    async fn acquire_lock(&self, stack: &StackRef, holder: &str) -> Result<LockInfo> {
        let key = self.key(stack, LOCK_KEY);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        for _ in 0..LOCK_ATTEMPTS {
            if self.put_lock_object(&key, &content, Precondition::Absent).await? {
                info!(
                    "Acquired lock on {stack}: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            let Some((existing, etag)) = self.get_object_with_etag(&key).await? else {
                continue;
            };
            let existing = Self::parse_lock(&existing)?;
            if !existing.is_expired() {
                return Err(StackwrightError::State(StateError::LockedByOther {
                    stack: stack.to_string(),
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }

            let Some(etag) = etag else {
                return Err(StackwrightError::State(StateError::LockFailed {
                    message: format!("Expired lock on {stack} has no ETag to take over"),
                }));
            };
            debug!("Expired lock found on {stack}, taking over");
            if self.put_lock_object(&key, &content, Precondition::Matches(&etag)).await? {
                info!("Took over expired lock on {stack}: {}", lock_info.lock_id);
                return Ok(lock_info);
            }
        }

        Err(StackwrightError::State(StateError::LockFailed {
            message: format!("Lock on {stack} kept changing hands"),
        }))
    }

    async fn refresh_lock(&self, stack: &StackRef, lock_id: &str) -> Result<LockInfo> {
        let key = self.key(stack, LOCK_KEY);
        let lost = || {
            StackwrightError::State(StateError::LockLost {
                stack: stack.to_string(),
                lock_id: lock_id.to_string(),
            })
        };

        let Some((content, Some(etag))) = self.get_object_with_etag(&key).await? else {
            return Err(lost());
        };
        let mut lock_info = Self::parse_lock(&content)?;
        if lock_info.lock_id != lock_id {
            return Err(lost());
        }
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        if !self.put_lock_object(&key, &content, Precondition::Matches(&etag)).await? {
            return Err(lost());
        }

        debug!("Refreshed lock on {stack}: {lock_id}");
        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &StackRef, lock_id: &str) -> Result<()> {
        let key = self.key(stack, LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;

            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released lock on {stack}: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self, stack: &StackRef) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(stack, LOCK_KEY)).await? {
            Some(content) => Ok(Some(Self::parse_lock(&content)?)),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
