//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every record is keyed by a [`StackRef`].

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::{StackRef, StackState};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state of a stack.
    ///
    /// Returns `None` if the stack has no state yet.
    async fn load(&self, stack: &StackRef) -> Result<Option<StackState>>;

    /// Saves the state of the stack it belongs to.
    async fn save(&self, state: &StackState) -> Result<()>;

    /// Deletes the state of a stack. The lock is left alone.
    async fn delete(&self, stack: &StackRef) -> Result<()>;

    /// Checks if a stack has state.
    async fn exists(&self, stack: &StackRef) -> Result<bool>;

    /// Lists the stacks of a project that have state.
    async fn list_stacks(&self, project: &str) -> Result<Vec<StackRef>>;

    /// Acquires the exclusive lock of a stack.
    ///
    /// Fails with `StateError::LockedByOther` if an unexpired lock exists.
    async fn acquire_lock(&self, stack: &StackRef, holder: &str) -> Result<LockInfo>;

    /// Pushes back the expiry of the lock `lock_id` still owns.
    ///
    /// Fails with `StateError::LockLost` if the lock is gone or held by
    /// someone else.
    async fn refresh_lock(&self, stack: &StackRef, lock_id: &str) -> Result<LockInfo>;

    /// Releases a lock if `lock_id` still owns it.
    async fn release_lock(&self, stack: &StackRef, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self, stack: &StackRef) -> Result<Option<LockInfo>>;

    /// Checks if the stack is locked by an unexpired lock.
    async fn is_locked(&self, stack: &StackRef) -> Result<bool> {
        Ok(self
            .get_lock_info(stack)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
