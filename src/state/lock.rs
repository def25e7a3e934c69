//! Stack locking for concurrent access protection.
//!
//! Every mutating stack operation holds an exclusive lock for its whole
//! duration. [`StackLockGuard`] keeps the lock alive with a heartbeat task
//! and releases it explicitly on the normal paths and from `Drop` when the
//! operation future is cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Result, StackwrightError, StateError};

use super::store::StateStore;
use super::types::StackRef;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// How often a held lock has its expiry pushed back.
pub const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Information about a stack lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Background task refreshing a held lock.
struct Heartbeat {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(store: Arc<dyn StateStore>, stack: StackRef, lock_id: String, every: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    () = tokio::time::sleep(every) => {}
                }

                match store.refresh_lock(&stack, &lock_id).await {
                    Ok(info) => debug!("Refreshed lock {lock_id} on {stack} until {}", info.expires_at),
                    Err(e @ StackwrightError::State(StateError::LockLost { .. })) => {
                        error!("{e}");
                        break;
                    }
                    Err(e) => warn!("Failed to refresh lock {lock_id} on {stack}: {e}"),
                }
            }
        });

        Self { stop, handle }
    }

    /// Stops the task and waits for an in-flight refresh to finish.
    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!("Lock heartbeat ended abnormally: {e}");
        }
    }
}

/// Holds a stack lock until released or dropped.
///
/// While held, the lock's expiry is pushed back every refresh interval so
/// long operations never outlive it.
pub struct StackLockGuard {
    store: Arc<dyn StateStore>,
    stack: StackRef,
    info: LockInfo,
    heartbeat: Option<Heartbeat>,
    released: bool,
}

impl StackLockGuard {
    /// Acquires the lock of `stack` and refreshes it every `refresh_every`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::LockedByOther` if another operation holds the lock.
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        stack: &StackRef,
        holder: &str,
        refresh_every: Duration,
    ) -> Result<Self> {
        let info = store.acquire_lock(stack, holder).await?;
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&store),
            stack.clone(),
            info.lock_id.clone(),
            refresh_every,
        );
        Ok(Self {
            store,
            stack: stack.clone(),
            info,
            heartbeat: Some(heartbeat),
            released: false,
        })
    }

    /// Gets the lock info as acquired.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Stops refreshing and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot remove the lock.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        self.store.release_lock(&self.stack, &self.info.lock_id).await
    }
}

impl Drop for StackLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let heartbeat = self.heartbeat.take();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Lock {} on {} dropped outside a runtime, it will expire on its own",
                self.info.lock_id, self.stack
            );
            return;
        };

        debug!("Releasing lock {} on {} after cancellation", self.info.lock_id, self.stack);
        let store = Arc::clone(&self.store);
        let stack = self.stack.clone();
        let lock_id = self.info.lock_id.clone();
        handle.spawn(async move {
            if let Some(heartbeat) = heartbeat {
                heartbeat.stop().await;
            }
            if let Err(e) = store.release_lock(&stack, &lock_id).await {
                warn!("Failed to release lock on {stack}: {e}");
            }
        });
    }
}

impl std::fmt::Debug for StackLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackLockGuard")
            .field("backend", &self.store.backend_type())
            .field("stack", &self.stack)
            .field("info", &self.info)
            .field("refreshing", &self.heartbeat.is_some())
            .field("released", &self.released)
            .finish()
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    #[test]
    fn test_lock_creation() {
        let info = LockInfo::new("test-holder");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_guard_release() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let stack = StackRef::new("p", "s");

        let guard = StackLockGuard::acquire(Arc::clone(&store), &stack, "holder", LOCK_REFRESH_INTERVAL)
            .await
            .expect("Failed to acquire lock");
        assert!(store.is_locked(&stack).await.expect("is_locked failed"));

        guard.release().await.expect("Failed to release lock");
        assert!(!store.is_locked(&stack).await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let stack = StackRef::new("p", "s");

        let guard = StackLockGuard::acquire(Arc::clone(&store), &stack, "holder", LOCK_REFRESH_INTERVAL)
            .await
            .expect("Failed to acquire lock");
        drop(guard);

        for _ in 0..100 {
            if !store.is_locked(&stack).await.expect("is_locked failed") {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("lock was not released after drop");
    }

    #[test]
    fn test_lock_refresh() {
        let mut info = LockInfo::new("holder");
        info.expires_at = Utc::now();
        info.refresh();
        assert!(info.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[tokio::test]
    async fn test_guard_refreshes_while_held() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let stack = StackRef::new("p", "s");

        let guard = StackLockGuard::acquire(Arc::clone(&store), &stack, "holder", Duration::from_millis(10))
            .await
            .expect("Failed to acquire lock");
        let acquired = guard.info().expires_at;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = store
            .get_lock_info(&stack)
            .await
            .expect("get_lock_info failed")
            .expect("lock should exist");
        assert_eq!(current.lock_id, guard.info().lock_id);
        assert!(current.expires_at > acquired);

        guard.release().await.expect("Failed to release lock");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get_lock_info(&stack).await.expect("get_lock_info failed").is_none());
    }
}
