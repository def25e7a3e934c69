//! Local file-based state storage backend.
//!
//! Each stack lives in its own directory, `<base>/<project>/<stack>/`, holding
//! `state.json` and, while an operation runs, `state.lock`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StackwrightError, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{StackRef, StackState, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwright";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Attempts made when an expired lock has to be taken over.
const LOCK_ATTEMPTS: usize = 3;

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory for all stacks.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store in `./.stackwright`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackwrightError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding one stack's files.
    fn stack_dir(&self, stack: &StackRef) -> PathBuf {
        self.base_dir.join(&stack.project).join(&stack.stack)
    }

    fn state_path(&self, stack: &StackRef) -> PathBuf {
        self.stack_dir(stack).join(STATE_FILE)
    }

    fn lock_path(&self, stack: &StackRef) -> PathBuf {
        self.stack_dir(stack).join(LOCK_FILE)
    }

    /// Ensures a directory exists.
    async fn ensure_dir(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).await.map_err(|e| {
            StackwrightError::State(StateError::storage(format!(
                "Failed to create state directory {}: {e}",
                dir.display()
            )))
        })
    }

    /// Writes `content` to `path` and syncs it.
    async fn write_synced(path: &Path, content: &str) -> Result<()> {
        let mut file = fs::File::create(path).await.map_err(|e| {
            StackwrightError::State(StateError::storage(format!(
                "Failed to create {}: {e}",
                path.display()
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackwrightError::State(StateError::storage(format!(
                "Failed to write {}: {e}",
                path.display()
            )))
        })?;

        file.sync_all().await.map_err(|e| {
            StackwrightError::State(StateError::storage(format!(
                "Failed to sync {}: {e}",
                path.display()
            )))
        })
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(path: &Path) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StackwrightError::State(StateError::corrupted(format!(
                    "Failed to read lock file: {e}"
                ))));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })?;

        Ok(Some(lock_info))
    }

    /// Publishes a lock file atomically.
    ///
    /// The lock is written to a private file and hard-linked into place, so
    /// the link either fails because a lock exists or exposes a complete file.
    /// Returns `false` if a lock file already exists.
    async fn try_create_lock(lock_path: &Path, lock_info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        let temp_path = lock_path.with_extension(format!("lock.{}.tmp", lock_info.lock_id));
        Self::write_synced(&temp_path, &content).await?;

        let linked = fs::hard_link(&temp_path, lock_path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StackwrightError::State(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })),
        }
    }

    /// Removes the expired lock `stale_id` from `lock_path`.
    ///
    /// The lock file is first renamed to a private path, so of several
    /// contenders exactly one claims any given file. If the claimed file is
    /// not the expired lock, another contender has already replaced it and
    /// the file is linked back into place.
    async fn remove_stale_lock(lock_path: &Path, stale_id: &str) -> Result<()> {
        let claimed = lock_path.with_extension(format!("lock.{}.stale", Uuid::new_v4()));
        match fs::rename(lock_path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StackwrightError::State(StateError::LockFailed {
                    message: format!("Failed to claim expired lock: {e}"),
                }));
            }
        }

        let is_stale = Self::read_lock_file(&claimed)
            .await?
            .is_some_and(|lock| lock.lock_id == stale_id);

        if !is_stale {
            debug!("Lock at {} changed hands, putting it back", lock_path.display());
            match fs::hard_link(&claimed, lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!("Could not restore lock at {}: another lock took its place", lock_path.display());
                }
                Err(e) => {
                    let _ = fs::remove_file(&claimed).await;
                    return Err(StackwrightError::State(StateError::LockFailed {
                        message: format!("Failed to restore lock: {e}"),
                    }));
                }
            }
        }

        Self::remove_if_exists(&claimed).await
    }

    /// Deletes a file, treating a missing file as success.
    async fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StackwrightError::State(StateError::storage(format!(
                "Failed to delete {}: {e}",
                path.display()
            )))),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, stack: &StackRef) -> Result<Option<StackState>> {
        let state_path = self.state_path(stack);
        let content = match fs::read_to_string(&state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(StackwrightError::State(StateError::corrupted(format!(
                    "Failed to read state file: {e}"
                ))));
            }
        };

        debug!("Loaded state from: {}", state_path.display());

        let state: StackState = serde_json::from_str(&content).map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!("Failed to parse state file: {e}")))
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
        let stack = state.stack_ref();
        let dir = self.stack_dir(&stack);
        Self::ensure_dir(&dir).await?;

        let state_path = dir.join(STATE_FILE);
        debug!("Saving state to: {}", state_path.display());

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = state_path.with_extension("json.tmp");
        Self::write_synced(&temp_path, &content).await?;

        fs::rename(&temp_path, &state_path).await.map_err(|e| {
            StackwrightError::State(StateError::storage(format!("Failed to rename state file: {e}")))
        })?;

        Ok(())
    }

    async fn delete(&self, stack: &StackRef) -> Result<()> {
        let state_path = self.state_path(stack);
        info!("Deleting state file: {}", state_path.display());
        Self::remove_if_exists(&state_path).await
    }

    async fn exists(&self, stack: &StackRef) -> Result<bool> {
        Ok(fs::try_exists(self.state_path(stack)).await.unwrap_or(false))
    }

    async fn list_stacks(&self, project: &str) -> Result<Vec<StackRef>> {
        let project_dir = self.base_dir.join(project);
        let mut entries = match fs::read_dir(&project_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StackwrightError::State(StateError::storage(format!(
                    "Failed to list {}: {e}",
                    project_dir.display()
                ))));
            }
        };

        let mut stacks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let has_state = fs::try_exists(entry.path().join(STATE_FILE)).await.unwrap_or(false);
            if has_state {
                stacks.push(StackRef::new(project, entry.file_name().to_string_lossy()));
            }
        }

        stacks.sort();
        Ok(stacks)
    }

    async fn acquire_lock(&self, stack: &StackRef, holder: &str) -> Result<LockInfo> {
        let dir = self.stack_dir(stack);
        Self::ensure_dir(&dir).await?;
        let lock_path = dir.join(LOCK_FILE);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);

        for _ in 0..LOCK_ATTEMPTS {
            if Self::try_create_lock(&lock_path, &lock_info).await? {
                info!(
                    "Acquired lock on {stack}: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match Self::read_lock_file(&lock_path).await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StackwrightError::State(StateError::LockedByOther {
                        stack: stack.to_string(),
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                Some(expired) => {
                    debug!("Expired lock found on {stack}, taking over");
                    Self::remove_stale_lock(&lock_path, &expired.lock_id).await?;
                }
                // Released between our attempt and the read
                None => {}
            }
        }

        Err(StackwrightError::State(StateError::LockFailed {
            message: format!("Lock on {stack} kept changing hands"),
        }))
    }

    async fn refresh_lock(&self, stack: &StackRef, lock_id: &str) -> Result<LockInfo> {
        let lock_path = self.lock_path(stack);
        let mut lock_info = match Self::read_lock_file(&lock_path).await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => {
                return Err(StackwrightError::State(StateError::LockLost {
                    stack: stack.to_string(),
                    lock_id: lock_id.to_string(),
                }));
            }
        };
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        let temp_path = lock_path.with_extension(format!("lock.{lock_id}.refresh"));
        Self::write_synced(&temp_path, &content).await?;

        fs::rename(&temp_path, &lock_path).await.map_err(|e| {
            StackwrightError::State(StateError::storage(format!("Failed to refresh lock file: {e}")))
        })?;

        debug!("Refreshed lock on {stack}: {lock_id}");
        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &StackRef, lock_id: &str) -> Result<()> {
        let lock_path = self.lock_path(stack);
        if let Some(existing) = Self::read_lock_file(&lock_path).await? {
            if existing.lock_id == lock_id {
                Self::remove_if_exists(&lock_path).await?;
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
        Self::read_lock_file(&self.lock_path(stack)).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("test-project", "dev");

        let state = StackState::new(&stack);
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load(&stack)
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "test-project");
        assert_eq!(loaded.stack, "dev");
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load(&StackRef::new("p", "s")).await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stacks_are_isolated() {
        let (store, _temp) = create_test_store();
        let dev = StackRef::new("p", "dev");
        let prod = StackRef::new("p", "prod");

        store.save(&StackState::new(&dev)).await.expect("Failed to save state");

        assert!(store.exists(&dev).await.expect("exists check failed"));
        assert!(!store.exists(&prod).await.expect("exists check failed"));

        store.save(&StackState::new(&prod)).await.expect("Failed to save state");
        let stacks = store.list_stacks("p").await.expect("Failed to list stacks");
        assert_eq!(stacks, vec![dev.clone(), prod]);

        store.delete(&dev).await.expect("Failed to delete state");
        assert!(!store.exists(&dev).await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        let mut state = StackState::new(&stack);
        state.version = String::from("0.1");
        store.save(&state).await.expect("Failed to save state");

        let result = store.load(&stack).await;
        assert!(matches!(
            result,
            Err(StackwrightError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        let lock = store
            .acquire_lock(&stack, "test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked(&stack).await.expect("is_locked failed"));

        store
            .release_lock(&stack, &lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked(&stack).await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        let _lock1 = store
            .acquire_lock(&stack, "holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock(&stack, "holder-2").await;
        match result {
            Err(StackwrightError::State(StateError::LockedByOther { holder, .. })) => {
                assert_eq!(holder, "holder-1");
            }
            other => panic!("expected LockedByOther, got {other:?}"),
        }

        // Other stacks are unaffected
        store
            .acquire_lock(&StackRef::new("p", "other"), "holder-2")
            .await
            .expect("Failed to acquire lock on another stack");
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_keeps_lock() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        store.acquire_lock(&stack, "holder").await.expect("Failed to acquire lock");
        store.release_lock(&stack, "not-the-lock").await.expect("release failed");

        assert!(store.is_locked(&stack).await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        let stale = write_expired_lock(&store, &stack).await;

        assert!(!store.is_locked(&stack).await.expect("is_locked failed"));

        let lock = store.acquire_lock(&stack, "new-holder").await.expect("Failed to take over lock");
        assert_eq!(lock.holder, "new-holder");
        assert_ne!(lock.lock_id, stale.lock_id);
    }

    async fn write_expired_lock(store: &LocalStateStore, stack: &StackRef) -> LockInfo {
        let mut stale = LockInfo::new("crashed-holder");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let dir = store.stack_dir(stack);
        fs::create_dir_all(&dir).await.expect("Failed to create dir");
        fs::write(
            dir.join(LOCK_FILE),
            serde_json::to_string(&stale).expect("Failed to serialize lock"),
        )
        .await
        .expect("Failed to write lock");
        stale
    }

    #[tokio::test]
    async fn test_stale_removal_keeps_a_fresh_lock() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        let stale = write_expired_lock(&store, &stack).await;
        // Another contender already replaced the expired lock with its own.
        LocalStateStore::remove_if_exists(&store.lock_path(&stack))
            .await
            .expect("Failed to remove lock");
        let fresh = store.acquire_lock(&stack, "winner").await.expect("Failed to acquire lock");

        LocalStateStore::remove_stale_lock(&store.lock_path(&stack), &stale.lock_id)
            .await
            .expect("stale removal failed");

        let current = store
            .get_lock_info(&stack)
            .await
            .expect("get_lock_info failed")
            .expect("fresh lock should survive");
        assert_eq!(current.lock_id, fresh.lock_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_takeovers_of_an_expired_lock() {
        for _ in 0..20 {
            let (store, _temp) = create_test_store();
            let stack = StackRef::new("p", "s");
            write_expired_lock(&store, &stack).await;

            let (a, b) = tokio::join!(
                store.acquire_lock(&stack, "holder-a"),
                store.acquire_lock(&stack, "holder-b"),
            );

            let winners: Vec<LockInfo> = [a, b].into_iter().filter_map(std::result::Result::ok).collect();
            assert_eq!(winners.len(), 1, "exactly one contender must hold the lock");

            let current = store
                .get_lock_info(&stack)
                .await
                .expect("get_lock_info failed")
                .expect("winner's lock should exist");
            assert_eq!(current.lock_id, winners[0].lock_id);
        }
    }

    #[tokio::test]
    async fn test_refresh_lock() {
        let (store, _temp) = create_test_store();
        let stack = StackRef::new("p", "s");

        let mut lock = store.acquire_lock(&stack, "holder").await.expect("Failed to acquire lock");
        lock.expires_at = chrono::Utc::now();

        let refreshed = store.refresh_lock(&stack, &lock.lock_id).await.expect("refresh failed");
        assert_eq!(refreshed.lock_id, lock.lock_id);
        assert!(refreshed.expires_at > lock.expires_at);

        let result = store.refresh_lock(&stack, "someone-else").await;
        assert!(matches!(result, Err(StackwrightError::State(StateError::LockLost { .. }))));

        store.release_lock(&stack, &lock.lock_id).await.expect("release failed");
        let result = store.refresh_lock(&stack, &lock.lock_id).await;
        assert!(matches!(result, Err(StackwrightError::State(StateError::LockLost { .. }))));
    }
}
