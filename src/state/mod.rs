//! State management module for stackwright.
//!
//! This module provides persistent per-stack state storage: the last applied
//! resource graph, provider identifiers, outputs and operation history, plus
//! the per-stack exclusive lock.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{generate_holder_id, LockInfo, StackLockGuard, LOCK_EXPIRY_SECS, LOCK_REFRESH_INTERVAL};
pub use types::{HistoryEntry, ResourceState, StackOperation, StackRef, StackState, MAX_NAME_LEN, STATE_VERSION};
