//! Collaborator seams: the local durable store and the remote sync service
//!
//! The engine only ever talks to these two traits. Implementations decide
//! transport and persistence; the core treats payloads as opaque JSON.
//!
//! ## Provided implementations
//!
//! - [`MemoryStore`]: in-process [`LocalStore`]
//! - [`RedbStore`]: durable [`LocalStore`] backed by redb
//! - [`EncryptedRemote`]: wraps any [`RemoteService`] so only ciphertext
//!   crosses the boundary

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::types::{ChangeId, ChangeRecord, ChangeStatus};

mod encrypted;
mod memory;
mod redb_store;

pub use self::encrypted::EncryptedRemote;
pub use self::memory::MemoryStore;
pub use self::redb_store::RedbStore;

/// Local persistence for change records and the sync checkpoint
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Every stored record, oldest first
    async fn changes(&self) -> SyncResult<Vec<ChangeRecord>>;

    /// Records awaiting upload: status `pending` or `failed`, oldest first
    async fn pending_changes(&self) -> SyncResult<Vec<ChangeRecord>>;

    /// Insert a record, replacing any record with the same id
    async fn save_change(&self, record: &ChangeRecord) -> SyncResult<()>;

    async fn update_change_status(&self, id: &ChangeId, status: ChangeStatus) -> SyncResult<()>;

    /// Remove a record; removing an unknown id is not an error
    async fn delete_change(&self, id: &ChangeId) -> SyncResult<()>;

    async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>>;

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> SyncResult<()>;

    /// Apply a remote (or manually chosen) change to local state.
    ///
    /// Must be idempotent: applying the same record twice has the same
    /// effect as applying it once.
    async fn apply_change(&self, record: &ChangeRecord) -> SyncResult<()>;
}

/// Remote synchronization service
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Changes created since `since`, or all changes when `None`
    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeRecord>>;

    /// Upload one batch.
    ///
    /// Returning `Err` means the whole batch failed in transport; per-record
    /// rejections go in [`PushResult::failed`].
    async fn push_changes(&self, batch: &[ChangeRecord]) -> SyncResult<PushResult>;

    async fn is_online(&self) -> bool;
}

#[async_trait]
impl<T: LocalStore + ?Sized> LocalStore for Arc<T> {
    async fn changes(&self) -> SyncResult<Vec<ChangeRecord>> {
        (**self).changes().await
    }

    async fn pending_changes(&self) -> SyncResult<Vec<ChangeRecord>> {
        (**self).pending_changes().await
    }

    async fn save_change(&self, record: &ChangeRecord) -> SyncResult<()> {
        (**self).save_change(record).await
    }

    async fn update_change_status(&self, id: &ChangeId, status: ChangeStatus) -> SyncResult<()> {
        (**self).update_change_status(id, status).await
    }

    async fn delete_change(&self, id: &ChangeId) -> SyncResult<()> {
        (**self).delete_change(id).await
    }

    async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        (**self).last_sync_time().await
    }

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> SyncResult<()> {
        (**self).set_last_sync_time(time).await
    }

    async fn apply_change(&self, record: &ChangeRecord) -> SyncResult<()> {
        (**self).apply_change(record).await
    }
}

#[async_trait]
impl<T: RemoteService + ?Sized> RemoteService for Arc<T> {
    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeRecord>> {
        (**self).changes_since(since).await
    }

    async fn push_changes(&self, batch: &[ChangeRecord]) -> SyncResult<PushResult> {
        (**self).push_changes(batch).await
    }

    async fn is_online(&self) -> bool {
        (**self).is_online().await
    }
}

/// Outcome of uploading one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub successful: Vec<ChangeId>,
    pub failed: Vec<PushFailure>,
}

impl PushResult {
    /// Every record in `batch` accepted
    pub fn all_successful(batch: &[ChangeRecord]) -> Self {
        Self {
            successful: batch.iter().map(|r| r.id).collect(),
            failed: Vec::new(),
        }
    }
}

/// Records the remote service rejected, with its reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFailure {
    pub change_ids: Vec<ChangeId>,
    pub error: String,
}
