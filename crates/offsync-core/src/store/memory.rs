//! In-memory local store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::LocalStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeId, ChangeRecord, ChangeStatus, EntityKey, Operation};

/// [`LocalStore`] that keeps everything in process memory.
///
/// Applied changes are folded into a per-entity view so callers (and tests)
/// can inspect what local state looks like after a sync.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Insertion order is creation order
    changes: Vec<ChangeRecord>,
    entities: HashMap<EntityKey, ChangeRecord>,
    last_sync: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last change applied to an entity, if it still exists
    pub fn entity(&self, key: &EntityKey) -> Option<ChangeRecord> {
        self.inner.read().entities.get(key).cloned()
    }

    /// Number of live entities in the applied view
    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn status_of(&self, id: &ChangeId) -> Option<ChangeStatus> {
        self.inner
            .read()
            .changes
            .iter()
            .find(|record| record.id == *id)
            .map(|record| record.sync_status)
    }

    pub fn contains_change(&self, id: &ChangeId) -> bool {
        self.status_of(id).is_some()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn changes(&self) -> SyncResult<Vec<ChangeRecord>> {
        Ok(self.inner.read().changes.clone())
    }

    async fn pending_changes(&self) -> SyncResult<Vec<ChangeRecord>> {
        Ok(self
            .inner
            .read()
            .changes
            .iter()
            .filter(|record| record.sync_status.is_awaiting_upload())
            .cloned()
            .collect())
    }

    async fn save_change(&self, record: &ChangeRecord) -> SyncResult<()> {
        let mut state = self.inner.write();
        match state.changes.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => state.changes.push(record.clone()),
        }
        Ok(())
    }

    async fn update_change_status(&self, id: &ChangeId, status: ChangeStatus) -> SyncResult<()> {
        let mut state = self.inner.write();
        let record = state
            .changes
            .iter_mut()
            .find(|record| record.id == *id)
            .ok_or_else(|| SyncError::Storage(format!("change {id} not found")))?;
        record.sync_status = status;
        Ok(())
    }

    async fn delete_change(&self, id: &ChangeId) -> SyncResult<()> {
        self.inner.write().changes.retain(|record| record.id != *id);
        Ok(())
    }

    async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.inner.read().last_sync)
    }

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> SyncResult<()> {
        self.inner.write().last_sync = Some(time);
        Ok(())
    }

    async fn apply_change(&self, record: &ChangeRecord) -> SyncResult<()> {
        let mut state = self.inner.write();
        match record.operation {
            Operation::Delete => {
                state.entities.remove(&record.key());
            }
            Operation::Create | Operation::Update => {
                state.entities.insert(record.key(), record.clone());
            }
        }
        Ok(())
    }
}
