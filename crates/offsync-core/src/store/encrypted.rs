//! End-to-end encrypted remote wrapper

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PushResult, RemoteService};
use crate::crypto::{EncryptedData, EncryptionService};
use crate::error::{SyncError, SyncResult};
use crate::types::{calculate_checksum, ChangeRecord};

/// What actually gets sealed: the payload together with its plaintext checksum
#[derive(Debug, Serialize, Deserialize)]
struct SealedPayload {
    data: Value,
    checksum: String,
}

/// Encrypts record payloads on the way out and decrypts them on the way in.
///
/// Only `data` is sealed; routing metadata (ids, entity key, timestamps)
/// stays readable so the remote can order and filter. The plaintext
/// checksum travels inside the envelope and the wire checksum covers the
/// envelope, so the remote never sees a digest of the plaintext.
///
/// On pull, a payload that is not an envelope or fails authentication is
/// handed on with an empty checksum. The engine's checksum screen then
/// reports it as a corrupted record instead of failing the whole pull.
/// Deletes without a payload pass through untouched.
pub struct EncryptedRemote<R> {
    inner: R,
    crypto: Arc<EncryptionService>,
}

impl<R: RemoteService> EncryptedRemote<R> {
    pub fn new(inner: R, crypto: Arc<EncryptionService>) -> Self {
        Self { inner, crypto }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn seal(&self, record: &ChangeRecord) -> SyncResult<ChangeRecord> {
        let mut sealed = record.clone();
        if let Some(data) = &record.data {
            let encrypted = self.crypto.encrypt(&SealedPayload {
                data: data.clone(),
                checksum: record.checksum.clone(),
            })?;
            let wire = serde_json::to_value(&encrypted)?;
            sealed.checksum = calculate_checksum(Some(&wire));
            sealed.data = Some(wire);
        }
        Ok(sealed)
    }

    fn open(&self, mut record: ChangeRecord) -> SyncResult<ChangeRecord> {
        let Some(wire) = record.data.take() else {
            return Ok(record);
        };
        if !self.crypto.is_initialized() {
            return Err(SyncError::NotInitialized);
        }

        let opened = serde_json::from_value::<EncryptedData>(wire.clone())
            .map_err(SyncError::from)
            .and_then(|envelope| self.crypto.decrypt::<SealedPayload>(&envelope));
        match opened {
            Ok(payload) => {
                record.data = Some(payload.data);
                record.checksum = payload.checksum;
                Ok(record)
            }
            Err(SyncError::NotInitialized) => Err(SyncError::NotInitialized),
            Err(e) => {
                tracing::warn!(change_id = %record.id, error = %e, "Rejected unauthenticated remote payload");
                record.data = Some(wire);
                // An empty checksum never verifies
                record.checksum.clear();
                Ok(record)
            }
        }
    }
}

#[async_trait]
impl<R: RemoteService> RemoteService for EncryptedRemote<R> {
    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeRecord>> {
        let records = self.inner.changes_since(since).await?;
        records.into_iter().map(|record| self.open(record)).collect()
    }

    async fn push_changes(&self, batch: &[ChangeRecord]) -> SyncResult<PushResult> {
        let sealed = batch
            .iter()
            .map(|record| self.seal(record))
            .collect::<SyncResult<Vec<_>>>()?;
        self.inner.push_changes(&sealed).await
    }

    async fn is_online(&self) -> bool {
        self.inner.is_online().await
    }
}
