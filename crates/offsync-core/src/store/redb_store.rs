//! Durable local store using redb
//!
//! Four tables:
//! - `changes`: insertion sequence number to JSON-encoded [`ChangeRecord`].
//!   Key order is save order, even for ids minted in the same millisecond.
//! - `change_seq`: change id to its sequence number
//! - `entities`: `(entity_type, entity_id)` to the last change applied to it
//! - `meta`: last sync checkpoint, next sequence number and the persisted
//!   device id

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use super::LocalStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeId, ChangeRecord, ChangeStatus, DeviceId, EntityKey, Operation};

const CHANGES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("changes");
const CHANGE_SEQ_TABLE: TableDefinition<&str, u64> = TableDefinition::new("change_seq");
const ENTITIES_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("entities");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const LAST_SYNC_KEY: &str = "last_sync_time";
const DEVICE_ID_KEY: &str = "device_id";
const NEXT_SEQ_KEY: &str = "next_change_seq";

/// [`LocalStore`] persisted in a single redb file
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Open or create the store at `path`, creating parent directories and
    /// all tables as needed.
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CHANGES_TABLE)?;
            let _ = write_txn.open_table(CHANGE_SEQ_TABLE)?;
            let _ = write_txn.open_table(ENTITIES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Device id stored in this database, generated on first use.
    ///
    /// Stable across restarts, so records created before and after a
    /// restart carry the same origin.
    pub fn device_id(&self) -> SyncResult<DeviceId> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let device_id = {
            let mut table = write_txn.open_table(META_TABLE)?;
            let existing = table
                .get(DEVICE_ID_KEY)?
                .map(|v| String::from_utf8_lossy(v.value()).into_owned());
            match existing {
                Some(id) => DeviceId::from_string(id),
                None => {
                    let generated = DeviceId::generate();
                    table.insert(DEVICE_ID_KEY, generated.as_str().as_bytes())?;
                    tracing::info!(device_id = %generated, "Generated new device id");
                    generated
                }
            }
        };
        write_txn.commit()?;
        Ok(device_id)
    }

    /// Last change applied to an entity, if it still exists
    pub fn entity(&self, key: &EntityKey) -> SyncResult<Option<ChangeRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENTITIES_TABLE)?;
        match table.get((key.entity_type.as_str(), key.entity_id.as_str()))? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn load_changes(&self, filter: impl Fn(&ChangeRecord) -> bool) -> SyncResult<Vec<ChangeRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHANGES_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: ChangeRecord = serde_json::from_slice(value.value())?;
            if filter(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn decode_seq(bytes: &[u8]) -> SyncResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SyncError::Storage("invalid change sequence counter".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

#[async_trait]
impl LocalStore for RedbStore {
    async fn changes(&self) -> SyncResult<Vec<ChangeRecord>> {
        self.load_changes(|_| true)
    }

    async fn pending_changes(&self) -> SyncResult<Vec<ChangeRecord>> {
        self.load_changes(|record| record.sync_status.is_awaiting_upload())
    }

    async fn save_change(&self, record: &ChangeRecord) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut index = write_txn.open_table(CHANGE_SEQ_TABLE)?;
            let id = record.id.to_string();
            let existing = index.get(id.as_str())?.map(|v| v.value());
            // Re-saving keeps the record's original position
            let seq = match existing {
                Some(seq) => seq,
                None => {
                    let mut meta = write_txn.open_table(META_TABLE)?;
                    let seq = match meta.get(NEXT_SEQ_KEY)? {
                        Some(v) => decode_seq(v.value())?,
                        None => 0,
                    };
                    meta.insert(NEXT_SEQ_KEY, (seq + 1).to_be_bytes().as_slice())?;
                    index.insert(id.as_str(), seq)?;
                    seq
                }
            };

            let mut table = write_txn.open_table(CHANGES_TABLE)?;
            let data = serde_json::to_vec(record)?;
            table.insert(seq, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn update_change_status(&self, id: &ChangeId, status: ChangeStatus) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let index = write_txn.open_table(CHANGE_SEQ_TABLE)?;
            let Some(seq) = index.get(id.to_string().as_str())?.map(|v| v.value()) else {
                return Err(SyncError::Storage(format!("change {id} not found")));
            };

            let mut table = write_txn.open_table(CHANGES_TABLE)?;
            let existing = table.get(seq)?.map(|v| v.value().to_vec());
            let Some(bytes) = existing else {
                return Err(SyncError::Storage(format!("change {id} not found")));
            };
            let mut record: ChangeRecord = serde_json::from_slice(&bytes)?;
            record.sync_status = status;
            let data = serde_json::to_vec(&record)?;
            table.insert(seq, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn delete_change(&self, id: &ChangeId) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut index = write_txn.open_table(CHANGE_SEQ_TABLE)?;
            let removed = index.remove(id.to_string().as_str())?.map(|v| v.value());
            if let Some(seq) = removed {
                let mut table = write_txn.open_table(CHANGES_TABLE)?;
                table.remove(seq)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        match table.get(LAST_SYNC_KEY)? {
            Some(v) => {
                let raw = String::from_utf8_lossy(v.value());
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| SyncError::Storage(format!("invalid last sync time: {e}")))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(LAST_SYNC_KEY, time.to_rfc3339().as_bytes())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn apply_change(&self, record: &ChangeRecord) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTITIES_TABLE)?;
            let key = (record.entity_type.as_str(), record.entity_id.as_str());
            match record.operation {
                Operation::Delete => {
                    table.remove(key)?;
                }
                Operation::Create | Operation::Update => {
                    let data = serde_json::to_vec(record)?;
                    table.insert(key, data.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
