//! Shared test harness: a scriptable in-memory remote service

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offsync_core::{
    ChangeId, ChangeRecord, DeviceId, MemoryStore, Operation, PushFailure, PushResult,
    RemoteService, SyncConfig, SyncEngine, SyncError, SyncResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// Server-side log entry
#[derive(Debug, Clone)]
pub struct Stored {
    pub record: ChangeRecord,
    pub received_at: DateTime<Utc>,
}

/// In-memory sync server shared by any number of engines.
///
/// `changes_since` filters on the time the server received a record, so a
/// device never gets its own uploads back from a later pull.
#[derive(Default)]
pub struct TestRemote {
    log: Mutex<Vec<Stored>>,
    offline: AtomicBool,
    /// Next N pushes fail in transport
    failing_pushes: AtomicUsize,
    /// Next N pulls fail
    failing_pulls: AtomicUsize,
    reject: Mutex<HashSet<ChangeId>>,
    /// Accepted but never acknowledged
    ignore: Mutex<HashSet<ChangeId>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub pulls: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl TestRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn fail_next_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_pulls(&self, count: usize) {
        self.failing_pulls.store(count, Ordering::SeqCst);
    }

    pub fn reject(&self, id: ChangeId) {
        self.reject.lock().insert(id);
    }

    pub fn ignore(&self, id: ChangeId) {
        self.ignore.lock().insert(id);
    }

    /// Make the next pull wait until the returned handle is notified
    pub fn hold_next_pull(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock() = Some(notify.clone());
        notify
    }

    /// Inject a record as if another device had uploaded it
    pub fn seed(&self, record: ChangeRecord) {
        self.log.lock().push(Stored {
            record,
            received_at: Utc::now(),
        });
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.log.lock().iter().map(|s| s.record.clone()).collect()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteService for TestRemote {
    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeRecord>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if Self::take_failure(&self.failing_pulls) {
            return Err(SyncError::Remote("pull failed".to_string()));
        }
        Ok(self
            .log
            .lock()
            .iter()
            .filter(|s| since.map_or(true, |t| s.received_at > t))
            .map(|s| s.record.clone())
            .collect())
    }

    async fn push_changes(&self, batch: &[ChangeRecord]) -> SyncResult<PushResult> {
        self.batch_sizes.lock().push(batch.len());
        if Self::take_failure(&self.failing_pushes) {
            return Err(SyncError::Remote("connection reset".to_string()));
        }

        let reject = self.reject.lock().clone();
        let ignore = self.ignore.lock().clone();
        let mut result = PushResult::default();
        let mut log = self.log.lock();
        for record in batch {
            if reject.contains(&record.id) {
                result.failed.push(PushFailure {
                    change_ids: vec![record.id],
                    error: "validation failed".to_string(),
                });
                continue;
            }
            log.push(Stored {
                record: record.clone(),
                received_at: Utc::now(),
            });
            if !ignore.contains(&record.id) {
                result.successful.push(record.id);
            }
        }
        Ok(result)
    }

    async fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

/// Engine over a fresh memory store, talking to `remote`
pub fn engine_with(
    remote: &Arc<TestRemote>,
    device: &str,
    config: SyncConfig,
) -> (SyncEngine, Arc<MemoryStore>) {
    let local = Arc::new(MemoryStore::new());
    let engine = SyncEngine::with_device_id(
        local.clone(),
        remote.clone(),
        config,
        DeviceId::from_string(device),
    )
    .expect("valid config");
    (engine, local)
}

/// A record as another device would have produced it
pub fn foreign_record(entity_type: &str, entity_id: &str, data: Value) -> ChangeRecord {
    ChangeRecord::new(
        entity_type,
        entity_id,
        Operation::Update,
        Some(data),
        DeviceId::from_string("device_remote"),
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("offsync_core=debug")
        .try_init();
}
