//! Sync engine: orchestrates reconciliation cycles between a local store
//! and a remote service.
//!
//! ## Cycle
//!
//! ```text
//! sync()
//!   ├── already syncing? ──▶ Skipped(AlreadyInProgress)
//!   ├── offline?         ──▶ Skipped(Offline)
//!   └── syncing
//!        ├── read local pending + remote delta since last sync
//!        ├── screen checksums, detect + resolve conflicts
//!        ├── upload (batched)    ── per-batch failures recorded, not fatal
//!        ├── download (apply)    ── per-record failures recorded, not fatal
//!        ├── advance last sync time
//!        └── idle ──▶ Completed(report) | Failed { error }
//! ```
//!
//! At most one cycle runs at a time per engine. The auto-sync timer never
//! aborts a cycle in flight; stopping it only prevents the next tick.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    ConflictStrategy, ExcludeMatcher, ManualFallback, SyncConfig, SyncConfigUpdate,
};
use crate::conflict::{detect_conflicts, resolve_conflicts, Conflict, ResolvedConflict, Side};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, Subscription, SyncEvent, SyncEventKind};
use crate::store::{LocalStore, PushResult, RemoteService};
use crate::types::{ChangeId, ChangeRecord, ChangeStatus, DeviceId, EntityKey, Operation};

/// Why a cycle did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyInProgress,
    Offline,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyInProgress => f.write_str("already in progress"),
            SkipReason::Offline => f.write_str("offline"),
        }
    }
}

/// Summary status of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Everything uploaded and applied
    Success,
    /// The cycle finished but some uploads or downloads failed
    Partial,
    Failed,
    Skipped,
}

/// A recoverable failure recorded during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// Records that did not reach the remote; retried next cycle
    Upload {
        change_ids: Vec<ChangeId>,
        message: String,
    },
    /// A remote record that could not be applied locally
    Download { change_id: ChangeId, message: String },
}

impl SyncFailure {
    pub fn message(&self) -> &str {
        match self {
            SyncFailure::Upload { message, .. } | SyncFailure::Download { message, .. } => message,
        }
    }
}

/// What a completed cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// `Success` or `Partial`
    pub status: CycleStatus,
    /// Records the remote acknowledged
    pub uploaded: usize,
    /// Remote records applied locally
    pub downloaded: usize,
    /// Conflicts detected this cycle
    pub conflicts: usize,
    pub errors: Vec<SyncFailure>,
    pub synced_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Result of [`SyncEngine::sync`]
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Preconditions not met; nothing was touched
    Skipped(SkipReason),
    Completed(SyncReport),
    /// An unexpected error aborted the cycle
    Failed { error: String, duration: Duration },
}

impl SyncOutcome {
    pub fn status(&self) -> CycleStatus {
        match self {
            SyncOutcome::Skipped(_) => CycleStatus::Skipped,
            SyncOutcome::Completed(report) => report.status,
            SyncOutcome::Failed { .. } => CycleStatus::Failed,
        }
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Snapshot returned by [`SyncEngine::state`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub is_syncing: bool,
    /// Automatic sync is configured on
    pub is_enabled: bool,
    pub is_online: bool,
    pub pending_count: usize,
    pub conflict_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Next scheduled tick while the timer runs
    pub next_sync_at: Option<DateTime<Utc>>,
}

/// A conflict awaiting inspection or a manual decision
#[derive(Debug, Clone)]
struct QueuedConflict {
    conflict: Conflict,
    /// Neither side has been acted on; the local record is held back from
    /// upload until someone resolves it
    held: bool,
}

struct ConfigState {
    config: SyncConfig,
    excludes: ExcludeMatcher,
}

struct AutoSyncTimer {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

struct EngineInner {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    device_id: DeviceId,
    config: RwLock<ConfigState>,
    syncing: AtomicBool,
    conflicts: Mutex<Vec<QueuedConflict>>,
    events: EventBus,
    timer: Mutex<Option<AutoSyncTimer>>,
    next_sync_at: Mutex<Option<DateTime<Utc>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.cancel.cancel();
        }
    }
}

/// Clears the syncing flag when a cycle ends, including on unwind
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine.
///
/// Cheap to clone; clones share state. Construct one per local store.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.inner.device_id)
            .field("is_syncing", &self.is_syncing())
            .field("auto_sync", &self.is_auto_syncing())
            .finish()
    }
}

impl SyncEngine {
    /// Build an engine with a freshly generated device id.
    ///
    /// If `config.auto_sync` is set and a Tokio runtime is running, the
    /// timer starts immediately.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        Self::with_device_id(local, remote, config, DeviceId::generate())
    }

    /// Build an engine that stamps new records with `device_id`
    pub fn with_device_id(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        config: SyncConfig,
        device_id: DeviceId,
    ) -> SyncResult<Self> {
        let excludes = config.validate()?;
        let auto_sync = config.auto_sync;

        let engine = Self {
            inner: Arc::new(EngineInner {
                local,
                remote,
                device_id,
                config: RwLock::new(ConfigState {
                    config: SyncConfig {
                        auto_sync: false,
                        ..config
                    },
                    excludes,
                }),
                syncing: AtomicBool::new(false),
                conflicts: Mutex::new(Vec::new()),
                events: EventBus::new(),
                timer: Mutex::new(None),
                next_sync_at: Mutex::new(None),
            }),
        };

        if auto_sync {
            engine.start_auto_sync();
        }

        info!(device_id = %engine.inner.device_id, "Sync engine created");
        Ok(engine)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> SyncConfig {
        self.inner.config.read().config.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    pub fn is_auto_syncing(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Current engine state; queries the local store and the remote's
    /// reachability.
    pub async fn state(&self) -> SyncResult<EngineState> {
        let pending_count = self.inner.local.pending_changes().await?.len();
        let last_sync_at = self.inner.local.last_sync_time().await?;
        let is_online = self.inner.remote.is_online().await;

        Ok(EngineState {
            is_syncing: self.is_syncing(),
            is_enabled: self.inner.config.read().config.auto_sync,
            is_online,
            pending_count,
            conflict_count: self.inner.conflicts.lock().len(),
            last_sync_at,
            next_sync_at: *self.inner.next_sync_at.lock(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recording changes
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a local change and persist it as pending.
    ///
    /// Fails with [`SyncError::Excluded`] if the entity type matches an
    /// exclude pattern, and with [`SyncError::InvalidInput`] if a create or
    /// update carries no data. Nothing is persisted in either case.
    pub async fn record_change(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<ChangeRecord> {
        if self.inner.config.read().excludes.is_excluded(entity_type) {
            return Err(SyncError::Excluded(entity_type.to_string()));
        }
        if operation.requires_data() && data.is_none() {
            return Err(SyncError::InvalidInput(format!(
                "{operation} of {entity_type}:{entity_id} requires data"
            )));
        }

        let record = ChangeRecord::new(
            entity_type,
            entity_id,
            operation,
            data,
            self.inner.device_id.clone(),
        );
        self.inner.local.save_change(&record).await?;

        debug!(
            change_id = %record.id,
            entity = %record.key(),
            operation = %record.operation,
            "Recorded local change"
        );
        self.inner.events.emit(SyncEvent::ChangeCreated(record.clone()));
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync cycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one reconciliation cycle.
    ///
    /// Never returns an error: per-record failures are listed in the
    /// report, and anything unexpected yields [`SyncOutcome::Failed`]. The
    /// engine is idle again when this returns.
    pub async fn sync(&self) -> SyncOutcome {
        let Some(_guard) = SyncingGuard::acquire(&self.inner.syncing) else {
            debug!("Sync skipped: already in progress");
            return SyncOutcome::Skipped(SkipReason::AlreadyInProgress);
        };

        if !self.inner.remote.is_online().await {
            debug!("Sync skipped: offline");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        let started = Instant::now();
        info!("Sync cycle started");
        self.inner.events.emit(SyncEvent::SyncStarted);

        match self.run_cycle(started).await {
            Ok(report) => {
                info!(
                    status = ?report.status,
                    uploaded = report.uploaded,
                    downloaded = report.downloaded,
                    conflicts = report.conflicts,
                    errors = report.errors.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Sync cycle completed"
                );
                self.inner.events.emit(SyncEvent::SyncCompleted(report.clone()));
                SyncOutcome::Completed(report)
            }
            Err(e) => {
                let duration = started.elapsed();
                error!(error = %e, "Sync cycle failed");
                self.inner.events.emit(SyncEvent::SyncFailed {
                    error: e.to_string(),
                });
                SyncOutcome::Failed {
                    error: e.to_string(),
                    duration,
                }
            }
        }
    }

    async fn run_cycle(&self, started: Instant) -> SyncResult<SyncReport> {
        let inner = &self.inner;
        let config = self.config();
        let mut errors = Vec::new();

        let local_pending = inner.local.pending_changes().await?;
        let last_sync = inner.local.last_sync_time().await?;
        let remote_changes = inner.remote.changes_since(last_sync).await?;
        debug!(
            local = local_pending.len(),
            remote = remote_changes.len(),
            since = ?last_sync,
            "Fetched change sets"
        );

        let local_pending = self.screen_local(local_pending, &mut errors).await?;
        let remote_changes = screen_remote(remote_changes, &mut errors);

        let detection = detect_conflicts(&local_pending, &remote_changes);
        let conflict_count = detection.conflicts.len();
        if conflict_count > 0 {
            info!(count = conflict_count, strategy = ?config.conflict_resolution, "Conflicts detected");
            inner.events.emit(SyncEvent::SyncConflict {
                conflicts: detection.conflicts.clone(),
            });
        }

        let resolved = resolve_conflicts(&detection.conflicts, config.conflict_resolution);
        let hold = config.conflict_resolution == ConflictStrategy::Manual
            && config.manual_fallback == ManualFallback::Defer;
        let held_ids = self.requeue_conflicts(&resolved, hold);

        let mut upload: Vec<ChangeRecord> = detection
            .local_only
            .into_iter()
            .filter(|record| !held_ids.contains(&record.id))
            .collect();
        let mut download = detection.remote_only;
        // Remote winner id -> local loser id
        let mut losers: HashMap<ChangeId, ChangeId> = HashMap::new();

        for decision in &resolved {
            if hold && decision.deferred {
                continue;
            }
            match decision.resolution {
                Side::Local => upload.push(decision.conflict.local.clone()),
                Side::Remote => {
                    download.push(decision.conflict.remote.clone());
                    losers.insert(decision.conflict.remote.id, decision.conflict.local.id);
                }
            }
        }

        let uploaded = self.upload(&upload, config.batch_size, &mut errors).await?;
        let applied = self.download(&download, &mut errors).await;

        for (winner, loser) in &losers {
            if applied.contains(winner) {
                inner.local.delete_change(loser).await?;
            }
        }

        let synced_at = Utc::now();
        inner.local.set_last_sync_time(synced_at).await?;

        let status = if errors.is_empty() {
            CycleStatus::Success
        } else {
            CycleStatus::Partial
        };

        Ok(SyncReport {
            status,
            uploaded,
            downloaded: applied.len(),
            conflicts: conflict_count,
            errors,
            synced_at,
            duration: started.elapsed(),
        })
    }

    /// Drop local records whose payload no longer matches their checksum.
    ///
    /// They are marked failed so they stay visible for repair, but never
    /// reach the remote.
    async fn screen_local(
        &self,
        records: Vec<ChangeRecord>,
        errors: &mut Vec<SyncFailure>,
    ) -> SyncResult<Vec<ChangeRecord>> {
        let (intact, corrupted): (Vec<_>, Vec<_>) =
            records.into_iter().partition(ChangeRecord::verify_checksum);

        for record in corrupted {
            let message = SyncError::Corrupted(record.id.to_string()).to_string();
            warn!(change_id = %record.id, entity = %record.key(), "Local change failed checksum");
            self.inner
                .local
                .update_change_status(&record.id, ChangeStatus::Failed)
                .await?;
            self.inner.events.emit(SyncEvent::ChangeFailed {
                id: record.id,
                error: message.clone(),
            });
            errors.push(SyncFailure::Upload {
                change_ids: vec![record.id],
                message,
            });
        }

        Ok(intact)
    }

    /// Replace the conflict queue with this cycle's conflicts, carrying over
    /// held conflicts that were not superseded. Returns the local ids held
    /// back from upload.
    fn requeue_conflicts(
        &self,
        resolved: &[ResolvedConflict],
        hold: bool,
    ) -> HashSet<ChangeId> {
        let detected: HashSet<EntityKey> = resolved.iter().map(|r| r.conflict.key()).collect();

        let mut queue = self.inner.conflicts.lock();
        let mut next: Vec<QueuedConflict> = queue
            .drain(..)
            .filter(|queued| queued.held && !detected.contains(&queued.conflict.key()))
            .collect();
        next.extend(resolved.iter().map(|r| QueuedConflict {
            conflict: r.conflict.clone(),
            held: hold && r.deferred,
        }));
        *queue = next;

        queue
            .iter()
            .filter(|queued| queued.held)
            .map(|queued| queued.conflict.local.id)
            .collect()
    }

    /// Upload `records` in batches of `batch_size`; returns how many the
    /// remote acknowledged.
    async fn upload(
        &self,
        records: &[ChangeRecord],
        batch_size: usize,
        errors: &mut Vec<SyncFailure>,
    ) -> SyncResult<usize> {
        let local = &self.inner.local;
        let total = records.len();
        let mut uploaded = 0;

        for (index, batch) in records.chunks(batch_size.max(1)).enumerate() {
            let ids: Vec<ChangeId> = batch.iter().map(|r| r.id).collect();

            match self.push_batch(batch).await {
                Ok(result) => {
                    let batch_ids: HashSet<ChangeId> = ids.iter().copied().collect();
                    let mut settled = HashSet::new();

                    for id in result.successful {
                        if !batch_ids.contains(&id) || !settled.insert(id) {
                            continue;
                        }
                        local.update_change_status(&id, ChangeStatus::Synced).await?;
                        self.inner.events.emit(SyncEvent::ChangeSynced { id });
                        uploaded += 1;
                    }

                    for failure in result.failed {
                        let mut rejected = Vec::new();
                        for id in failure.change_ids {
                            if !batch_ids.contains(&id) || !settled.insert(id) {
                                continue;
                            }
                            local.update_change_status(&id, ChangeStatus::Failed).await?;
                            self.inner.events.emit(SyncEvent::ChangeFailed {
                                id,
                                error: failure.error.clone(),
                            });
                            rejected.push(id);
                        }
                        if !rejected.is_empty() {
                            warn!(count = rejected.len(), error = %failure.error, "Remote rejected changes");
                            errors.push(SyncFailure::Upload {
                                change_ids: rejected,
                                message: failure.error,
                            });
                        }
                    }

                    let unacknowledged: Vec<ChangeId> =
                        ids.iter().copied().filter(|id| !settled.contains(id)).collect();
                    if !unacknowledged.is_empty() {
                        warn!(count = unacknowledged.len(), batch = index, "Remote left changes unacknowledged");
                        self.reset_to_pending(&unacknowledged).await;
                        errors.push(SyncFailure::Upload {
                            change_ids: unacknowledged,
                            message: "no acknowledgement from remote".to_string(),
                        });
                    }
                }
                Err(e) => {
                    warn!(batch = index, size = ids.len(), error = %e, "Upload batch failed");
                    self.reset_to_pending(&ids).await;
                    errors.push(SyncFailure::Upload {
                        change_ids: ids,
                        message: e.to_string(),
                    });
                }
            }

            debug!(uploaded, total, "Upload progress");
            self.inner
                .events
                .emit(SyncEvent::SyncProgress { uploaded, total });
        }

        Ok(uploaded)
    }

    async fn push_batch(&self, batch: &[ChangeRecord]) -> SyncResult<PushResult> {
        for record in batch {
            self.inner
                .local
                .update_change_status(&record.id, ChangeStatus::Syncing)
                .await?;
        }
        self.inner.remote.push_changes(batch).await
    }

    async fn reset_to_pending(&self, ids: &[ChangeId]) {
        for id in ids {
            if let Err(e) = self
                .inner
                .local
                .update_change_status(id, ChangeStatus::Pending)
                .await
            {
                warn!(change_id = %id, error = %e, "Failed to reset change to pending");
            }
        }
    }

    /// Apply remote records in arrival order; returns the ids applied
    async fn download(
        &self,
        records: &[ChangeRecord],
        errors: &mut Vec<SyncFailure>,
    ) -> HashSet<ChangeId> {
        let mut applied = HashSet::with_capacity(records.len());
        for record in records {
            match self.inner.local.apply_change(record).await {
                Ok(()) => {
                    applied.insert(record.id);
                }
                Err(e) => {
                    warn!(change_id = %record.id, entity = %record.key(), error = %e, "Failed to apply remote change");
                    errors.push(SyncFailure::Download {
                        change_id: record.id,
                        message: e.to_string(),
                    });
                }
            }
        }
        applied
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conflicts
    // ═══════════════════════════════════════════════════════════════════════

    /// Conflicts from the most recent cycle, plus held conflicts from earlier
    /// cycles, that nobody has resolved yet
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner
            .conflicts
            .lock()
            .iter()
            .map(|queued| queued.conflict.clone())
            .collect()
    }

    /// Resolve the conflict at `index` in [`conflicts`](Self::conflicts).
    ///
    /// The chosen record is applied locally. Choosing remote discards the
    /// local record; if that record was already uploaded as a placeholder,
    /// the remote winner is re-recorded as a new pending change so other
    /// devices converge on it. Choosing local leaves the local record for
    /// upload. The conflict leaves the queue only once the store accepted
    /// the change.
    pub async fn resolve_conflict_manually(&self, index: usize, side: Side) -> SyncResult<()> {
        let conflict = self
            .inner
            .conflicts
            .lock()
            .get(index)
            .map(|queued| queued.conflict.clone())
            .ok_or_else(|| SyncError::ConflictNotFound(format!("index {index}")))?;
        self.settle(conflict, side).await
    }

    /// Resolve the queued conflict for `key`
    pub async fn resolve_conflict(&self, key: &EntityKey, side: Side) -> SyncResult<()> {
        let conflict = self
            .inner
            .conflicts
            .lock()
            .iter()
            .find(|queued| queued.conflict.key() == *key)
            .map(|queued| queued.conflict.clone())
            .ok_or_else(|| SyncError::ConflictNotFound(key.to_string()))?;
        self.settle(conflict, side).await
    }

    async fn settle(&self, conflict: Conflict, side: Side) -> SyncResult<()> {
        let local = &self.inner.local;
        local.apply_change(conflict.side(side)).await?;

        if side == Side::Remote {
            // A placeholder that already reached the remote is newer there
            // than the chosen winner, so the winner has to go up again
            let uploaded = local
                .changes()
                .await?
                .iter()
                .any(|r| r.id == conflict.local.id && r.sync_status == ChangeStatus::Synced);
            local.delete_change(&conflict.local.id).await?;

            if uploaded {
                let winner = &conflict.remote;
                let republished = ChangeRecord::new(
                    winner.entity_type.clone(),
                    winner.entity_id.clone(),
                    winner.operation,
                    winner.data.clone(),
                    self.inner.device_id.clone(),
                )
                .with_version(winner.version.max(conflict.local.version) + 1);
                local.save_change(&republished).await?;
                debug!(
                    change_id = %republished.id,
                    entity = %republished.key(),
                    "Re-recorded remote winner over uploaded placeholder"
                );
                self.inner.events.emit(SyncEvent::ChangeCreated(republished));
            }
        }

        self.inner.conflicts.lock().retain(|queued| {
            queued.conflict.local.id != conflict.local.id
                || queued.conflict.remote.id != conflict.remote.id
        });

        info!(entity = %conflict.key(), side = ?side, "Conflict resolved manually");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Auto sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Start periodic sync; the first cycle runs immediately.
    ///
    /// No effect if the timer already runs. Outside a Tokio runtime the
    /// timer cannot be spawned; a warning is logged and auto sync stays off.
    pub fn start_auto_sync(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            debug!("Auto sync already running");
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("Auto sync requested outside a Tokio runtime; call start_auto_sync from within one");
            self.inner.config.write().config.auto_sync = false;
            return;
        }

        let interval = {
            let mut state = self.inner.config.write();
            state.config.auto_sync = true;
            state.config.interval
        };
        *timer = Some(spawn_timer(Arc::downgrade(&self.inner), interval));
        info!(interval_ms = interval.as_millis() as u64, "Auto sync started");
    }

    /// Stop periodic sync. A cycle already running finishes normally.
    pub fn stop_auto_sync(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.cancel.cancel();
            info!("Auto sync stopped");
        }
        self.inner.config.write().config.auto_sync = false;
        *self.inner.next_sync_at.lock() = None;
    }

    /// Merge `update` into the configuration.
    ///
    /// The update is validated as a whole; on error nothing changes. Flipping
    /// `auto_sync` starts or stops the timer, and a new interval re-arms a
    /// running timer.
    pub fn update_config(&self, update: SyncConfigUpdate) -> SyncResult<()> {
        let change = {
            let mut state = self.inner.config.write();
            let mut next = state.config.clone();
            let change = next.apply(update);
            let excludes = next.validate()?;
            state.config = next;
            state.excludes = excludes;
            change
        };
        debug!(?change, "Configuration updated");

        match change.auto_sync {
            Some(true) => self.start_auto_sync(),
            Some(false) => self.stop_auto_sync(),
            None if change.interval_changed && self.is_auto_syncing() => {
                self.stop_auto_sync();
                self.start_auto_sync();
            }
            None => {}
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Events & lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: SyncEventKind, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Receive every event through a broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the timer and drop every listener
    pub fn shutdown(&self) {
        self.stop_auto_sync();
        self.inner.events.clear();
        info!(device_id = %self.inner.device_id, "Sync engine shut down");
    }
}

/// Drop remote records whose payload does not match their checksum
fn screen_remote(records: Vec<ChangeRecord>, errors: &mut Vec<SyncFailure>) -> Vec<ChangeRecord> {
    let (intact, corrupted): (Vec<_>, Vec<_>) =
        records.into_iter().partition(ChangeRecord::verify_checksum);

    for record in corrupted {
        warn!(change_id = %record.id, entity = %record.key(), "Remote change failed checksum");
        errors.push(SyncFailure::Download {
            change_id: record.id,
            message: SyncError::Corrupted(record.id.to_string()).to_string(),
        });
    }

    intact
}

fn spawn_timer(inner: Weak<EngineInner>, interval: Duration) -> AutoSyncTimer {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = inner.upgrade() else { break };
            *inner.next_sync_at.lock() = chrono::Duration::from_std(interval)
                .ok()
                .and_then(|step| Utc::now().checked_add_signed(step));

            let engine = SyncEngine { inner };
            let outcome = engine.sync().await;
            debug!(status = ?outcome.status(), "Auto sync tick finished");
        }
        debug!("Auto sync timer exited");
    });

    AutoSyncTimer {
        cancel,
        _handle: handle,
    }
}
