//! End-to-end sync cycle tests
//!
//! Engines over memory stores talking to a shared in-memory remote.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{engine_with, foreign_record, init_tracing, TestRemote};
use offsync_core::{
    ChangeStatus, ConflictStrategy, CycleStatus, EntityKey, LocalStore, ManualFallback, Operation,
    Side, SkipReason, SyncConfig, SyncConfigUpdate, SyncEvent, SyncEventKind, SyncFailure,
    SyncOutcome,
};
use parking_lot::Mutex;
use serde_json::json;

// ============================================================================
// Basic Cycles
// ============================================================================

#[tokio::test]
async fn test_latest_strategy_takes_newer_remote() {
    init_tracing();
    let remote = TestRemote::new();
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());

    let mine = engine
        .record_change("doc", "1", Operation::Update, Some(json!({"v": "local"})))
        .await
        .unwrap();
    let theirs = foreign_record("doc", "1", json!({"v": "remote"}))
        .with_timestamp(mine.timestamp + ChronoDuration::seconds(1));
    remote.seed(theirs.clone());

    let outcome = engine.sync().await;
    let report = outcome.report().expect("cycle completed");
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 1);

    assert_eq!(local.entity(&theirs.key()), Some(theirs));
    assert!(!local.contains_change(&mine.id));
    assert_eq!(remote.records().len(), 1);
}

#[tokio::test]
async fn test_latest_strategy_keeps_newer_local() {
    let remote = TestRemote::new();
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());

    let theirs = foreign_record("doc", "1", json!({"v": "remote"}))
        .with_timestamp(chrono::Utc::now() - ChronoDuration::minutes(5));
    remote.seed(theirs.clone());
    let mine = engine
        .record_change("doc", "1", Operation::Update, Some(json!({"v": "local"})))
        .await
        .unwrap();

    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.downloaded, 0);
    assert_eq!(local.status_of(&mine.id), Some(ChangeStatus::Synced));
    assert!(local.entity(&theirs.key()).is_none());
}

#[tokio::test]
async fn test_two_devices_exchange_changes() {
    let remote = TestRemote::new();
    let (alice, alice_store) = engine_with(&remote, "device_alice", SyncConfig::default());
    let (bob, bob_store) = engine_with(&remote, "device_bob", SyncConfig::default());

    for i in 0..3 {
        alice
            .record_change("task", &format!("a{i}"), Operation::Create, Some(json!({"i": i})))
            .await
            .unwrap();
    }
    for i in 0..2 {
        bob.record_change("task", &format!("b{i}"), Operation::Create, Some(json!({"i": i})))
            .await
            .unwrap();
    }

    assert_eq!(alice.sync().await.report().unwrap().uploaded, 3);
    let bob_report = bob.sync().await;
    let bob_report = bob_report.report().unwrap();
    assert_eq!(bob_report.uploaded, 2);
    assert_eq!(bob_report.downloaded, 3);
    let alice_report = alice.sync().await;
    assert_eq!(alice_report.report().unwrap().downloaded, 2);

    assert_eq!(alice_store.entity_count(), 2);
    assert_eq!(bob_store.entity_count(), 3);
    assert!(alice_store.entity(&EntityKey::new("task", "b1")).is_some());
    assert!(bob_store.entity(&EntityKey::new("task", "a2")).is_some());
}

#[tokio::test]
async fn test_delete_propagates() {
    let remote = TestRemote::new();
    let (alice, _) = engine_with(&remote, "device_alice", SyncConfig::default());
    let (bob, bob_store) = engine_with(&remote, "device_bob", SyncConfig::default());
    let key = EntityKey::new("task", "1");

    alice
        .record_change("task", "1", Operation::Create, Some(json!({"title": "x"})))
        .await
        .unwrap();
    alice.sync().await;
    bob.sync().await;
    assert!(bob_store.entity(&key).is_some());

    alice
        .record_change("task", "1", Operation::Delete, None)
        .await
        .unwrap();
    alice.sync().await;
    bob.sync().await;
    assert!(bob_store.entity(&key).is_none());
}

#[tokio::test]
async fn test_repeated_sync_is_idempotent() {
    let remote = TestRemote::new();
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());
    engine
        .record_change("note", "1", Operation::Create, Some(json!(1)))
        .await
        .unwrap();
    remote.seed(foreign_record("note", "2", json!(2)));

    engine.sync().await;
    let first_sync = local.last_sync_time().await.unwrap().unwrap();

    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 0);
    assert!(local.last_sync_time().await.unwrap().unwrap() >= first_sync);
    assert_eq!(remote.records().len(), 2);
    assert_eq!(local.entity_count(), 1);
}

// ============================================================================
// Batching & Upload Failures
// ============================================================================

#[tokio::test]
async fn test_uploads_are_batched() {
    let remote = TestRemote::new();
    let config = SyncConfig::default().with_batch_size(2);
    let (engine, _) = engine_with(&remote, "device_a", config);
    for i in 0..5 {
        engine
            .record_change("note", &i.to_string(), Operation::Create, Some(json!(i)))
            .await
            .unwrap();
    }

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let _sub = engine.on(SyncEventKind::SyncProgress, move |event| {
        if let SyncEvent::SyncProgress { uploaded, total } = event {
            seen.lock().push((*uploaded, *total));
        }
    });

    let outcome = engine.sync().await;
    assert_eq!(outcome.report().unwrap().uploaded, 5);
    assert_eq!(*remote.batch_sizes.lock(), vec![2, 2, 1]);
    assert_eq!(*progress.lock(), vec![(2, 5), (4, 5), (5, 5)]);
}

#[tokio::test]
async fn test_failed_batch_stays_pending_and_retries() {
    let remote = TestRemote::new();
    let config = SyncConfig::default().with_batch_size(2);
    let (engine, local) = engine_with(&remote, "device_a", config);
    let mut ids = Vec::new();
    for i in 0..4 {
        let record = engine
            .record_change("note", &i.to_string(), Operation::Create, Some(json!(i)))
            .await
            .unwrap();
        ids.push(record.id);
    }
    remote.fail_next_pushes(1);

    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.uploaded, 2);
    assert_eq!(
        report.errors,
        vec![SyncFailure::Upload {
            change_ids: ids[..2].to_vec(),
            message: "Remote error: connection reset".to_string(),
        }]
    );
    assert_eq!(local.status_of(&ids[0]), Some(ChangeStatus::Pending));
    assert_eq!(local.status_of(&ids[1]), Some(ChangeStatus::Pending));
    assert_eq!(local.status_of(&ids[2]), Some(ChangeStatus::Synced));

    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(report.uploaded, 2);
    assert!(local.pending_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unacknowledged_change_returns_to_pending() {
    let remote = TestRemote::new();
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());
    let record = engine
        .record_change("note", "1", Operation::Create, Some(json!(1)))
        .await
        .unwrap();
    remote.ignore(record.id);

    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!(report.uploaded, 0);
    assert!(matches!(
        &report.errors[..],
        [SyncFailure::Upload { change_ids, .. }] if change_ids == &vec![record.id]
    ));
    assert_eq!(local.status_of(&record.id), Some(ChangeStatus::Pending));
}

#[tokio::test]
async fn test_rejection_emits_change_failed() {
    let remote = TestRemote::new();
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());
    let record = engine
        .record_change("note", "1", Operation::Create, Some(json!(1)))
        .await
        .unwrap();
    remote.reject(record.id);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let seen = failures.clone();
    let _sub = engine.on(SyncEventKind::ChangeFailed, move |event| {
        if let SyncEvent::ChangeFailed { id, error } = event {
            seen.lock().push((*id, error.clone()));
        }
    });

    engine.sync().await;
    assert_eq!(
        *failures.lock(),
        vec![(record.id, "validation failed".to_string())]
    );
    assert_eq!(local.status_of(&record.id), Some(ChangeStatus::Failed));
    assert_eq!(engine.state().await.unwrap().pending_count, 1);
}

// ============================================================================
// Guards & Aborted Cycles
// ============================================================================

#[tokio::test]
async fn test_offline_cycle_touches_nothing() {
    let remote = TestRemote::new();
    remote.set_online(false);
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());
    engine
        .record_change("note", "1", Operation::Create, Some(json!(1)))
        .await
        .unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    let _sub = engine.on(SyncEventKind::SyncStart, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(engine.sync().await, SyncOutcome::Skipped(SkipReason::Offline));
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(remote.pull_count(), 0);
    assert!(local.last_sync_time().await.unwrap().is_none());
    assert_eq!(local.pending_changes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_sync_is_skipped() {
    let remote = TestRemote::new();
    let (engine, _) = engine_with(&remote, "device_a", SyncConfig::default());
    let gate = remote.hold_next_pull();

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.sync().await }
    });
    while remote.pull_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert!(engine.is_syncing());
    assert_eq!(
        engine.sync().await,
        SyncOutcome::Skipped(SkipReason::AlreadyInProgress)
    );

    gate.notify_one();
    let outcome = first.await.unwrap();
    assert_eq!(outcome.status(), CycleStatus::Success);
    assert!(!engine.is_syncing());
    assert_eq!(remote.pull_count(), 1);
}

#[tokio::test]
async fn test_pull_failure_fails_cycle_without_advancing() {
    let remote = TestRemote::new();
    let (engine, local) = engine_with(&remote, "device_a", SyncConfig::default());
    let record = engine
        .record_change("note", "1", Operation::Create, Some(json!(1)))
        .await
        .unwrap();
    remote.fail_next_pulls(1);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    let _sub = engine.on(SyncEventKind::SyncError, move |event| {
        if let SyncEvent::SyncFailed { error } = event {
            seen.lock().push(error.clone());
        }
    });

    let outcome = engine.sync().await;
    assert!(matches!(&outcome, SyncOutcome::Failed { error, .. } if error.contains("pull failed")));
    assert_eq!(errors.lock().len(), 1);
    assert!(!engine.is_syncing());
    assert!(local.last_sync_time().await.unwrap().is_none());
    assert_eq!(local.status_of(&record.id), Some(ChangeStatus::Pending));

    assert_eq!(engine.sync().await.status(), CycleStatus::Success);
    assert_eq!(local.status_of(&record.id), Some(ChangeStatus::Synced));
}

#[tokio::test]
async fn test_panicking_listener_does_not_break_cycle() {
    let remote = TestRemote::new();
    let (engine, _) = engine_with(&remote, "device_a", SyncConfig::default());
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();

    let _bad = engine.on(SyncEventKind::SyncStart, |_| panic!("listener bug"));
    let _good = engine.on(SyncEventKind::SyncComplete, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(engine.sync().await.status(), CycleStatus::Success);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Conflict Strategies
// ============================================================================

#[tokio::test]
async fn test_local_strategy_uploads_and_ignores_remote() {
    let remote = TestRemote::new();
    let config = SyncConfig::default().with_conflict_resolution(ConflictStrategy::Local);
    let (engine, local) = engine_with(&remote, "device_a", config);
    let mine = engine
        .record_change("doc", "1", Operation::Update, Some(json!("mine")))
        .await
        .unwrap();
    let theirs = foreign_record("doc", "1", json!("theirs"))
        .with_timestamp(mine.timestamp + ChronoDuration::hours(1));
    remote.seed(theirs.clone());

    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!((report.uploaded, report.downloaded), (1, 0));
    assert!(local.entity(&theirs.key()).is_none());
    assert_eq!(engine.conflicts().len(), 1);
    assert_eq!(engine.state().await.unwrap().conflict_count, 1);
}

#[tokio::test]
async fn test_manual_keep_local_then_override() {
    let remote = TestRemote::new();
    let config = SyncConfig::default().with_conflict_resolution(ConflictStrategy::Manual);
    let (engine, local) = engine_with(&remote, "device_a", config);
    let mine = engine
        .record_change("doc", "1", Operation::Update, Some(json!("mine")))
        .await
        .unwrap();
    let theirs = foreign_record("doc", "1", json!("theirs"));
    remote.seed(theirs.clone());

    let outcome = engine.sync().await;
    assert_eq!(outcome.report().unwrap().uploaded, 1);
    assert_eq!(local.status_of(&mine.id), Some(ChangeStatus::Synced));

    let conflicts = engine.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].remote.id, theirs.id);

    engine
        .resolve_conflict(&EntityKey::new("doc", "1"), Side::Remote)
        .await
        .unwrap();
    assert!(engine.conflicts().is_empty());
    assert_eq!(local.entity(&theirs.key()), Some(theirs));
    assert!(!local.contains_change(&mine.id));
    assert_eq!(local.pending_changes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_choosing_remote_over_uploaded_placeholder_converges() {
    let remote = TestRemote::new();
    let manual = SyncConfig::default().with_conflict_resolution(ConflictStrategy::Manual);
    let (alice, alice_store) = engine_with(&remote, "device_alice", manual);
    let (bob, bob_store) = engine_with(&remote, "device_bob", SyncConfig::default());
    let key = EntityKey::new("doc", "1");

    bob.record_change("doc", "1", Operation::Update, Some(json!("theirs")))
        .await
        .unwrap();
    assert_eq!(bob.sync().await.status(), CycleStatus::Success);

    let mine = alice
        .record_change("doc", "1", Operation::Update, Some(json!("mine")))
        .await
        .unwrap();
    alice.sync().await;
    assert_eq!(alice_store.status_of(&mine.id), Some(ChangeStatus::Synced));

    alice.resolve_conflict(&key, Side::Remote).await.unwrap();
    let pending = alice_store.pending_changes().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].data, Some(json!("theirs")));
    assert_eq!(pending[0].device_id.as_str(), "device_alice");

    assert_eq!(alice.sync().await.report().unwrap().uploaded, 1);
    bob.sync().await;

    assert_eq!(alice_store.entity(&key).unwrap().data, Some(json!("theirs")));
    assert_eq!(bob_store.entity(&key).unwrap().data, Some(json!("theirs")));
}

#[tokio::test]
async fn test_deferred_conflict_is_held_until_resolved() {
    let remote = TestRemote::new();
    let config = SyncConfig::default()
        .with_conflict_resolution(ConflictStrategy::Manual)
        .with_manual_fallback(ManualFallback::Defer);
    let (engine, local) = engine_with(&remote, "device_a", config);
    let mine = engine
        .record_change("doc", "1", Operation::Update, Some(json!("mine")))
        .await
        .unwrap();
    remote.seed(foreign_record("doc", "1", json!("theirs")));

    let outcome = engine.sync().await;
    assert_eq!(outcome.report().unwrap().uploaded, 0);

    // The remote change is no longer in the delta, but the conflict persists
    let outcome = engine.sync().await;
    let report = outcome.report().unwrap();
    assert_eq!((report.uploaded, report.conflicts), (0, 0));
    assert_eq!(engine.conflicts().len(), 1);
    assert_eq!(local.status_of(&mine.id), Some(ChangeStatus::Pending));

    engine.resolve_conflict_manually(0, Side::Local).await.unwrap();
    assert!(engine.conflicts().is_empty());
    assert_eq!(local.entity(&mine.key()), Some(mine.clone()));

    let outcome = engine.sync().await;
    assert_eq!(outcome.report().unwrap().uploaded, 1);
    assert_eq!(local.status_of(&mine.id), Some(ChangeStatus::Synced));
}

// ============================================================================
// Auto Sync
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_auto_sync_ticks_until_stopped() {
    let remote = TestRemote::new();
    let config = SyncConfig::default().with_interval(Duration::from_secs(10));
    let (engine, _) = engine_with(&remote, "device_a", config);

    engine.start_auto_sync();
    engine.start_auto_sync();
    assert!(engine.is_auto_syncing());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(remote.pull_count(), 1);
    let state = engine.state().await.unwrap();
    assert!(state.is_enabled);
    assert!(state.next_sync_at.is_some());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(remote.pull_count(), 2);

    engine.stop_auto_sync();
    assert!(!engine.is_auto_syncing());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.pull_count(), 2);

    let state = engine.state().await.unwrap();
    assert!(!state.is_enabled);
    assert!(state.next_sync_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_update_config_controls_timer() {
    let remote = TestRemote::new();
    let config = SyncConfig::default().with_interval(Duration::from_secs(10));
    let (engine, _) = engine_with(&remote, "device_a", config);

    engine
        .update_config(SyncConfigUpdate::new().auto_sync(true))
        .unwrap();
    assert!(engine.is_auto_syncing());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(remote.pull_count(), 1);

    // Re-arm with a shorter interval: ticks at +0, +2 and +4
    engine
        .update_config(SyncConfigUpdate::new().interval(Duration::from_secs(2)))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(remote.pull_count() >= 4);

    engine
        .update_config(SyncConfigUpdate::new().auto_sync(false))
        .unwrap();
    assert!(!engine.is_auto_syncing());
    let frozen = remote.pull_count();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(remote.pull_count(), frozen);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_timer_and_listeners() {
    let remote = TestRemote::new();
    let config = SyncConfig::default()
        .with_auto_sync(true)
        .with_interval(Duration::from_secs(10));
    let (engine, _) = engine_with(&remote, "device_a", config);
    assert!(engine.is_auto_syncing());

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let _sub = engine.on(SyncEventKind::SyncComplete, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    engine.shutdown();
    assert!(!engine.is_auto_syncing());
    engine.sync().await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}
