use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sb_core::settings::SettingsStore;
use sb_core::store::{DateRange, MemoryStore, Store};
use sb_core::types::{LogEntry, LogLevel, TaskType, UsageRecord};
use sb_daemon::sweeper::RetentionSweeper;
use sb_engine::UsageRecorder;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn sweeper_for(store: Arc<MemoryStore>) -> (RetentionSweeper, Arc<SettingsStore>) {
    let settings = Arc::new(SettingsStore::new(store.clone()));
    let recorder = Arc::new(UsageRecorder::new(store));
    (RetentionSweeper::new(recorder, settings.clone()), settings)
}

async fn seed(store: &MemoryStore, age: ChronoDuration) {
    let at = Utc::now() - age;
    store
        .append_usage(&UsageRecord::success(TaskType::TextGeneration, "openai", 120).at(at))
        .await
        .unwrap();
    store
        .append_log(&LogEntry::info("task completed").at(at))
        .await
        .unwrap();
}

#[tokio::test]
async fn sweep_on_empty_store_is_clean() {
    let store = Arc::new(MemoryStore::new());
    let (sweeper, _) = sweeper_for(store.clone());

    let report = sweeper.sweep_once(Utc::now()).await.expect("sweep should succeed");
    assert_eq!(report.cleanup_days, 30);
    assert_eq!(report.removed(), 0);
    assert!(store.recent_logs(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_drops_only_expired_rows() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, ChronoDuration::days(45)).await;
    seed(&store, ChronoDuration::days(2)).await;
    let (sweeper, _) = sweeper_for(store.clone());

    let now = Utc::now();
    let report = sweeper.sweep_once(now).await.unwrap();
    assert_eq!(report.usage_records, 1);
    assert_eq!(report.logs, 1);

    let all = DateRange::through(now - ChronoDuration::days(365), now);
    assert_eq!(store.scan_usage(all).await.unwrap().len(), 1);

    let info = store.recent_logs(Some(LogLevel::Info), 1).await.unwrap();
    assert!(info[0].message.starts_with("retention sweep removed 1 usage records"));
}

#[tokio::test]
async fn sweep_follows_saved_cleanup_days() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, ChronoDuration::days(10)).await;
    let (sweeper, settings) = sweeper_for(store.clone());

    assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap().removed(), 0);

    let updates = json!({"cleanup_days": 7});
    settings.save(updates.as_object().unwrap()).await.unwrap();

    let report = sweeper.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(report.cleanup_days, 7);
    assert_eq!(report.removed(), 2);
}

#[tokio::test]
async fn out_of_range_horizon_is_rejected_and_sweeps_continue() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, ChronoDuration::days(45)).await;
    let (sweeper, settings) = sweeper_for(store.clone());

    let updates = json!({"cleanup_days": 100_000_000});
    let err = settings.save(updates.as_object().unwrap()).await.unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(settings.current().await.cleanup_days, 30);

    let report = sweeper.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(report.cleanup_days, 30);
    assert_eq!(report.removed(), 2);
}

#[tokio::test]
async fn sweep_surfaces_store_failures() {
    let store = Arc::new(MemoryStore::new().failing_writes());
    let (sweeper, _) = sweeper_for(store);
    assert!(sweeper.sweep_once(Utc::now()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_cancel() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, ChronoDuration::days(90)).await;
    let (sweeper, _) = sweeper_for(store.clone());
    let sweeper = Arc::new(sweeper);

    let cancel = CancellationToken::new();
    let handle = {
        let sweeper = sweeper.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sweeper.run(Duration::from_secs(3600), cancel).await })
    };

    // The first tick fires immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let now = Utc::now();
    let all = DateRange::through(now - ChronoDuration::days(365), now);
    assert!(store.scan_usage(all).await.unwrap().is_empty());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweeper should stop")
        .unwrap();
}
