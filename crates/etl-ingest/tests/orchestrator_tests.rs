//! End-to-end orchestrator behaviour against the in-memory store

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{init_test_tracing, FlakyStore, ScriptedSource};
use etl_common::{Cause, ErrorKind, EtlError};
use etl_ingest::models::{RunStatus, SourceKind, WatermarkType};
use etl_ingest::store::{CheckpointStore, ItemStore, RawRecordStore, RunStore};
use etl_ingest::RunOrchestrator;
use serde_json::json;
use std::sync::Arc;

const SOURCE: &str = "catalog";

fn setup() -> (Arc<FlakyStore>, RunOrchestrator<FlakyStore>) {
    init_test_tracing();
    let store = Arc::new(FlakyStore::new());
    let orchestrator = RunOrchestrator::new(store.clone());
    (store, orchestrator)
}

#[tokio::test]
async fn test_end_to_end_two_records_then_no_new_data() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE).then_return(vec![
        json!({ "id": "1", "name": "A", "price": 10 }),
        json!({ "id": "2", "name": "B", "price": 20 }),
    ]);

    let first = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.records_extracted, 2);
    assert_eq!(first.records_loaded, 2);
    assert_eq!(first.records_failed, 0);
    assert_eq!(first.watermark_before, None);
    assert_eq!(first.watermark_after.as_deref(), Some("2"));

    let a = store.get_item(SourceKind::Api, SOURCE, "1").await.unwrap().unwrap();
    let b = store.get_item(SourceKind::Api, SOURCE, "2").await.unwrap().unwrap();
    assert_eq!(a.title, "A");
    assert_eq!(a.amount, Some(10.0));
    assert_eq!(b.title, "B");
    assert_eq!(b.amount, Some(20.0));

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark(), Some("2"));
    assert_eq!(checkpoint.status, RunStatus::Success);

    let items_before = store.items().await;

    let second = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.records_extracted, 0);
    assert_eq!(second.records_loaded, 0);
    assert_eq!(second.watermark_after.as_deref(), Some("2"));
    assert_eq!(source.requested, vec![None, Some("2".to_string())]);

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark(), Some("2"));
    assert_eq!(checkpoint.total_runs, 2);
    assert_eq!(checkpoint.total_records_processed, 2);
    assert_eq!(store.items().await, items_before);
}

#[tokio::test]
async fn test_rerun_of_same_records_is_idempotent() {
    let (store, orchestrator) = setup();
    let batch = vec![
        json!({ "id": "1", "name": "A", "price": 10 }),
        json!({ "id": "2", "name": "B", "price": 20 }),
    ];
    let mut source = ScriptedSource::new(SOURCE)
        .then_return(batch.clone())
        .then_return(batch);

    orchestrator.run(&mut source).await.unwrap();
    let first_items = store.items().await;

    let second = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(second.records_loaded, 2);

    let second_items = store.items().await;
    assert_eq!(second_items.len(), 2);
    for (before, after) in first_items.iter().zip(&second_items) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.external_id, after.external_id);
        assert_eq!(before.title, after.title);
        assert_eq!(before.amount, after.amount);
    }
}

#[tokio::test]
async fn test_load_failure_leaves_checkpoint_unchanged() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE)
        .then_return(vec![json!({ "id": "1", "name": "A" })])
        .then_return(vec![json!({ "id": "2", "name": "B" })]);

    orchestrator.run(&mut source).await.unwrap();

    store.fail_upsert(true);
    let err = orchestrator.run(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Load);
    assert_eq!(err.context_value("source_name"), Some(SOURCE));
    assert!(err.context_value("run_id").is_some());

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark(), Some("1"));
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert!(checkpoint.last_failure_at.is_some());
    assert!(checkpoint.error_message.is_some());

    let runs = store.recent_runs(1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].watermark_after.as_deref(), Some("1"));
    assert!(runs[0].error_message.is_some());

    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 1);
    assert_eq!(store.count_items(SourceKind::Api, SOURCE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_resume_after_load_failure_without_duplication() {
    let (store, orchestrator) = setup();
    let batch = vec![
        json!({ "id": "1", "name": "A", "price": 10 }),
        json!({ "id": "2", "name": "B", "price": 20 }),
    ];
    // The checkpoint does not move on failure, so the upstream replays the batch.
    let mut source = ScriptedSource::new(SOURCE)
        .then_return(batch.clone())
        .then_return(batch);

    store.fail_upsert(true);
    assert!(orchestrator.run(&mut source).await.is_err());
    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 2);
    assert_eq!(store.count_items(SourceKind::Api, SOURCE).await.unwrap(), 0);

    store.fail_upsert(false);
    let summary = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.records_extracted, 2);
    assert_eq!(summary.records_loaded, 2);
    assert_eq!(source.requested, vec![None, None]);

    // Replayed payloads were not stored a second time.
    assert_eq!(store.raw_records().await.len(), 2);
    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 0);

    let mut ids: Vec<String> = store.items().await.into_iter().map(|i| i.external_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "2"]);
}

#[tokio::test]
async fn test_normalization_failures_make_run_partial() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE).then_return(vec![
        json!({ "id": "1", "name": "Good", "price": 5 }),
        json!({ "id": "2", "price": 7 }),
        json!({ "id": "3", "name": "Negative", "price": -1 }),
    ]);

    let summary = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.records_extracted, 3);
    assert_eq!(summary.records_transformed, 1);
    assert_eq!(summary.records_loaded, 1);
    assert_eq!(summary.records_failed, 2);
    assert_eq!(summary.failures.len(), 2);
    assert_eq!(summary.watermark_after.as_deref(), Some("3"));

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark(), Some("3"));
    assert_eq!(checkpoint.status, RunStatus::Partial);
    assert_eq!(checkpoint.last_records_processed, 1);
    assert!(checkpoint.last_success_at.is_none());

    let run = store.get_run(summary.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.records_failed, 2);
    let details = run.error_details.unwrap();
    assert_eq!(details.as_array().unwrap().len(), 2);

    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_records_are_retried_by_the_next_sweep() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE)
        .then_return(vec![json!({ "id": "1" })])
        .then_return(vec![json!({ "id": "2", "name": "B" })]);

    let first = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(first.status, RunStatus::Partial);

    let second = orchestrator.run(&mut source).await.unwrap();
    // The untitled record is swept again and fails again.
    assert_eq!(second.records_loaded, 1);
    assert_eq!(second.records_failed, 1);
    assert_eq!(second.failures[0].raw_record_id, first.failures[0].raw_record_id);
}

#[tokio::test]
async fn test_error_details_are_bounded() {
    init_test_tracing();
    let store = Arc::new(FlakyStore::new());
    let orchestrator = RunOrchestrator::new(store.clone()).with_max_error_details(2);
    let payloads = (1..=5).map(|i| json!({ "id": i.to_string() })).collect();
    let mut source = ScriptedSource::new(SOURCE).then_return(payloads);

    let summary = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(summary.records_failed, 5);
    assert_eq!(summary.failures.len(), 2);
}

#[tokio::test]
async fn test_extraction_failure_runs_no_further_phases() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE)
        .then_fail(EtlError::authentication("HTTP 401").with_context("status", 401));

    let err = orchestrator.run(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Extraction);
    assert_eq!(err.cause(), &Cause::Authentication);
    assert!(!err.is_retryable());
    assert_eq!(err.context_value("records_extracted"), Some("0"));

    assert!(store.raw_records().await.is_empty());
    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert_eq!(checkpoint.watermark(), None);
    assert_eq!(checkpoint.total_records_processed, 0);

    let runs = store.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].completed_at.is_some());
}

#[tokio::test]
async fn test_raw_append_failure_fails_run() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE).then_return(vec![json!({ "id": "1", "name": "A" })]);

    store.fail_append(true);
    let err = orchestrator.run(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Load);
    assert_eq!(err.context_value("records_extracted"), Some("1"));
    assert_eq!(store.count_items(SourceKind::Api, SOURCE).await.unwrap(), 0);

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark(), None);
}

#[tokio::test]
async fn test_checkpoint_advance_failure_is_reported() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE).then_return(vec![json!({ "id": "1", "name": "A" })]);

    store.fail_advance(true);
    let err = orchestrator.run(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checkpoint);
    assert_eq!(err.context_value("source_name"), Some(SOURCE));
    assert_eq!(err.context_value("records_loaded"), Some("1"));

    // Items were committed before the checkpoint write failed.
    assert_eq!(store.count_items(SourceKind::Api, SOURCE).await.unwrap(), 1);

    // The run was first written as a success, then finalized as failed.
    let runs = store.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error_message.is_some());
    assert_eq!(runs[0].watermark_after, None);
}

#[tokio::test]
async fn test_finish_run_failure_fails_run() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE).then_return(vec![json!({ "id": "1", "name": "A" })]);

    store.fail_finish(true);
    let err = orchestrator.run(&mut source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checkpoint);
    assert_eq!(err.context_value("source_name"), Some(SOURCE));
    assert!(err.context_value("run_id").is_some());

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert!(!checkpoint.is_running());
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert_eq!(checkpoint.watermark(), None);
    assert!(checkpoint.last_failure_at.is_some());

    // Once the store recovers the next run picks up from the old watermark.
    store.fail_finish(false);
    source.push(vec![json!({ "id": "1", "name": "A" })]);
    let summary = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(source.requested, vec![None, None]);
    assert_eq!(store.count_items(SourceKind::Api, SOURCE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_sweep_limit_bounds_each_run() {
    init_test_tracing();
    let store = Arc::new(FlakyStore::new());
    let orchestrator = RunOrchestrator::new(store.clone()).with_sweep_limit(2);
    let payloads = (1..=5)
        .map(|i| json!({ "id": i.to_string(), "name": format!("Item {}", i) }))
        .collect();
    let mut source = ScriptedSource::new(SOURCE)
        .then_return(payloads)
        .then_return(vec![json!({ "id": "6", "name": "Item 6" })])
        .then_return(vec![json!({ "id": "7", "name": "Item 7" })]);

    let first = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.records_extracted, 5);
    assert_eq!(first.records_loaded, 2);
    assert_eq!(first.watermark_after.as_deref(), Some("5"));
    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 3);

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark(), Some("5"));

    // Oldest rows go first; the new payload waits its turn.
    let second = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(second.records_loaded, 2);
    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 2);

    let third = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(third.records_loaded, 2);
    assert_eq!(third.watermark_after.as_deref(), Some("7"));
    assert_eq!(store.count_unprocessed(SourceKind::Api, SOURCE).await.unwrap(), 1);

    assert_eq!(source.requested, vec![None, Some("5".to_string()), Some("6".to_string())]);
    assert_eq!(store.count_items(SourceKind::Api, SOURCE).await.unwrap(), 6);
}

#[tokio::test]
async fn test_timestamp_watermark_never_regresses() {
    let (store, orchestrator) = setup();
    let mut source = ScriptedSource::new(SOURCE)
        .with_watermark_type(WatermarkType::Timestamp)
        .then_return(vec![
            json!({ "id": "1", "name": "A", "created_at": "2024-03-01T10:00:00Z" }),
            json!({ "id": "2", "name": "B", "created_at": "2024-03-02T10:00:00Z" }),
        ])
        .then_return(vec![
            json!({ "id": "3", "name": "C", "created_at": "2024-02-01T00:00:00Z" }),
        ]);

    let first = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(first.watermark_after.as_deref(), Some("2024-03-02T10:00:00Z"));

    let second = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(second.watermark_after.as_deref(), Some("2024-03-02T10:00:00Z"));
    assert_eq!(
        source.requested[1].as_deref(),
        Some("2024-03-02T10:00:00Z")
    );

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark_type, WatermarkType::Timestamp);
}

#[tokio::test]
async fn test_interrupted_run_is_resumed() {
    let (store, orchestrator) = setup();
    store
        .mark_running(SourceKind::Api, SOURCE, WatermarkType::Id)
        .await
        .unwrap();

    let mut source = ScriptedSource::new(SOURCE).then_return(vec![json!({ "id": "7", "name": "G" })]);
    let summary = orchestrator.run(&mut source).await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);

    let checkpoint = store.get_checkpoint(SourceKind::Api, SOURCE).await.unwrap().unwrap();
    assert!(!checkpoint.is_running());
    assert_eq!(checkpoint.watermark(), Some("7"));
}
