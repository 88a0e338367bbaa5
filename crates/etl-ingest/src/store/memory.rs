//! In-memory store
//!
//! Mirrors the Postgres semantics closely enough for orchestrator tests:
//! hash-deduplicated raw appends, all-or-nothing upserts and atomic
//! checkpoint advances.

use async_trait::async_trait;
use chrono::Utc;
use etl_common::{EtlError, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CheckpointStore, ItemStore, RawRecordStore, RunStore};
use crate::models::{
    Checkpoint, CheckpointAdvance, NewRawRecord, NormalizedItem, RawRecord, Run, RunCompletion,
    RunStatus, SourceKind, UnifiedItem, WatermarkType,
};

type SourceKey = (SourceKind, String);
type ItemKey = (SourceKind, String, String);

#[derive(Default)]
struct State {
    checkpoints: HashMap<SourceKey, Checkpoint>,
    raw_records: Vec<RawRecord>,
    items: HashMap<ItemKey, UnifiedItem>,
    runs: Vec<Run>,
    next_checkpoint_id: i64,
    next_raw_id: i64,
    next_item_id: i64,
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unified item, ordered by id.
    pub async fn items(&self) -> Vec<UnifiedItem> {
        let state = self.state.lock().await;
        let mut items: Vec<UnifiedItem> = state.items.values().cloned().collect();
        items.sort_by_key(|item| item.id);
        items
    }

    /// Every raw record, processed or not.
    pub async fn raw_records(&self) -> Vec<RawRecord> {
        self.state.lock().await.raw_records.clone()
    }

    /// Overwrite a checkpoint, e.g. to simulate a crashed run.
    pub async fn put_checkpoint(&self, checkpoint: Checkpoint) {
        let mut state = self.state.lock().await;
        let key = (checkpoint.source_kind, checkpoint.source_name.clone());
        state.checkpoints.insert(key, checkpoint);
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get_checkpoint(&self, kind: SourceKind, name: &str) -> Result<Option<Checkpoint>> {
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(&(kind, name.to_string())).cloned())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let state = self.state.lock().await;
        let mut checkpoints: Vec<Checkpoint> = state.checkpoints.values().cloned().collect();
        checkpoints.sort_by(|a, b| {
            (a.source_kind.as_str(), &a.source_name).cmp(&(b.source_kind.as_str(), &b.source_name))
        });
        Ok(checkpoints)
    }

    async fn mark_running(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_type: WatermarkType,
    ) -> Result<Checkpoint> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.next_checkpoint_id += 1;
        let next_id = state.next_checkpoint_id;

        let checkpoint = state
            .checkpoints
            .entry((kind, name.to_string()))
            .or_insert_with(|| Checkpoint {
                id: next_id,
                source_kind: kind,
                source_name: name.to_string(),
                watermark_type,
                watermark_value: None,
                status: RunStatus::Pending,
                total_runs: 0,
                total_records_processed: 0,
                last_records_processed: 0,
                last_run_at: None,
                last_success_at: None,
                last_failure_at: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            });

        checkpoint.status = RunStatus::Running;
        checkpoint.last_run_at = Some(now);
        checkpoint.updated_at = now;
        Ok(checkpoint.clone())
    }

    async fn advance(&self, update: CheckpointAdvance) -> Result<Checkpoint> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.next_checkpoint_id += 1;
        let next_id = state.next_checkpoint_id;

        let checkpoint = state
            .checkpoints
            .entry((update.source_kind, update.source_name.clone()))
            .or_insert_with(|| Checkpoint {
                id: next_id,
                source_kind: update.source_kind,
                source_name: update.source_name.clone(),
                watermark_type: update.watermark_type,
                watermark_value: None,
                status: RunStatus::Pending,
                total_runs: 0,
                total_records_processed: 0,
                last_records_processed: 0,
                last_run_at: None,
                last_success_at: None,
                last_failure_at: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            });

        checkpoint.watermark_type = update.watermark_type;
        checkpoint.watermark_value = update.watermark_value;
        checkpoint.status = update.status;
        checkpoint.total_runs += 1;
        checkpoint.total_records_processed += update.records_processed;
        checkpoint.last_records_processed = update.records_processed;
        checkpoint.last_run_at = Some(now);
        checkpoint.error_message = update.error_message;
        checkpoint.updated_at = now;
        match update.status {
            RunStatus::Success => checkpoint.last_success_at = Some(now),
            RunStatus::Failed => checkpoint.last_failure_at = Some(now),
            _ => {},
        }

        Ok(checkpoint.clone())
    }
}

#[async_trait]
impl RawRecordStore for MemoryStore {
    async fn append_raw(
        &self,
        kind: SourceKind,
        name: &str,
        run_id: Uuid,
        records: Vec<NewRawRecord>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut written = 0u64;

        for record in records {
            let duplicate = state.raw_records.iter().any(|existing| {
                !existing.processed
                    && existing.source_kind == kind
                    && existing.source_name == name
                    && existing.content_hash == record.content_hash
            });
            if duplicate {
                continue;
            }

            state.next_raw_id += 1;
            let id = state.next_raw_id;
            state.raw_records.push(RawRecord {
                id,
                source_kind: kind,
                source_name: name.to_string(),
                source_id: record.source_id,
                payload: record.payload,
                content_hash: record.content_hash,
                ingested_at: now,
                processed: false,
                processed_at: None,
                run_id,
            });
            written += 1;
        }

        Ok(written)
    }

    async fn fetch_unprocessed(
        &self,
        kind: SourceKind,
        name: &str,
        limit: i64,
    ) -> Result<Vec<RawRecord>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(state
            .raw_records
            .iter()
            .filter(|r| !r.processed && r.source_kind == kind && r.source_name == name)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut updated = 0u64;
        for record in state.raw_records.iter_mut() {
            if !record.processed && ids.contains(&record.id) {
                record.processed = true;
                record.processed_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_unprocessed(&self, kind: SourceKind, name: &str) -> Result<i64> {
        let state = self.state.lock().await;
        let count = state
            .raw_records
            .iter()
            .filter(|r| !r.processed && r.source_kind == kind && r.source_name == name)
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn upsert_items(&self, items: &[NormalizedItem], run_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for item in items {
            let key = (item.source_kind, item.source_name.clone(), item.external_id.clone());
            let (id, created_at) = match state.items.get(&key) {
                Some(existing) => (existing.id, existing.created_at),
                None => {
                    state.next_item_id += 1;
                    (state.next_item_id, now)
                },
            };

            state.items.insert(
                key,
                UnifiedItem {
                    id,
                    source_kind: item.source_kind,
                    source_name: item.source_name.clone(),
                    external_id: item.external_id.clone(),
                    raw_record_id: Some(item.raw_record_id),
                    title: item.title.clone(),
                    description: item.description.clone(),
                    category: item.category.clone(),
                    url: item.url.clone(),
                    image_url: item.image_url.clone(),
                    author: item.author.clone(),
                    amount: item.amount,
                    quantity: item.quantity,
                    rating: item.rating,
                    tags: item.tags.clone(),
                    metadata: serde_json::Value::Object(item.metadata.clone()),
                    status: item.status,
                    published_at: item.published_at,
                    created_at,
                    updated_at: now,
                    run_id: Some(run_id),
                },
            );
        }

        Ok(items.len() as u64)
    }

    async fn get_item(
        &self,
        kind: SourceKind,
        name: &str,
        external_id: &str,
    ) -> Result<Option<UnifiedItem>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .get(&(kind, name.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn count_items(&self, kind: SourceKind, name: &str) -> Result<i64> {
        let state = self.state.lock().await;
        let count = state
            .items
            .keys()
            .filter(|(k, n, _)| *k == kind && n == name)
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn start_run(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_before: Option<String>,
    ) -> Result<Run> {
        let mut state = self.state.lock().await;
        let run = Run {
            run_id: Uuid::new_v4(),
            source_kind: kind,
            source_name: name.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_secs: None,
            records_extracted: 0,
            records_transformed: 0,
            records_loaded: 0,
            records_failed: 0,
            watermark_before,
            watermark_after: None,
            error_message: None,
            error_details: None,
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn finish_run(&self, completion: RunCompletion) -> Result<Run> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|run| run.run_id == completion.run_id)
            .ok_or_else(|| {
                EtlError::checkpoint("Run not found").with_context("run_id", completion.run_id)
            })?;

        let now = Utc::now();
        run.status = completion.status;
        run.completed_at = Some(now);
        run.duration_secs = Some((now - run.started_at).num_milliseconds() as f64 / 1000.0);
        run.records_extracted = completion.records_extracted;
        run.records_transformed = completion.records_transformed;
        run.records_loaded = completion.records_loaded;
        run.records_failed = completion.records_failed;
        run.watermark_after = completion.watermark_after;
        run.error_message = completion.error_message;
        run.error_details = if completion.error_details.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&completion.error_details).map_err(|e| {
                EtlError::checkpoint("Failed to serialize error details").with_source(e)
            })?)
        };

        Ok(run.clone())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|run| run.run_id == run_id).cloned())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }
}
