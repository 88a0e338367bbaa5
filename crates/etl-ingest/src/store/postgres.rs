//! Postgres store
//!
//! Runtime-checked queries against the schema in `migrations/`. Every trait
//! method is a single statement or its own transaction.

use async_trait::async_trait;
use etl_common::{EtlError, Result};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use super::{CheckpointStore, ItemStore, RawRecordStore, RunStore};
use crate::models::{
    Checkpoint, CheckpointAdvance, NewRawRecord, NormalizedItem, RawRecord, Run, RunCompletion,
    SourceKind, UnifiedItem, WatermarkType,
};

fn checkpoint_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> EtlError {
    move |e| {
        EtlError::checkpoint("Checkpoint query failed")
            .with_context("operation", operation)
            .with_source(e)
    }
}

fn load_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> EtlError {
    move |e| {
        EtlError::load("Load query failed")
            .with_context("operation", operation)
            .with_source(e)
    }
}

/// Store backed by a Postgres connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn get_checkpoint(&self, kind: SourceKind, name: &str) -> Result<Option<Checkpoint>> {
        sqlx::query_as::<_, Checkpoint>(
            "SELECT * FROM etl_checkpoints WHERE source_kind = $1 AND source_name = $2",
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(checkpoint_err("get_checkpoint"))
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        sqlx::query_as::<_, Checkpoint>(
            "SELECT * FROM etl_checkpoints ORDER BY source_kind, source_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(checkpoint_err("list_checkpoints"))
    }

    async fn mark_running(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_type: WatermarkType,
    ) -> Result<Checkpoint> {
        sqlx::query_as::<_, Checkpoint>(
            r#"
            INSERT INTO etl_checkpoints (source_kind, source_name, watermark_type, status, last_run_at)
            VALUES ($1, $2, $3, 'running', NOW())
            ON CONFLICT (source_kind, source_name)
            DO UPDATE SET
                status = 'running',
                last_run_at = NOW(),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(watermark_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(checkpoint_err("mark_running"))
    }

    async fn advance(&self, update: CheckpointAdvance) -> Result<Checkpoint> {
        sqlx::query_as::<_, Checkpoint>(
            r#"
            INSERT INTO etl_checkpoints (
                source_kind,
                source_name,
                watermark_type,
                watermark_value,
                status,
                total_runs,
                total_records_processed,
                last_records_processed,
                last_run_at,
                last_success_at,
                last_failure_at,
                error_message
            )
            VALUES (
                $1, $2, $3, $4, $5::text, 1, $6::bigint, $6::bigint, NOW(),
                CASE WHEN $5::text = 'success' THEN NOW() END,
                CASE WHEN $5::text = 'failed' THEN NOW() END,
                $7
            )
            ON CONFLICT (source_kind, source_name)
            DO UPDATE SET
                watermark_type = EXCLUDED.watermark_type,
                watermark_value = EXCLUDED.watermark_value,
                status = EXCLUDED.status,
                total_runs = etl_checkpoints.total_runs + 1,
                total_records_processed =
                    etl_checkpoints.total_records_processed + EXCLUDED.last_records_processed,
                last_records_processed = EXCLUDED.last_records_processed,
                last_run_at = NOW(),
                last_success_at = COALESCE(EXCLUDED.last_success_at, etl_checkpoints.last_success_at),
                last_failure_at = COALESCE(EXCLUDED.last_failure_at, etl_checkpoints.last_failure_at),
                error_message = EXCLUDED.error_message,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(update.source_kind.as_str())
        .bind(&update.source_name)
        .bind(update.watermark_type.as_str())
        .bind(&update.watermark_value)
        .bind(update.status.as_str())
        .bind(update.records_processed)
        .bind(&update.error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(checkpoint_err("advance"))
    }
}

#[async_trait]
impl RawRecordStore for PgStore {
    async fn append_raw(
        &self,
        kind: SourceKind,
        name: &str,
        run_id: Uuid,
        records: Vec<NewRawRecord>,
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(load_err("append_raw"))?;
        let mut written = 0u64;

        for record in &records {
            let result = sqlx::query(
                r#"
                INSERT INTO raw_records (source_kind, source_name, source_id, payload, content_hash, run_id)
                SELECT $1, $2, $3, $4, $5, $6
                WHERE NOT EXISTS (
                    SELECT 1 FROM raw_records
                    WHERE source_kind = $1
                      AND source_name = $2
                      AND content_hash = $5
                      AND NOT processed
                )
                "#,
            )
            .bind(kind.as_str())
            .bind(name)
            .bind(&record.source_id)
            .bind(&record.payload)
            .bind(&record.content_hash)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(load_err("append_raw"))?;

            written += result.rows_affected();
        }

        tx.commit().await.map_err(load_err("append_raw"))?;

        debug!(
            source_kind = %kind,
            source_name = name,
            written,
            skipped = records.len() as u64 - written,
            "Appended raw records"
        );
        Ok(written)
    }

    async fn fetch_unprocessed(
        &self,
        kind: SourceKind,
        name: &str,
        limit: i64,
    ) -> Result<Vec<RawRecord>> {
        sqlx::query_as::<_, RawRecord>(
            r#"
            SELECT * FROM raw_records
            WHERE source_kind = $1 AND source_name = $2 AND NOT processed
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(load_err("fetch_unprocessed"))
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE raw_records
            SET processed = TRUE, processed_at = NOW()
            WHERE id = ANY($1) AND NOT processed
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(load_err("mark_processed"))?;

        Ok(result.rows_affected())
    }

    async fn count_unprocessed(&self, kind: SourceKind, name: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM raw_records
            WHERE source_kind = $1 AND source_name = $2 AND NOT processed
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(load_err("count_unprocessed"))
    }
}

/// Keep the last occurrence of each item key, preserving input order.
///
/// A single `INSERT .. ON CONFLICT DO UPDATE` may not touch the same row twice.
fn last_per_key(items: &[NormalizedItem]) -> Vec<&NormalizedItem> {
    let mut latest: HashMap<(SourceKind, &str, &str), usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        latest.insert(
            (item.source_kind, item.source_name.as_str(), item.external_id.as_str()),
            index,
        );
    }

    let mut keep: Vec<usize> = latest.into_values().collect();
    keep.sort_unstable();
    keep.into_iter().map(|index| &items[index]).collect()
}

#[async_trait]
impl ItemStore for PgStore {
    /// One multi-row upsert statement, so the batch is atomic. Callers bound
    /// the slice size (see `Loader`) to stay under the bind parameter limit.
    async fn upsert_items(&self, items: &[NormalizedItem], run_id: Uuid) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }

        let unique = last_per_key(items);

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO unified_items (
                source_kind, source_name, external_id, raw_record_id, title, description,
                category, url, image_url, author, amount, quantity, rating, tags, metadata,
                status, published_at, run_id
            )
            "#,
        );

        builder.push_values(unique.iter(), |mut row, item| {
            row.push_bind(item.source_kind.as_str())
                .push_bind(item.source_name.as_str())
                .push_bind(item.external_id.as_str())
                .push_bind(item.raw_record_id)
                .push_bind(item.title.as_str())
                .push_bind(item.description.as_deref())
                .push_bind(item.category.as_deref())
                .push_bind(item.url.as_deref())
                .push_bind(item.image_url.as_deref())
                .push_bind(item.author.as_deref())
                .push_bind(item.amount)
                .push_bind(item.quantity)
                .push_bind(item.rating)
                .push_bind(Json(&item.tags))
                .push_bind(Json(&item.metadata))
                .push_bind(item.status.as_str())
                .push_bind(item.published_at)
                .push_bind(run_id);
        });

        builder.push(
            r#"
            ON CONFLICT (source_kind, source_name, external_id)
            DO UPDATE SET
                raw_record_id = EXCLUDED.raw_record_id,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                category = EXCLUDED.category,
                url = EXCLUDED.url,
                image_url = EXCLUDED.image_url,
                author = EXCLUDED.author,
                amount = EXCLUDED.amount,
                quantity = EXCLUDED.quantity,
                rating = EXCLUDED.rating,
                tags = EXCLUDED.tags,
                metadata = EXCLUDED.metadata,
                status = EXCLUDED.status,
                published_at = EXCLUDED.published_at,
                run_id = EXCLUDED.run_id,
                updated_at = NOW()
            "#,
        );

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| load_err("upsert_items")(e).with_context("items", items.len()))?;

        Ok(items.len() as u64)
    }

    async fn get_item(
        &self,
        kind: SourceKind,
        name: &str,
        external_id: &str,
    ) -> Result<Option<UnifiedItem>> {
        sqlx::query_as::<_, UnifiedItem>(
            r#"
            SELECT * FROM unified_items
            WHERE source_kind = $1 AND source_name = $2 AND external_id = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(load_err("get_item"))
    }

    async fn count_items(&self, kind: SourceKind, name: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM unified_items WHERE source_kind = $1 AND source_name = $2",
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(load_err("count_items"))
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn start_run(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_before: Option<String>,
    ) -> Result<Run> {
        sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO etl_runs (run_id, source_kind, source_name, status, watermark_before)
            VALUES ($1, $2, $3, 'running', $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(name)
        .bind(watermark_before)
        .fetch_one(&self.pool)
        .await
        .map_err(checkpoint_err("start_run"))
    }

    async fn finish_run(&self, completion: RunCompletion) -> Result<Run> {
        let error_details = if completion.error_details.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&completion.error_details).map_err(|e| {
                EtlError::checkpoint("Failed to serialize error details").with_source(e)
            })?)
        };

        let run = sqlx::query_as::<_, Run>(
            r#"
            UPDATE etl_runs
            SET status = $2,
                completed_at = NOW(),
                duration_secs = EXTRACT(EPOCH FROM (NOW() - started_at))::float8,
                records_extracted = $3,
                records_transformed = $4,
                records_loaded = $5,
                records_failed = $6,
                watermark_after = $7,
                error_message = $8,
                error_details = $9
            WHERE run_id = $1
            RETURNING *
            "#,
        )
        .bind(completion.run_id)
        .bind(completion.status.as_str())
        .bind(completion.records_extracted)
        .bind(completion.records_transformed)
        .bind(completion.records_loaded)
        .bind(completion.records_failed)
        .bind(&completion.watermark_after)
        .bind(&completion.error_message)
        .bind(error_details)
        .fetch_optional(&self.pool)
        .await
        .map_err(checkpoint_err("finish_run"))?;

        run.ok_or_else(|| {
            EtlError::checkpoint("Run not found").with_context("run_id", completion.run_id)
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        sqlx::query_as::<_, Run>("SELECT * FROM etl_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(checkpoint_err("get_run"))
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        sqlx::query_as::<_, Run>("SELECT * FROM etl_runs ORDER BY started_at DESC LIMIT $1")
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(checkpoint_err("recent_runs"))
    }
}
