//! Shared helpers for etl-ingest integration tests
//!
//! - [`ScriptedSource`]: a source client that replays canned fetch results
//! - [`FlakyStore`]: wraps [`MemoryStore`] and injects persistence failures
//! - [`TestPostgres`]: a migrated Postgres container
#![allow(dead_code)]

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::{EtlError, Result};
use etl_ingest::models::{
    Checkpoint, CheckpointAdvance, NewRawRecord, NormalizedItem, Payload, RawRecord, Run,
    RunCompletion, SourceKind, UnifiedItem, WatermarkType,
};
use etl_ingest::source::{field_text, field_timestamp, SourceClient};
use etl_ingest::store::{
    CheckpointStore, ItemStore, MemoryStore, PgStore, RawRecordStore, RunStore,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};
use uuid::Uuid;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,etl_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Scripted source
// ============================================================================

/// Source client that returns queued fetch results in order and records the
/// watermark it was asked for each time. An exhausted script yields nothing.
pub struct ScriptedSource {
    kind: SourceKind,
    name: String,
    watermark_type: WatermarkType,
    script: VecDeque<Result<Vec<Payload>>>,
    pub requested: Vec<Option<String>>,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            kind: SourceKind::Api,
            name: name.to_string(),
            watermark_type: WatermarkType::Id,
            script: VecDeque::new(),
            requested: Vec::new(),
        }
    }

    pub fn with_watermark_type(mut self, watermark_type: WatermarkType) -> Self {
        self.watermark_type = watermark_type;
        self
    }

    pub fn then_return(mut self, payloads: Vec<Payload>) -> Self {
        self.script.push_back(Ok(payloads));
        self
    }

    pub fn then_fail(mut self, error: EtlError) -> Self {
        self.script.push_back(Err(error));
        self
    }

    pub fn push(&mut self, payloads: Vec<Payload>) {
        self.script.push_back(Ok(payloads));
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn watermark_type(&self) -> WatermarkType {
        self.watermark_type
    }

    async fn fetch(&mut self, watermark: Option<&str>) -> Result<Vec<Payload>> {
        self.requested.push(watermark.map(str::to_string));
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn external_id(&self, payload: &Payload) -> String {
        field_text(payload, "id").unwrap_or_default()
    }

    fn extract_timestamp(&self, payload: &Payload) -> Option<DateTime<Utc>> {
        field_timestamp(payload, "created_at")
    }
}

// ============================================================================
// Failure-injecting store
// ============================================================================

/// [`MemoryStore`] with switchable failures on the write paths
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_upsert: AtomicBool,
    fail_append: AtomicBool,
    fail_advance: AtomicBool,
    fail_finish: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upsert(&self, fail: bool) {
        self.fail_upsert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }

    pub fn fail_advance(&self, fail: bool) {
        self.fail_advance.store(fail, Ordering::SeqCst);
    }

    pub fn fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }

    pub async fn items(&self) -> Vec<UnifiedItem> {
        self.inner.items().await
    }

    pub async fn raw_records(&self) -> Vec<RawRecord> {
        self.inner.raw_records().await
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn get_checkpoint(&self, kind: SourceKind, name: &str) -> Result<Option<Checkpoint>> {
        self.inner.get_checkpoint(kind, name).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints().await
    }

    async fn mark_running(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_type: WatermarkType,
    ) -> Result<Checkpoint> {
        self.inner.mark_running(kind, name, watermark_type).await
    }

    async fn advance(&self, update: CheckpointAdvance) -> Result<Checkpoint> {
        if self.fail_advance.load(Ordering::SeqCst) {
            return Err(EtlError::checkpoint("injected checkpoint failure"));
        }
        self.inner.advance(update).await
    }
}

#[async_trait]
impl RawRecordStore for FlakyStore {
    async fn append_raw(
        &self,
        kind: SourceKind,
        name: &str,
        run_id: Uuid,
        records: Vec<NewRawRecord>,
    ) -> Result<u64> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(EtlError::load("injected raw append failure"));
        }
        self.inner.append_raw(kind, name, run_id, records).await
    }

    async fn fetch_unprocessed(
        &self,
        kind: SourceKind,
        name: &str,
        limit: i64,
    ) -> Result<Vec<RawRecord>> {
        self.inner.fetch_unprocessed(kind, name, limit).await
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        self.inner.mark_processed(ids).await
    }

    async fn count_unprocessed(&self, kind: SourceKind, name: &str) -> Result<i64> {
        self.inner.count_unprocessed(kind, name).await
    }
}

#[async_trait]
impl ItemStore for FlakyStore {
    async fn upsert_items(&self, items: &[NormalizedItem], run_id: Uuid) -> Result<u64> {
        if self.fail_upsert.load(Ordering::SeqCst) {
            return Err(EtlError::load("injected upsert failure"));
        }
        self.inner.upsert_items(items, run_id).await
    }

    async fn get_item(
        &self,
        kind: SourceKind,
        name: &str,
        external_id: &str,
    ) -> Result<Option<UnifiedItem>> {
        self.inner.get_item(kind, name, external_id).await
    }

    async fn count_items(&self, kind: SourceKind, name: &str) -> Result<i64> {
        self.inner.count_items(kind, name).await
    }
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn start_run(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_before: Option<String>,
    ) -> Result<Run> {
        self.inner.start_run(kind, name, watermark_before).await
    }

    async fn finish_run(&self, completion: RunCompletion) -> Result<Run> {
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(EtlError::checkpoint("injected finish failure"));
        }
        self.inner.finish_run(completion).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        self.inner.recent_runs(limit).await
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> AnyResult<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        etl_ingest::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { container, pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self) -> Arc<PgStore> {
        Arc::new(PgStore::new(self.pool.clone()))
    }
}
