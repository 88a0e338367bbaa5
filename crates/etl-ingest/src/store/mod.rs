//! Persistence interfaces
//!
//! The orchestrator only talks to these traits. [`PgStore`] is the production
//! backend; [`MemoryStore`] backs unit and property tests.

use async_trait::async_trait;
use etl_common::Result;
use uuid::Uuid;

use crate::models::{
    Checkpoint, CheckpointAdvance, NewRawRecord, NormalizedItem, RawRecord, Run, RunCompletion,
    SourceKind, UnifiedItem, WatermarkType,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Per-source checkpoint persistence
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, kind: SourceKind, name: &str) -> Result<Option<Checkpoint>>;

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;

    /// Create the checkpoint if absent and flag it running.
    ///
    /// Watermark and totals are left untouched.
    async fn mark_running(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_type: WatermarkType,
    ) -> Result<Checkpoint>;

    /// Write the terminal state of a run in one atomic step.
    ///
    /// Increments `total_runs`, adds `records_processed` to the running
    /// total and stamps `last_success_at` or `last_failure_at`.
    async fn advance(&self, update: CheckpointAdvance) -> Result<Checkpoint>;
}

/// Append-only raw payload storage
#[async_trait]
pub trait RawRecordStore: Send + Sync {
    /// Persist fetched payloads, skipping any whose content hash already
    /// sits unprocessed for the same source. Returns the number written.
    async fn append_raw(
        &self,
        kind: SourceKind,
        name: &str,
        run_id: Uuid,
        records: Vec<NewRawRecord>,
    ) -> Result<u64>;

    /// Unprocessed records for a source, oldest first.
    async fn fetch_unprocessed(
        &self,
        kind: SourceKind,
        name: &str,
        limit: i64,
    ) -> Result<Vec<RawRecord>>;

    async fn mark_processed(&self, ids: &[i64]) -> Result<u64>;

    async fn count_unprocessed(&self, kind: SourceKind, name: &str) -> Result<i64>;
}

/// Unified item storage with upsert semantics
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or update every item in a single transaction.
    ///
    /// Either all items are written or none are.
    async fn upsert_items(&self, items: &[NormalizedItem], run_id: Uuid) -> Result<u64>;

    async fn get_item(
        &self,
        kind: SourceKind,
        name: &str,
        external_id: &str,
    ) -> Result<Option<UnifiedItem>>;

    async fn count_items(&self, kind: SourceKind, name: &str) -> Result<i64>;
}

/// Run audit trail
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn start_run(
        &self,
        kind: SourceKind,
        name: &str,
        watermark_before: Option<String>,
    ) -> Result<Run>;

    async fn finish_run(&self, completion: RunCompletion) -> Result<Run>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>>;
}

/// Everything the orchestrator needs from storage
pub trait PipelineStore: CheckpointStore + RawRecordStore + ItemStore + RunStore {}

impl<T> PipelineStore for T where T: CheckpointStore + RawRecordStore + ItemStore + RunStore {}
