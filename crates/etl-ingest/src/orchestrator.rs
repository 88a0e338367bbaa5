//! Run orchestrator
//!
//! One call to [`RunOrchestrator::run`] performs a single pass for one
//! source:
//!
//! 1. flag the checkpoint running and open a Run
//! 2. fetch payloads past the current watermark
//! 3. persist them as raw records
//! 4. sweep every unprocessed raw record for the source (bounded)
//! 5. normalize each record, setting failures aside
//! 6. upsert the normalized batch
//! 7. mark the loaded raw records processed
//! 8. finish the Run and advance the checkpoint
//!
//! Extraction and load failures leave the watermark where it was. Per-record
//! normalization failures make the run PARTIAL and leave those raw records
//! for the next sweep.

use chrono::{DateTime, Utc};
use etl_common::checksum::payload_hash;
use etl_common::{EtlError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, DEFAULT_MAX_ERROR_DETAILS, DEFAULT_SWEEP_LIMIT};
use crate::loader::Loader;
use crate::models::{
    CheckpointAdvance, NewRawRecord, RecordFailure, RunCompletion, RunStatus, SourceKind,
    WatermarkType,
};
use crate::normalizer::normalize_record;
use crate::source::SourceClient;
use crate::store::PipelineStore;

/// Outcome of one run, returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_kind: SourceKind,
    pub source_name: String,
    pub status: RunStatus,
    pub records_extracted: i64,
    pub records_transformed: i64,
    pub records_loaded: i64,
    pub records_failed: i64,
    pub watermark_before: Option<String>,
    pub watermark_after: Option<String>,
    pub failures: Vec<RecordFailure>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Counters accumulated while a run progresses
#[derive(Debug, Default)]
struct Progress {
    extracted: i64,
    transformed: i64,
    loaded: i64,
    failed: i64,
    failures: Vec<RecordFailure>,
}

/// Identity of the run in flight
struct RunContext {
    kind: SourceKind,
    name: String,
    watermark_type: WatermarkType,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    watermark_before: Option<String>,
    clock: Instant,
}

/// Terminal state reached by a run that did not error
struct Completed {
    status: RunStatus,
    watermark_after: Option<String>,
}

pub struct RunOrchestrator<S: PipelineStore + ?Sized> {
    store: Arc<S>,
    loader: Loader<S>,
    sweep_limit: i64,
    max_error_details: usize,
}

impl<S: PipelineStore + ?Sized> RunOrchestrator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            loader: Loader::new(store.clone()),
            store,
            sweep_limit: DEFAULT_SWEEP_LIMIT,
            max_error_details: DEFAULT_MAX_ERROR_DETAILS,
        }
    }

    pub fn from_config(store: Arc<S>, config: &PipelineConfig) -> Self {
        Self::new(store)
            .with_batch_size(config.batch_size)
            .with_sweep_limit(config.sweep_limit)
            .with_max_error_details(config.max_error_details)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.loader = self.loader.with_batch_size(batch_size);
        self
    }

    pub fn with_sweep_limit(mut self, sweep_limit: i64) -> Self {
        self.sweep_limit = sweep_limit.max(1);
        self
    }

    pub fn with_max_error_details(mut self, max_error_details: usize) -> Self {
        self.max_error_details = max_error_details;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run the pipeline once for `source`.
    #[tracing::instrument(skip(self, source), fields(source_kind = %source.kind(), source_name = %source.name()))]
    pub async fn run(&self, source: &mut dyn SourceClient) -> Result<RunSummary> {
        let kind = source.kind();
        let name = source.name().to_string();
        let clock = Instant::now();

        let checkpoint = self.store.get_checkpoint(kind, &name).await?;
        if checkpoint.as_ref().is_some_and(|c| c.is_running()) {
            warn!("Previous run did not finish cleanly, resuming from its checkpoint");
        }
        let watermark_before = checkpoint
            .as_ref()
            .and_then(|c| c.watermark())
            .map(str::to_string);

        self.store.mark_running(kind, &name, source.watermark_type()).await?;
        let run = self.store.start_run(kind, &name, watermark_before.clone()).await?;
        info!(
            run_id = %run.run_id,
            watermark = watermark_before.as_deref().unwrap_or("<none>"),
            "Run started"
        );

        let ctx = RunContext {
            kind,
            name,
            watermark_type: source.watermark_type(),
            run_id: run.run_id,
            started_at: run.started_at,
            watermark_before,
            clock,
        };

        let mut progress = Progress::default();
        let result = match self
            .execute(source, ctx.run_id, ctx.watermark_before.as_deref(), &mut progress)
            .await
        {
            Ok(completed) => self
                .finalize(&ctx, &completed, &progress)
                .await
                .map(|()| completed),
            Err(err) => Err(err),
        };

        match result {
            Ok(completed) => Ok(Self::summarize(ctx, completed, progress)),
            Err(err) => {
                let err = err
                    .with_context("source_kind", ctx.kind)
                    .with_context("source_name", &ctx.name)
                    .with_context("run_id", ctx.run_id)
                    .with_context("records_extracted", progress.extracted)
                    .with_context("records_loaded", progress.loaded);
                self.fail(ctx, &err, progress).await;
                Err(err)
            },
        }
    }

    /// Phases 2-7. Counters land in `progress` as they become known.
    async fn execute(
        &self,
        source: &mut dyn SourceClient,
        run_id: Uuid,
        watermark: Option<&str>,
        progress: &mut Progress,
    ) -> Result<Completed> {
        let kind = source.kind();
        let name = source.name().to_string();

        let payloads = source.fetch(watermark).await?;
        progress.extracted = payloads.len() as i64;
        info!(run_id = %run_id, extracted = progress.extracted, "Extraction finished");

        if payloads.is_empty() {
            return Ok(Completed {
                status: RunStatus::Success,
                watermark_after: watermark.map(str::to_string),
            });
        }

        let watermark_after = source.next_watermark(&payloads, watermark);

        let raw: Vec<NewRawRecord> = payloads
            .into_iter()
            .map(|payload| {
                let id = source.external_id(&payload);
                NewRawRecord {
                    source_id: (!id.is_empty()).then_some(id),
                    content_hash: payload_hash(&payload),
                    payload,
                }
            })
            .collect();
        let appended = self.store.append_raw(kind, &name, run_id, raw).await?;

        let pending = self.store.fetch_unprocessed(kind, &name, self.sweep_limit).await?;
        info!(
            run_id = %run_id,
            appended,
            pending = pending.len(),
            "Raw records persisted"
        );

        let mut items = Vec::with_capacity(pending.len());
        for record in &pending {
            match normalize_record(record) {
                Ok(item) => items.push(item),
                Err(err) => {
                    progress.failed += 1;
                    warn!(run_id = %run_id, raw_record_id = record.id, error = %err, "Record failed normalization");
                    if progress.failures.len() < self.max_error_details {
                        progress.failures.push(RecordFailure {
                            raw_record_id: record.id,
                            error: err.to_string(),
                        });
                    }
                },
            }
        }
        progress.transformed = items.len() as i64;

        let loaded = self.loader.upsert_batched(&items, run_id).await?;
        progress.loaded = loaded as i64;

        let processed: Vec<i64> = items.iter().map(|item| item.raw_record_id).collect();
        self.store.mark_processed(&processed).await?;

        let status = if progress.failed == 0 {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };

        Ok(Completed {
            status,
            watermark_after,
        })
    }

    /// Record the terminal state of a run that did not error.
    ///
    /// Any error here sends the run down the failure path, so the Run ends
    /// FAILED even when it was already written with its success status.
    async fn finalize(&self, ctx: &RunContext, completed: &Completed, progress: &Progress) -> Result<()> {
        let run_id = ctx.run_id;
        self.store
            .finish_run(RunCompletion {
                run_id,
                status: completed.status,
                records_extracted: progress.extracted,
                records_transformed: progress.transformed,
                records_loaded: progress.loaded,
                records_failed: progress.failed,
                watermark_after: completed.watermark_after.clone(),
                error_message: None,
                error_details: progress.failures.clone(),
            })
            .await
            .map_err(|e| {
                error!(run_id = %run_id, error = %e, "Failed to finish run");
                e
            })?;

        self.store
            .advance(CheckpointAdvance {
                source_kind: ctx.kind,
                source_name: ctx.name.clone(),
                watermark_type: ctx.watermark_type,
                watermark_value: completed.watermark_after.clone(),
                status: completed.status,
                records_processed: progress.loaded,
                error_message: None,
            })
            .await
            .map_err(|e| {
                error!(run_id = %run_id, error = %e, "Failed to advance checkpoint");
                e
            })?;

        Ok(())
    }

    fn summarize(ctx: RunContext, completed: Completed, progress: Progress) -> RunSummary {
        info!(
            run_id = %ctx.run_id,
            status = %completed.status,
            extracted = progress.extracted,
            loaded = progress.loaded,
            failed = progress.failed,
            watermark = completed.watermark_after.as_deref().unwrap_or("<none>"),
            "Run finished"
        );

        RunSummary {
            run_id: ctx.run_id,
            source_kind: ctx.kind,
            source_name: ctx.name,
            status: completed.status,
            records_extracted: progress.extracted,
            records_transformed: progress.transformed,
            records_loaded: progress.loaded,
            records_failed: progress.failed,
            watermark_before: ctx.watermark_before,
            watermark_after: completed.watermark_after,
            failures: progress.failures,
            started_at: ctx.started_at,
            duration: ctx.clock.elapsed(),
        }
    }

    /// Record a failed run. The watermark is written back unchanged.
    async fn fail(&self, ctx: RunContext, err: &EtlError, progress: Progress) {
        let run_id = ctx.run_id;
        error!(
            run_id = %run_id,
            kind = %err.kind(),
            retryable = err.is_retryable(),
            error = %err,
            "Run failed"
        );
        let message = err.to_string();

        let finished = self
            .store
            .finish_run(RunCompletion {
                run_id,
                status: RunStatus::Failed,
                records_extracted: progress.extracted,
                records_transformed: progress.transformed,
                records_loaded: progress.loaded,
                records_failed: progress.failed,
                watermark_after: ctx.watermark_before.clone(),
                error_message: Some(message.clone()),
                error_details: progress.failures,
            })
            .await;
        if let Err(e) = finished {
            error!(run_id = %run_id, error = %e, "Failed to record run failure");
        }

        let advanced = self
            .store
            .advance(CheckpointAdvance {
                source_kind: ctx.kind,
                source_name: ctx.name,
                watermark_type: ctx.watermark_type,
                watermark_value: ctx.watermark_before,
                status: RunStatus::Failed,
                records_processed: 0,
                error_message: Some(message),
            })
            .await;
        if let Err(e) = advanced {
            error!(run_id = %run_id, error = %e, "Failed to record checkpoint failure");
        }
    }
}
